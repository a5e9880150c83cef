// Integration tests for preset save/rename/delete workflows
//
// Covers the store's invariants (one default, one active) and that every
// mutation survives a reopen of the preset file.

use fc_channels::engine::{
    DEFAULT_PRESET_NAME, ErrorKind, FieldValue, PresetError, PresetStore, Schema, ServiceSettings,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn with(store: &PresetStore, key: &str, value: FieldValue) -> BTreeMap<String, FieldValue> {
    let mut fields = store.get_active().fields.clone();
    fields.insert(key.to_string(), value);
    fields
}

#[test]
fn test_new_store_has_single_default() {
    let store = PresetStore::in_memory(Schema::builtin());
    assert_eq!(store.list(), vec![DEFAULT_PRESET_NAME.to_string()]);
    assert!(store.get_active().is_default);
    assert_eq!(store.get_active().fields, Schema::builtin().default_fields());
}

#[test]
fn test_save_as_then_delete_returns_to_default() {
    let store = PresetStore::in_memory(Schema::builtin());
    store
        .save_as("Studio", with(&store, "queue_size", FieldValue::Number(5.0)))
        .unwrap();
    store.set_active("Studio").unwrap();
    assert_eq!(store.get_active().number("queue_size"), Some(5.0));

    store.delete("Studio").unwrap();
    assert_eq!(store.get_active().name, DEFAULT_PRESET_NAME);
    assert_eq!(store.list(), vec![DEFAULT_PRESET_NAME.to_string()]);
}

#[test]
fn test_default_preset_is_protected() {
    let store = PresetStore::in_memory(Schema::builtin());
    assert!(matches!(
        store.delete(DEFAULT_PRESET_NAME),
        Err(PresetError::CannotDeleteDefault(_))
    ));
    assert!(matches!(
        store.rename(DEFAULT_PRESET_NAME, "Mine"),
        Err(PresetError::CannotRenameDefault(_))
    ));
    assert_eq!(store.list(), vec![DEFAULT_PRESET_NAME.to_string()]);
}

#[test]
fn test_rename_keeps_active_selection() {
    let store = PresetStore::in_memory(Schema::builtin());
    store
        .save_as("Draft", store.get_active().fields.clone())
        .unwrap();
    store.set_active("Draft").unwrap();

    store.rename("Draft", "Final").unwrap();
    assert_eq!(store.get_active().name, "Final");
    assert!(store.get("Draft").is_none());

    assert!(matches!(
        store.rename("Final", DEFAULT_PRESET_NAME),
        Err(PresetError::DuplicateName(_))
    ));
}

#[test]
fn test_invalid_fields_leave_store_untouched() {
    let store = PresetStore::in_memory(Schema::builtin());
    let before = store.get_active();

    let err = store
        .update_current(with(&store, "connect_timeout", FieldValue::Number(0.0)))
        .unwrap_err();
    match err {
        PresetError::Invalid(errors) => {
            assert_eq!(errors.kind_of("connect_timeout"), Some(ErrorKind::BelowMinimum));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(store.get_active(), before);
}

#[test]
fn test_every_mutation_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");

    {
        let store = PresetStore::open(&path, Schema::builtin()).unwrap();
        store
            .save_as("Lab", with(&store, "service_name", "LabCAD".into()))
            .unwrap();
        store
            .save_as("Spare", store.get_active().fields.clone())
            .unwrap();
        store.rename("Lab", "Workshop").unwrap();
        store.delete("Spare").unwrap();
        store.set_active("Workshop").unwrap();
        store
            .update_current(with(&store, "drain_timeout", FieldValue::Number(2.5)))
            .unwrap();
    }

    let reopened = PresetStore::open(&path, Schema::builtin()).unwrap();
    assert_eq!(
        reopened.list(),
        vec![DEFAULT_PRESET_NAME.to_string(), "Workshop".to_string()]
    );
    let active = reopened.get_active();
    assert_eq!(active.name, "Workshop");
    assert_eq!(active.text("service_name"), Some("LabCAD"));

    let settings = ServiceSettings::from_preset(&active);
    assert_eq!(settings.service_name, "LabCAD");
    assert_eq!(settings.drain_timeout, Duration::from_millis(2500));
}

#[test]
fn test_corrupt_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(matches!(
        PresetStore::open(&path, Schema::builtin()),
        Err(PresetError::Corrupt { .. })
    ));
}

#[test]
fn test_out_of_range_field_in_file_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");
    PresetStore::open(&path, Schema::builtin()).unwrap();

    let mut file: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    file["presets"][0]["fields"]["drain_timeout"] = serde_json::json!(1e300);
    std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

    match PresetStore::open(&path, Schema::builtin()) {
        Err(PresetError::Corrupt { reason, .. }) => assert!(reason.contains("drain_timeout")),
        other => panic!("expected Corrupt, got {:?}", other.map(|s| s.list())),
    }
}

#[test]
fn test_concurrent_mutations_keep_invariants() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");
    let store = PresetStore::open(&path, Schema::builtin()).unwrap();
    let done = AtomicBool::new(false);

    let writers_ok = thread::scope(|s| {
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = &store;
                s.spawn(move || {
                    for i in 0..10 {
                        let fields = store.default_preset().fields.clone();
                        store.save_as(&format!("P{}-{}", w, i), fields).unwrap();
                        store
                            .rename(&format!("P{}-{}", w, i), &format!("Q{}-{}", w, i))
                            .unwrap();
                        store.set_active(&format!("Q{}-{}", w, i)).unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..2 {
            let (store, done) = (&store, &done);
            s.spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    let names = store.list();
                    assert_eq!(names[0], DEFAULT_PRESET_NAME);
                    let unique: HashSet<&String> = names.iter().collect();
                    assert_eq!(unique.len(), names.len());
                    for name in names.iter().filter(|n| n.starts_with('P')) {
                        assert!(!unique.contains(&name.replacen('P', "Q", 1)));
                    }
                    let active = store.get_active();
                    assert!(store.get(&active.name).is_some());
                }
            });
        }
        let joined: Vec<_> = writers.into_iter().map(|h| h.join()).collect();
        done.store(true, Ordering::Relaxed);
        joined.iter().all(|r| r.is_ok())
    });
    assert!(writers_ok);

    let names = store.list();
    assert_eq!(names.len(), 41);
    assert!(names.iter().skip(1).all(|n| n.starts_with('Q')));

    let reopened = PresetStore::open(&path, Schema::builtin()).unwrap();
    assert_eq!(reopened.list(), names);
    assert_eq!(reopened.get_active().name, store.get_active().name);
}
