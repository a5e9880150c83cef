use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::types::FieldValue;
use crate::engine::schema::Schema;
use crate::engine::validate::{ValidationErrors, validate_fields};

/// Name given to the default preset of a new store
pub const DEFAULT_PRESET_NAME: &str = "Default";

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("a preset named '{0}' already exists")]
    DuplicateName(String),

    #[error("the default preset '{0}' cannot be renamed")]
    CannotRenameDefault(String),

    #[error("the default preset '{0}' cannot be deleted")]
    CannotDeleteDefault(String),

    #[error("preset '{0}' not found")]
    NotFound(String),

    #[error("preset '{0}' already has that name")]
    NameUnchanged(String),

    #[error("preset name must not be empty")]
    EmptyName,

    #[error("invalid preset fields: {0}")]
    Invalid(#[from] ValidationErrors),

    #[error("preset file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to access preset file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Named snapshot of configuration field values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Preset {
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(FieldValue::as_number)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(FieldValue::as_text)
    }
}

/// On-disk layout of the preset file
#[derive(Debug, Serialize, Deserialize)]
struct PresetFile {
    active: String,
    presets: Vec<Preset>,
}

/// Presets plus the active index; the default preset is always first.
#[derive(Debug, Clone)]
struct Snapshot {
    presets: Vec<Arc<Preset>>,
    active: usize,
}

impl Snapshot {
    fn position(&self, name: &str) -> Option<usize> {
        self.presets.iter().position(|p| p.name == name)
    }

    fn to_file(&self) -> PresetFile {
        PresetFile {
            active: self.presets[self.active].name.clone(),
            presets: self.presets.iter().map(|p| (**p).clone()).collect(),
        }
    }
}

/// Store of named presets with exactly one default and one active preset.
///
/// Readers get `Arc<Preset>` snapshots; every mutation builds the next state
/// completely, persists it, and only then swaps it in under the write lock.
#[derive(Debug)]
pub struct PresetStore {
    schema: Schema,
    path: Option<PathBuf>,
    state: RwLock<Snapshot>,
}

impl PresetStore {
    /// Store that lives only in memory
    pub fn in_memory(schema: &Schema) -> Self {
        Self {
            schema: schema.clone(),
            path: None,
            state: RwLock::new(Self::initial_snapshot(schema)),
        }
    }

    /// Open (or create) a store persisted at `path`
    pub fn open(path: &Path, schema: &Schema) -> Result<Self, PresetError> {
        let snapshot = if path.exists() {
            Self::load(path, schema)?
        } else {
            let snapshot = Self::initial_snapshot(schema);
            persist(path, &snapshot)?;
            tracing::info!("Created preset file {}", path.display());
            snapshot
        };

        Ok(Self {
            schema: schema.clone(),
            path: Some(path.to_path_buf()),
            state: RwLock::new(snapshot),
        })
    }

    fn initial_snapshot(schema: &Schema) -> Snapshot {
        let default = Preset {
            name: DEFAULT_PRESET_NAME.to_string(),
            is_default: true,
            fields: schema.default_fields(),
        };
        Snapshot {
            presets: vec![Arc::new(default)],
            active: 0,
        }
    }

    fn load(path: &Path, schema: &Schema) -> Result<Snapshot, PresetError> {
        let corrupt = |reason: String| PresetError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let json = fs::read_to_string(path).map_err(|source| PresetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PresetFile = serde_json::from_str(&json).map_err(|e| corrupt(e.to_string()))?;

        let defaults = file.presets.iter().filter(|p| p.is_default).count();
        if defaults != 1 {
            return Err(corrupt(format!(
                "expected exactly one default preset, found {}",
                defaults
            )));
        }

        let mut presets: Vec<Preset> = Vec::with_capacity(file.presets.len());
        for mut preset in file.presets {
            if presets.iter().any(|p| p.name == preset.name) {
                return Err(corrupt(format!("duplicate preset name '{}'", preset.name)));
            }
            // Fields added to the schema after the file was written
            for (key, value) in schema.default_fields() {
                preset.fields.entry(key).or_insert(value);
            }
            preset.fields.retain(|key, _| {
                let known = schema.get(key).is_some();
                if !known {
                    tracing::warn!("Dropping unknown field '{}' from preset '{}'", key, preset.name);
                }
                known
            });
            validate_fields(&preset.fields, schema)
                .map_err(|e| corrupt(format!("preset '{}': {}", preset.name, e)))?;
            presets.push(preset);
        }

        // Default first, everything else in file order
        if let Some(idx) = presets.iter().position(|p| p.is_default) {
            let default = presets.remove(idx);
            presets.insert(0, default);
        }

        let active = presets
            .iter()
            .position(|p| p.name == file.active)
            .ok_or_else(|| corrupt(format!("active preset '{}' does not exist", file.active)))?;

        tracing::debug!("Loaded {} presets from {}", presets.len(), path.display());

        Ok(Snapshot {
            presets: presets.into_iter().map(Arc::new).collect(),
            active,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Preset names, default first, then insertion order
    pub fn list(&self) -> Vec<String> {
        self.state
            .read()
            .presets
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Preset>> {
        let state = self.state.read();
        state.position(name).map(|i| state.presets[i].clone())
    }

    pub fn get_active(&self) -> Arc<Preset> {
        let state = self.state.read();
        state.presets[state.active].clone()
    }

    pub fn default_preset(&self) -> Arc<Preset> {
        self.state.read().presets[0].clone()
    }

    /// Insert a new preset. The active preset does not change.
    pub fn save_as(
        &self,
        name: &str,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<(), PresetError> {
        if name.trim().is_empty() {
            return Err(PresetError::EmptyName);
        }

        let mut state = self.state.write();
        if state.position(name).is_some() {
            return Err(PresetError::DuplicateName(name.to_string()));
        }
        validate_fields(&fields, &self.schema)?;

        let mut next = state.clone();
        next.presets.push(Arc::new(Preset {
            name: name.to_string(),
            is_default: false,
            fields,
        }));
        self.commit(&mut state, next)?;

        tracing::info!("Saved preset '{}'", name);
        Ok(())
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<(), PresetError> {
        let mut state = self.state.write();
        let idx = state
            .position(old_name)
            .ok_or_else(|| PresetError::NotFound(old_name.to_string()))?;
        if state.presets[idx].is_default {
            return Err(PresetError::CannotRenameDefault(old_name.to_string()));
        }
        if old_name == new_name {
            return Err(PresetError::NameUnchanged(old_name.to_string()));
        }
        if new_name.trim().is_empty() {
            return Err(PresetError::EmptyName);
        }
        if state.position(new_name).is_some() {
            return Err(PresetError::DuplicateName(new_name.to_string()));
        }

        let mut next = state.clone();
        let mut renamed = (*next.presets[idx]).clone();
        renamed.name = new_name.to_string();
        next.presets[idx] = Arc::new(renamed);
        self.commit(&mut state, next)?;

        tracing::info!("Renamed preset '{}' to '{}'", old_name, new_name);
        Ok(())
    }

    /// Delete a preset; if it was active the default becomes active
    pub fn delete(&self, name: &str) -> Result<(), PresetError> {
        let mut state = self.state.write();
        let idx = state
            .position(name)
            .ok_or_else(|| PresetError::NotFound(name.to_string()))?;
        if state.presets[idx].is_default {
            return Err(PresetError::CannotDeleteDefault(name.to_string()));
        }

        let mut next = state.clone();
        next.presets.remove(idx);
        next.active = match next.active {
            active if active == idx => 0,
            active if active > idx => active - 1,
            active => active,
        };
        self.commit(&mut state, next)?;

        tracing::info!("Deleted preset '{}'", name);
        Ok(())
    }

    /// Validate and overwrite the fields of the active preset in place
    pub fn update_current(&self, fields: BTreeMap<String, FieldValue>) -> Result<(), PresetError> {
        validate_fields(&fields, &self.schema)?;

        let mut state = self.state.write();
        let mut next = state.clone();
        let active = next.active;
        let mut updated = (*next.presets[active]).clone();
        updated.fields = fields;
        let name = updated.name.clone();
        next.presets[active] = Arc::new(updated);
        self.commit(&mut state, next)?;

        tracing::info!("Updated preset '{}'", name);
        Ok(())
    }

    pub fn set_active(&self, name: &str) -> Result<(), PresetError> {
        let mut state = self.state.write();
        let idx = state
            .position(name)
            .ok_or_else(|| PresetError::NotFound(name.to_string()))?;
        if idx == state.active {
            return Ok(());
        }

        let mut next = state.clone();
        next.active = idx;
        self.commit(&mut state, next)?;

        tracing::info!("Active preset is now '{}'", name);
        Ok(())
    }

    fn commit(&self, current: &mut Snapshot, next: Snapshot) -> Result<(), PresetError> {
        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        *current = next;
        Ok(())
    }
}

/// Write the snapshot to a temp file next to `path` and rename it into place
fn persist(path: &Path, snapshot: &Snapshot) -> Result<(), PresetError> {
    let io_err = |source: io::Error| PresetError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    let json = serde_json::to_string_pretty(&snapshot.to_file()).map_err(|e| io_err(e.into()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(json.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    Ok(())
}
