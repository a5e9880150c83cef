/// Field schema for presets.
///
/// The built-in schema lives in `fields.toml` next to this module; build.rs
/// checks its structure at compile time and it is parsed once on first use.
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

use crate::engine::core::FieldValue;
use crate::engine::validate::FieldConstraint;

const BUILTIN_SCHEMA: &str = include_str!("fields.toml");

static BUILTIN: LazyLock<Schema> = LazyLock::new(|| {
    Schema::from_toml(BUILTIN_SCHEMA).expect("built-in fields.toml is checked by build.rs")
});

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to parse field schema: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate field key '{0}'")]
    DuplicateKey(String),
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    fields: Vec<FieldConstraint>,
}

/// Ordered set of field constraints
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    fields: Vec<FieldConstraint>,
}

impl Schema {
    /// The schema shipped with the crate
    pub fn builtin() -> &'static Schema {
        &BUILTIN
    }

    pub fn new(fields: Vec<FieldConstraint>) -> Result<Self, SchemaError> {
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.key == field.key) {
                return Err(SchemaError::DuplicateKey(field.key.clone()));
            }
        }
        Ok(Self { fields })
    }

    pub fn from_toml(contents: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = toml::from_str(contents)?;
        Self::new(file.fields)
    }

    pub fn get(&self, key: &str) -> Option<&FieldConstraint> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn constraints(&self) -> impl Iterator<Item = &FieldConstraint> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.key.as_str())
    }

    /// Field values of the default preset
    pub fn default_fields(&self) -> BTreeMap<String, FieldValue> {
        self.fields
            .iter()
            .filter_map(|f| f.default.clone().map(|v| (f.key.clone(), v)))
            .collect()
    }
}
