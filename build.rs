use serde::Deserialize;
use std::collections::HashSet;
use std::fs;

const SCHEMA_PATH: &str = "src/engine/schema/fields.toml";

#[derive(Debug, Deserialize)]
struct SchemaFile {
    meta: Meta,
    fields: Vec<FieldEntry>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    schema_version: String,
}

#[derive(Debug, Deserialize)]
struct FieldEntry {
    key: String,
    kind: String,
    #[serde(default)]
    required: bool,
    min: Option<f64>,
    max: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    default: Option<toml::Value>,
    description: Option<String>,
}

fn main() {
    // Tell Cargo to rerun if the field schema changes
    println!("cargo:rerun-if-changed={}", SCHEMA_PATH);

    let contents = fs::read_to_string(SCHEMA_PATH).expect("Failed to read fields.toml");
    let schema: SchemaFile = toml::from_str(&contents).expect("Failed to parse fields.toml");

    validate_schema(&schema);
}

/// Validate the field schema structure at build time
fn validate_schema(schema: &SchemaFile) {
    assert!(
        !schema.meta.schema_version.is_empty(),
        "Missing schema_version in [meta]"
    );
    assert!(!schema.fields.is_empty(), "Must have at least one field defined");

    let mut keys = HashSet::new();

    for field in &schema.fields {
        let key = field.key.as_str();
        assert!(!key.is_empty(), "Field must have a non-empty 'key'");
        assert!(keys.insert(key), "Duplicate field key: {}", key);
        assert!(
            field.description.is_some(),
            "Field '{}' missing 'description'",
            key
        );

        match field.kind.as_str() {
            "number" => {
                assert!(
                    field.min_length.is_none() && field.max_length.is_none(),
                    "Number field '{}' cannot have length bounds",
                    key
                );
                if let (Some(min), Some(max)) = (field.min, field.max) {
                    assert!(
                        min <= max,
                        "Field '{}' has invalid range: min ({}) > max ({})",
                        key,
                        min,
                        max
                    );
                }
                if let Some(default) = &field.default {
                    let value = default
                        .as_float()
                        .or_else(|| default.as_integer().map(|v| v as f64))
                        .unwrap_or_else(|| panic!("Field '{}' default must be a number", key));
                    if let Some(min) = field.min {
                        assert!(value >= min, "Field '{}' default below min", key);
                    }
                    if let Some(max) = field.max {
                        assert!(value <= max, "Field '{}' default above max", key);
                    }
                }
            }
            "text" => {
                assert!(
                    field.min.is_none() && field.max.is_none(),
                    "Text field '{}' cannot have value bounds",
                    key
                );
                if let (Some(min), Some(max)) = (field.min_length, field.max_length) {
                    assert!(
                        min <= max,
                        "Field '{}' has invalid length range: min ({}) > max ({})",
                        key,
                        min,
                        max
                    );
                }
                if let Some(default) = &field.default {
                    assert!(
                        default.as_str().is_some(),
                        "Field '{}' default must be a string",
                        key
                    );
                }
            }
            other => panic!("Field '{}' has unknown kind '{}'", key, other),
        }

        if field.required {
            assert!(
                field.default.is_some(),
                "Required field '{}' must have a default",
                key
            );
        }
    }
}
