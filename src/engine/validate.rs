//! Rule-based validation of preset fields against their constraints.
//!
//! Rules run in a fixed order and stop at the first failure:
//! required, minimum, maximum, minimum length, maximum length, format.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::engine::core::FieldValue;
use crate::engine::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Required,
    BelowMinimum,
    AboveMaximum,
    TooShort,
    TooLong,
    InvalidFormat,
    UnknownField,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Required => "required",
            ErrorKind::BelowMinimum => "below minimum",
            ErrorKind::AboveMaximum => "above maximum",
            ErrorKind::TooShort => "too short",
            ErrorKind::TooLong => "too long",
            ErrorKind::InvalidFormat => "invalid format",
            ErrorKind::UnknownField => "unknown field",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Number,
    Text,
}

/// Compiled `format_pattern`
#[derive(Debug, Clone)]
pub struct FormatPattern(Regex);

impl FormatPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(FormatPattern)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl PartialEq for FormatPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for FormatPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FormatPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        FormatPattern::new(&pattern).map_err(serde::de::Error::custom)
    }
}

/// Static constraint for one preset field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraint {
    pub key: String,
    pub kind: FieldKind,
    #[serde(default, rename = "min")]
    pub min_value: Option<f64>,
    #[serde(default, rename = "max")]
    pub max_value: Option<f64>,
    /// Unit quoted in range messages (e.g. "s")
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "format")]
    pub format_pattern: Option<FormatPattern>,
    #[serde(default)]
    pub default: Option<FieldValue>,
    #[serde(default)]
    pub description: String,
}

impl FieldConstraint {
    pub fn number(key: &str) -> Self {
        Self::new(key, FieldKind::Number)
    }

    pub fn text(key: &str) -> Self {
        Self::new(key, FieldKind::Text)
    }

    fn new(key: &str, kind: FieldKind) -> Self {
        Self {
            key: key.to_string(),
            kind,
            min_value: None,
            max_value: None,
            unit: None,
            min_length: None,
            max_length: None,
            required: false,
            format_pattern: None,
            default: None,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn length(mut self, min: usize, max: usize) -> Self {
        self.min_length = Some(min);
        self.max_length = Some(max);
        self
    }

    /// Panics on an invalid pattern; meant for literals
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.format_pattern = Some(FormatPattern::new(pattern).expect("invalid format pattern"));
        self
    }

    fn with_unit(&self, value: f64) -> String {
        match &self.unit {
            Some(unit) => format!("{} {}", value, unit),
            None => value.to_string(),
        }
    }
}

/// Outcome of validating one field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub field: String,
    pub ok: bool,
    pub error_kind: Option<ErrorKind>,
    pub message: String,
}

impl ValidationResult {
    fn pass(field: &str) -> Self {
        Self {
            field: field.to_string(),
            ok: true,
            error_kind: None,
            message: String::new(),
        }
    }

    fn fail(field: &str, kind: ErrorKind, message: String) -> Self {
        Self {
            field: field.to_string(),
            ok: false,
            error_kind: Some(kind),
            message,
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ok {
            write!(f, "{}: ok", self.field)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Validate a single field value against its constraint.
///
/// `value` is `None` when the field is absent. Pure and deterministic.
pub fn validate(
    field_key: &str,
    value: Option<&FieldValue>,
    constraint: &FieldConstraint,
) -> ValidationResult {
    // 1. Required
    let value = match value {
        None => {
            return if constraint.required {
                ValidationResult::fail(
                    field_key,
                    ErrorKind::Required,
                    format!("{} is required", field_key),
                )
            } else {
                ValidationResult::pass(field_key)
            };
        }
        Some(FieldValue::Text(s)) if s.trim().is_empty() => {
            return if constraint.required {
                ValidationResult::fail(
                    field_key,
                    ErrorKind::Required,
                    format!("{} must not be empty", field_key),
                )
            } else {
                ValidationResult::pass(field_key)
            };
        }
        Some(v) => v,
    };

    // Kind mismatch can't be checked against ranges or lengths
    match (constraint.kind, value) {
        (FieldKind::Number, FieldValue::Number(n)) if !n.is_finite() => {
            return ValidationResult::fail(
                field_key,
                ErrorKind::InvalidFormat,
                format!("{} must be a finite number", field_key),
            );
        }
        (FieldKind::Number, FieldValue::Text(_)) => {
            return ValidationResult::fail(
                field_key,
                ErrorKind::InvalidFormat,
                format!("{} must be a number", field_key),
            );
        }
        (FieldKind::Text, FieldValue::Number(_)) => {
            return ValidationResult::fail(
                field_key,
                ErrorKind::InvalidFormat,
                format!("{} must be text", field_key),
            );
        }
        _ => {}
    }

    if let FieldValue::Number(n) = value {
        // 2. Minimum
        if let Some(min) = constraint.min_value {
            if *n < min {
                return ValidationResult::fail(
                    field_key,
                    ErrorKind::BelowMinimum,
                    format!(
                        "{} must be at least {}",
                        field_key,
                        constraint.with_unit(min)
                    ),
                );
            }
        }
        // 3. Maximum
        if let Some(max) = constraint.max_value {
            if *n > max {
                return ValidationResult::fail(
                    field_key,
                    ErrorKind::AboveMaximum,
                    format!(
                        "{} must be at most {}",
                        field_key,
                        constraint.with_unit(max)
                    ),
                );
            }
        }
    }

    if let FieldValue::Text(s) = value {
        let len = s.chars().count();
        // 4. Minimum length
        if let Some(min) = constraint.min_length {
            if len < min {
                return ValidationResult::fail(
                    field_key,
                    ErrorKind::TooShort,
                    format!("{} must be at least {} characters", field_key, min),
                );
            }
        }
        // 5. Maximum length
        if let Some(max) = constraint.max_length {
            if len > max {
                return ValidationResult::fail(
                    field_key,
                    ErrorKind::TooLong,
                    format!("{} must be at most {} characters", field_key, max),
                );
            }
        }
    }

    // 6. Format
    if let Some(pattern) = &constraint.format_pattern {
        if !pattern.is_match(&value.to_string()) {
            return ValidationResult::fail(
                field_key,
                ErrorKind::InvalidFormat,
                format!("{} does not match {}", field_key, pattern.as_str()),
            );
        }
    }

    ValidationResult::pass(field_key)
}

/// Every failed field of a full validation pass
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", summarize(.0))]
pub struct ValidationErrors(pub Vec<ValidationResult>);

impl ValidationErrors {
    pub fn kind_of(&self, field: &str) -> Option<ErrorKind> {
        self.0
            .iter()
            .find(|r| r.field == field)
            .and_then(|r| r.error_kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationResult> {
        self.0.iter()
    }
}

fn summarize(results: &[ValidationResult]) -> String {
    results
        .iter()
        .map(|r| r.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate a full field set (e.g. a preset before it is saved).
///
/// Every schema field is checked, then keys the schema doesn't know.
pub fn validate_fields(
    fields: &BTreeMap<String, FieldValue>,
    schema: &Schema,
) -> Result<(), ValidationErrors> {
    let mut errors: Vec<ValidationResult> = schema
        .constraints()
        .map(|c| validate(&c.key, fields.get(&c.key), c))
        .filter(|r| !r.ok)
        .collect();

    for key in fields.keys() {
        if schema.get(key).is_none() {
            errors.push(ValidationResult::fail(
                key,
                ErrorKind::UnknownField,
                format!("{} is not a known field", key),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}
