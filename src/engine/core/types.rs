use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use super::geometry::Geometry;
use crate::engine::registry::ChannelDescriptor;

/// File format an export job is encoded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    Obj,
    Gltf,
}

impl FormatTag {
    pub const ALL: [FormatTag; 2] = [FormatTag::Obj, FormatTag::Gltf];

    /// File extension used for staged exports
    pub fn extension(self) -> &'static str {
        match self {
            FormatTag::Obj => "obj",
            FormatTag::Gltf => "gltf",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatTag::Obj => write!(f, "OBJ"),
            FormatTag::Gltf => write!(f, "glTF"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown format '{0}' (expected obj or gltf)")]
pub struct UnknownFormat(pub String);

impl FromStr for FormatTag {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "obj" => Ok(FormatTag::Obj),
            "gltf" => Ok(FormatTag::Gltf),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

/// Typed value of a preset field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Number(_) => None,
        }
    }

    /// Parse user input: anything that reads as a number becomes `Number`
    pub fn parse(input: &str) -> Self {
        match input.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => FieldValue::Number(n),
            _ => FieldValue::Text(input.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// Why an export job failed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobFailure {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("no running peer found for channel '{0}'")]
    NotFound(String),

    #[error("format {0} is not supported")]
    UnsupportedFormat(FormatTag),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("peer rejected the transfer: {0}")]
    Rejected(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Encoding,
    Sending,
    Done,
    Failed(JobFailure),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed(_))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Encoding => write!(f, "encoding"),
            JobStatus::Sending => write!(f, "sending"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// One request to encode geometry and transmit it to a peer
#[derive(Debug)]
pub struct ExportJob {
    pub id: Uuid,
    pub target: ChannelDescriptor,
    pub format: FormatTag,
    /// Owned by the job until it is moved into the encoder
    pub payload: Option<Geometry>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Local>,
}

impl ExportJob {
    /// Create a new pending job
    pub fn new(target: ChannelDescriptor, format: FormatTag, payload: Geometry) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            format,
            payload: Some(payload),
            status: JobStatus::Pending,
            submitted_at: Local::now(),
        }
    }

    /// Terminal report for this job
    pub fn report(&self, bytes_sent: u64) -> JobReport {
        JobReport {
            id: self.id,
            channel: self.target.id.clone(),
            format: self.format,
            status: self.status.clone(),
            bytes_sent,
            submitted_at: self.submitted_at,
            finished_at: Local::now(),
        }
    }
}

/// What the caller gets back once a job reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub id: Uuid,
    pub channel: String,
    pub format: FormatTag,
    pub status: JobStatus,
    pub bytes_sent: u64,
    pub submitted_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl JobReport {
    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.status {
            JobStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}
