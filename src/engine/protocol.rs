//! Wire format between channel services.
//!
//! Every message is one JSON header line terminated by `\n`. An `Import`
//! request is followed by exactly `length` raw body bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Read, Write};
use std::time::Instant;
use thiserror::Error;

use crate::engine::core::{FormatTag, Geometry, JobReport};

/// Largest header line accepted (an inline `Export` payload lives here)
pub const MAX_HEADER_BYTES: u64 = 256 * 1024 * 1024;

/// Largest `Import` body accepted
pub const MAX_BODY_BYTES: u64 = 1024 * 1024 * 1024;

/// Buffer reserved up front for a body; it grows as bytes actually arrive
const BODY_RESERVE: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before a complete message arrived")]
    Closed,

    #[error("message exceeds {0} bytes")]
    TooLarge(u64),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Liveness probe; answered with `Reply::Status`
    Ping,

    /// Deliver an encoded file; `length` body bytes follow the header
    Import {
        source: String,
        format: FormatTag,
        name: String,
        length: u64,
    },

    /// Ask the service to encode `payload` and send it to `target`
    Export {
        target: String,
        format: FormatTag,
        payload: Geometry,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Ok,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Status { state: QueueState, service: String },
    Accepted,
    Rejected { message: String },
    Job { report: JobReport },
    Error { message: String },
}

/// Write one header line
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    Ok(())
}

/// Read one header line
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<T, ProtocolError> {
    let mut line = Vec::new();
    let read = reader
        .by_ref()
        .take(MAX_HEADER_BYTES + 1)
        .read_until(b'\n', &mut line)?;

    if read == 0 {
        return Err(ProtocolError::Closed);
    }
    if line.last() != Some(&b'\n') {
        return if read as u64 > MAX_HEADER_BYTES {
            Err(ProtocolError::TooLarge(MAX_HEADER_BYTES))
        } else {
            Err(ProtocolError::Closed)
        };
    }

    Ok(serde_json::from_slice(&line)?)
}

/// Read exactly `length` body bytes
pub fn read_body<R: Read>(reader: &mut R, length: u64) -> Result<Vec<u8>, ProtocolError> {
    if length > MAX_BODY_BYTES {
        return Err(ProtocolError::TooLarge(MAX_BODY_BYTES));
    }
    let mut body = Vec::with_capacity(length.min(BODY_RESERVE) as usize);
    reader.by_ref().take(length).read_to_end(&mut body)?;
    if (body.len() as u64) < length {
        return Err(ProtocolError::Closed);
    }
    Ok(body)
}

/// Read and drop up to `length` bytes, giving up at `deadline` or on any error
pub fn discard_body<R: Read>(reader: &mut R, length: u64, deadline: Instant) -> u64 {
    let mut buf = [0u8; 8192];
    let mut left = length;
    while left > 0 && Instant::now() < deadline {
        let want = left.min(buf.len() as u64) as usize;
        match reader.read(&mut buf[..want]) {
            Ok(0) | Err(_) => break,
            Ok(n) => left -= n as u64,
        }
    }
    length - left
}
