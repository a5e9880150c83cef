//! Format encoders, looked up by `FormatTag`.

mod gltf;
mod obj;

pub use gltf::GltfEncoder;
pub use obj::ObjEncoder;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::engine::core::{FormatTag, Geometry, JobFailure};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("format {0} is not supported")]
    UnsupportedFormat(FormatTag),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),
}

impl From<EncodeError> for JobFailure {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::UnsupportedFormat(format) => JobFailure::UnsupportedFormat(format),
            EncodeError::EncodingFailed(reason) => JobFailure::EncodingFailed(reason),
        }
    }
}

/// Turns geometry into the bytes of one file format.
///
/// The geometry is moved in and dropped once encoding finishes.
pub trait FormatEncoder: Send + Sync {
    fn format(&self) -> FormatTag;

    fn encode(&self, geometry: Geometry) -> Result<Vec<u8>, EncodeError>;
}

/// Encoded file, plus where it was kept on disk when staging is enabled
#[derive(Debug)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub path: Option<PathBuf>,
}

#[derive(Clone, Default)]
pub struct EncoderSet {
    encoders: HashMap<FormatTag, Arc<dyn FormatEncoder>>,
}

impl std::fmt::Debug for EncoderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderSet")
            .field("formats", &self.formats())
            .finish()
    }
}

impl EncoderSet {
    /// OBJ and glTF encoders
    pub fn builtin() -> Self {
        let mut set = Self::default();
        set.register(Arc::new(ObjEncoder));
        set.register(Arc::new(GltfEncoder));
        set
    }

    /// Add an encoder, replacing any existing one for the same format
    pub fn register(&mut self, encoder: Arc<dyn FormatEncoder>) {
        self.encoders.insert(encoder.format(), encoder);
    }

    pub fn get(&self, format: FormatTag) -> Option<Arc<dyn FormatEncoder>> {
        self.encoders.get(&format).cloned()
    }

    pub fn formats(&self) -> BTreeSet<FormatTag> {
        self.encoders.keys().copied().collect()
    }

    pub fn encode(&self, format: FormatTag, geometry: Geometry) -> Result<Vec<u8>, EncodeError> {
        let encoder = self
            .get(format)
            .ok_or(EncodeError::UnsupportedFormat(format))?;
        encoder.encode(geometry)
    }

    /// Encode with an optional on-disk copy in `stage_dir`.
    ///
    /// The copy is written to a hidden temp file while encoding runs and
    /// renamed to `<stem>.<ext>` only on success; on any failure the partial
    /// file is removed.
    pub fn encode_scoped(
        &self,
        format: FormatTag,
        geometry: Geometry,
        stage_dir: Option<&Path>,
        stem: &str,
    ) -> Result<Encoded, EncodeError> {
        let Some(dir) = stage_dir else {
            let bytes = self.encode(format, geometry)?;
            return Ok(Encoded { bytes, path: None });
        };

        let staging_err = |e: std::io::Error| {
            EncodeError::EncodingFailed(format!("staging in {}: {}", dir.display(), e))
        };

        fs::create_dir_all(dir).map_err(staging_err)?;
        let mut partial = tempfile::Builder::new()
            .prefix(".partial-")
            .suffix(&format!(".{}", format.extension()))
            .tempfile_in(dir)
            .map_err(staging_err)?;

        let bytes = self.encode(format, geometry)?;
        partial.write_all(&bytes).map_err(staging_err)?;

        let path = dir.join(format!("{}.{}", stem, format.extension()));
        partial.persist(&path).map_err(|e| staging_err(e.error))?;
        tracing::debug!("Staged {} export at {}", format, path.display());

        Ok(Encoded {
            bytes,
            path: Some(path),
        })
    }
}

/// Fails if the geometry can't be encoded at all
fn check_geometry(geometry: &Geometry) -> Result<(), EncodeError> {
    geometry.check().map_err(EncodeError::EncodingFailed)
}
