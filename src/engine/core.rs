mod geometry;
mod preset;
mod settings;
mod types;

pub use geometry::{Geometry, MeshObject};
pub use preset::{DEFAULT_PRESET_NAME, Preset, PresetError, PresetStore};
pub use settings::ServiceSettings;
pub use types::{
    ExportJob, FieldValue, FormatTag, JobFailure, JobReport, JobStatus, UnknownFormat,
};
