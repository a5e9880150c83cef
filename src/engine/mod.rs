// Channel engine - independent of the CLI

pub mod channels;
pub mod core;
pub mod discovery;
pub mod encode;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod service;
pub mod validate;
pub mod worker;

pub use channels::Channels;
pub use core::*;
pub use discovery::{DiscoveryClient, DiscoveryError, ServiceAddress};
pub use encode::{EncodeError, EncoderSet, FormatEncoder};
pub use registry::{ChannelDescriptor, ChannelRegistry, RegistryError};
pub use schema::Schema;
pub use service::{
    ChannelService, ServiceError, ServiceOptions, ServiceRequest, ServiceState, ServiceStatus,
};
pub use validate::{ErrorKind, FieldConstraint, ValidationErrors, ValidationResult, validate};
pub use worker::{JobHandle, JobMessage};
