//! Entry points a host application's commands call into.

use std::net::SocketAddr;
use std::sync::Arc;

use super::core::{FormatTag, Geometry, JobReport, PresetStore};
use super::registry::ChannelDescriptor;
use super::service::{ChannelService, ServiceError, ServiceOptions, ServiceState};

/// One local service plus the operations a UI exposes.
///
/// Each operation returns its outcome for the caller to surface; nothing is
/// retried here.
pub struct Channels {
    service: ChannelService,
}

impl Channels {
    pub fn new(presets: Arc<PresetStore>, options: ServiceOptions) -> Self {
        Self {
            service: ChannelService::new(presets, options),
        }
    }

    pub fn service(&self) -> &ChannelService {
        &self.service
    }

    pub fn presets(&self) -> &PresetStore {
        self.service.presets()
    }

    pub fn start_service(&self) -> Result<ServiceState, ServiceError> {
        self.service.start()?;
        Ok(self.service.state())
    }

    pub fn stop_service(&self) -> Result<ServiceState, ServiceError> {
        self.service.stop()?;
        Ok(self.service.state())
    }

    /// Discover a peer, waiting up to the active preset's discovery timeout
    pub fn find_channel(&self, channel_id: &str) -> Result<SocketAddr, ServiceError> {
        let timeout = self.service.settings().discovery_timeout;
        self.service.find(channel_id, timeout)
    }

    /// Export `geometry` to a channel and wait for the job to finish
    pub fn send_objects(
        &self,
        channel_id: &str,
        format: FormatTag,
        geometry: Geometry,
    ) -> Result<JobReport, ServiceError> {
        let handle = self.service.submit(channel_id, format, geometry)?;
        Ok(handle.wait())
    }

    pub fn channels(&self) -> Vec<ChannelDescriptor> {
        self.service.registry().channels()
    }
}
