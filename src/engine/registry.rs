//! Static registry of known integration targets.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::engine::core::FormatTag;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
}

/// A named integration with an external application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: String,
    pub display_name: String,
    /// Name the peer announces itself under
    pub service_name: String,
    pub supported_formats: BTreeSet<FormatTag>,
    pub last_known_endpoint: Option<SocketAddr>,
}

impl ChannelDescriptor {
    pub fn new(id: &str, display_name: &str, service_name: &str, formats: &[FormatTag]) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            service_name: service_name.to_string(),
            supported_formats: formats.iter().copied().collect(),
            last_known_endpoint: None,
        }
    }

    pub fn accepts(&self, format: FormatTag) -> bool {
        self.supported_formats.contains(&format)
    }
}

#[derive(Debug)]
pub struct ChannelRegistry {
    channels: RwLock<Vec<ChannelDescriptor>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ChannelRegistry {
    /// Registry with the integrations shipped with the crate
    pub fn builtin() -> Self {
        Self::new(vec![
            ChannelDescriptor::new("blender", "Blender", "Blender", &FormatTag::ALL),
            ChannelDescriptor::new("freecad", "FreeCAD", "FreeCAD", &FormatTag::ALL),
        ])
    }

    pub fn new(channels: Vec<ChannelDescriptor>) -> Self {
        Self {
            channels: RwLock::new(channels),
        }
    }

    pub fn resolve(&self, channel_id: &str) -> Result<ChannelDescriptor, RegistryError> {
        self.channels
            .read()
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownChannel(channel_id.to_string()))
    }

    pub fn channels(&self) -> Vec<ChannelDescriptor> {
        self.channels.read().clone()
    }

    /// Remember where a channel's peer was last found
    pub fn record_endpoint(
        &self,
        channel_id: &str,
        address: SocketAddr,
    ) -> Result<(), RegistryError> {
        self.update(channel_id, |c| {
            if c.last_known_endpoint != Some(address) {
                tracing::debug!("Channel '{}' endpoint is now {}", c.id, address);
                c.last_known_endpoint = Some(address);
            }
        })
    }

    /// Drop a stale endpoint so the next send rediscovers the peer
    pub fn forget_endpoint(&self, channel_id: &str) -> Result<(), RegistryError> {
        self.update(channel_id, |c| c.last_known_endpoint = None)
    }

    fn update(
        &self,
        channel_id: &str,
        f: impl FnOnce(&mut ChannelDescriptor),
    ) -> Result<(), RegistryError> {
        let mut channels = self.channels.write();
        let channel = channels
            .iter_mut()
            .find(|c| c.id == channel_id)
            .ok_or_else(|| RegistryError::UnknownChannel(channel_id.to_string()))?;
        f(channel);
        Ok(())
    }
}
