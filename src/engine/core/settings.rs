use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use super::preset::Preset;

/// Typed view of the preset fields that drive the channel service.
///
/// Built from a validated preset; a missing or mistyped field falls back to
/// the built-in default so a snapshot is always usable.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub service_name: String,
    pub bind_host: IpAddr,
    pub bind_port: u16,
    /// 0 means unbounded
    pub queue_size: usize,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    pub drain_timeout: Duration,
    pub announce_interval: Duration,
    pub export_dir: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            service_name: "FreeCAD".to_string(),
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 0,
            queue_size: 50,
            connect_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            announce_interval: Duration::from_secs(1),
            export_dir: None,
        }
    }
}

impl ServiceSettings {
    pub fn from_preset(preset: &Preset) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            preset
                .number(key)
                .and_then(|n| Duration::try_from_secs_f64(n).ok())
                .unwrap_or(fallback)
        };

        Self {
            service_name: preset
                .text("service_name")
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .unwrap_or(defaults.service_name),
            bind_host: preset
                .text("bind_host")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.bind_host),
            bind_port: preset
                .number("bind_port")
                .filter(|n| n.fract() == 0.0 && (0.0..=u16::MAX as f64).contains(n))
                .map(|n| n as u16)
                .unwrap_or(defaults.bind_port),
            queue_size: preset
                .number("queue_size")
                .filter(|n| *n >= 0.0)
                .map(|n| n as usize)
                .unwrap_or(defaults.queue_size),
            connect_timeout: secs("connect_timeout", defaults.connect_timeout),
            discovery_timeout: secs("discovery_timeout", defaults.discovery_timeout),
            drain_timeout: secs("drain_timeout", defaults.drain_timeout),
            announce_interval: secs("announce_interval", defaults.announce_interval),
            export_dir: preset
                .text("export_dir")
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.bind_port)
    }
}
