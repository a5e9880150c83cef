//! Finding peers and announcing local services.
//!
//! Services announce themselves by sending a UDP datagram of the form
//! `_freecad_channels._tcp.local.:<name>@<host>:<port>` to the well-known
//! discovery address. A [`DiscoveryClient`] binds that address and takes the
//! first announcement matching the channel it looks for.

use crossbeam::channel::{Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::engine::registry::ChannelRegistry;

pub const SERVICE_TYPE: &str = "_freecad_channels._tcp.local.";

pub const DEFAULT_DISCOVERY_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 58987);

/// Poll interval of the listener so it notices when its last subscriber is gone
const PROBE_POLL: Duration = Duration::from_millis(50);

const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no peer announced '{service}' within {timeout:?}")]
    NotFound { service: String, timeout: Duration },

    #[error("cannot listen on discovery address {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid service address '{0}'")]
pub struct InvalidAddress(String);

/// Where a named service accepts connections
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(name: &str, addr: SocketAddr) -> Self {
        Self {
            name: name.to_string(),
            host: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// `name@host:port`, without the service type prefix
    pub fn display(&self) -> String {
        format!("{}@{}:{}", self.name, self.host, self.port)
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SERVICE_TYPE, self.display())
    }
}

impl FromStr for ServiceAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidAddress(s.to_string());

        let rest = s
            .strip_prefix(SERVICE_TYPE)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(invalid)?;
        let (name, endpoint) = rest.split_once('@').ok_or_else(invalid)?;
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;

        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            host: host.parse().map_err(|_| invalid())?,
            port: port.parse().map_err(|_| invalid())?,
        })
    }
}

/// Running probe: raw datagrams arrive on `rx` until it is dropped
pub struct Probe {
    pub rx: Receiver<Vec<u8>>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Probe {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self { rx, cleanup: None }
    }

    /// Runs `cleanup` when dropped
    pub fn with_cleanup(rx: Receiver<Vec<u8>>, cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            cleanup: Some(Box::new(cleanup)),
        }
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Substrate that delivers announcements to a discovery client
pub trait ProbeTransport: Send + Sync {
    fn listen(&self) -> Result<Probe, DiscoveryError>;
}

/// Subscribers fed by one bound discovery socket
#[derive(Default)]
struct SharedListener {
    next_id: u64,
    subscribers: Vec<(u64, Sender<Vec<u8>>)>,
}

impl SharedListener {
    fn subscribe(&mut self, tx: Sender<Vec<u8>>) -> u64 {
        self.next_id += 1;
        self.subscribers.push((self.next_id, tx));
        self.next_id
    }
}

/// One socket per discovery address in this process. An entry exists exactly
/// while its listener thread owns the bound socket.
static LISTENERS: OnceLock<Mutex<HashMap<SocketAddr, SharedListener>>> = OnceLock::new();

fn listeners() -> &'static Mutex<HashMap<SocketAddr, SharedListener>> {
    LISTENERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Listens for announcements on a local UDP address.
///
/// Concurrent lookups on the same address share a single socket, so they
/// never compete for the bind within one process.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    addr: SocketAddr,
}

impl UdpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_ADDR)
    }
}

impl ProbeTransport for UdpTransport {
    fn listen(&self) -> Result<Probe, DiscoveryError> {
        let addr = self.addr;
        let bind_err = |source| DiscoveryError::Bind { addr, source };
        let (tx, rx) = crossbeam::channel::unbounded();

        let mut table = listeners().lock();
        let id = match table.get_mut(&addr) {
            Some(shared) => shared.subscribe(tx),
            None => {
                let socket = UdpSocket::bind(addr).map_err(bind_err)?;
                socket.set_read_timeout(Some(PROBE_POLL)).map_err(bind_err)?;
                thread::Builder::new()
                    .name("discovery-probe".into())
                    .spawn(move || run_listener(addr, socket))
                    .map_err(bind_err)?;
                tracing::debug!("Listening for announcements on {}", addr);

                let mut shared = SharedListener::default();
                let id = shared.subscribe(tx);
                table.insert(addr, shared);
                id
            }
        };
        drop(table);

        Ok(Probe::with_cleanup(rx, move || {
            if let Some(shared) = listeners().lock().get_mut(&addr) {
                shared.subscribers.retain(|(i, _)| *i != id);
            }
        }))
    }
}

/// Fan datagrams out to every subscriber; exit once none is left
fn run_listener(addr: SocketAddr, socket: UdpSocket) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let datagram = match socket.recv_from(&mut buf) {
            Ok((len, _)) => Some(buf[..len].to_vec()),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => None,
            Err(e) => {
                tracing::warn!("Discovery listener on {} stopped: {}", addr, e);
                let mut table = listeners().lock();
                table.remove(&addr);
                drop(socket);
                return;
            }
        };

        let mut table = listeners().lock();
        let Some(shared) = table.get_mut(&addr) else {
            return;
        };
        if let Some(datagram) = datagram {
            shared
                .subscribers
                .retain(|(_, tx)| tx.send(datagram.clone()).is_ok());
        }
        if shared.subscribers.is_empty() {
            // Release the port before anyone can look the address up again
            table.remove(&addr);
            drop(socket);
            tracing::debug!("Stopped listening on {}", addr);
            return;
        }
    }
}

/// Looks up running peers for registered channels
pub struct DiscoveryClient {
    registry: Arc<ChannelRegistry>,
    transport: Arc<dyn ProbeTransport>,
}

impl DiscoveryClient {
    pub fn new(registry: Arc<ChannelRegistry>, transport: Arc<dyn ProbeTransport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// Wait for the first announcement of `channel_id`'s peer.
    ///
    /// Returns as soon as a matching announcement arrives; fails with
    /// `NotFound` once `timeout` elapses. Never retries.
    pub fn find(&self, channel_id: &str, timeout: Duration) -> Result<SocketAddr, DiscoveryError> {
        let channel = self
            .registry
            .resolve(channel_id)
            .map_err(|_| DiscoveryError::UnknownChannel(channel_id.to_string()))?;

        let probe = self.transport.listen()?;
        let deadline = crossbeam::channel::at(Instant::now() + timeout);
        let not_found = || DiscoveryError::NotFound {
            service: channel.service_name.clone(),
            timeout,
        };

        tracing::debug!("Looking for '{}' for up to {:?}", channel.service_name, timeout);

        loop {
            select! {
                recv(probe.rx) -> datagram => {
                    let Ok(datagram) = datagram else {
                        // Nothing more can arrive; the lookup still lasts its full window
                        let _ = deadline.recv();
                        return Err(not_found());
                    };
                    let Some(address) = parse_announcement(&datagram) else {
                        continue;
                    };
                    if address.name != channel.service_name {
                        continue;
                    }

                    let endpoint = address.socket_addr();
                    tracing::info!("Found {} at {}", channel.display_name, endpoint);
                    let _ = self.registry.record_endpoint(&channel.id, endpoint);
                    return Ok(endpoint);
                }
                recv(deadline) -> _ => return Err(not_found()),
            }
        }
    }
}

fn parse_announcement(datagram: &[u8]) -> Option<ServiceAddress> {
    let text = std::str::from_utf8(datagram).ok()?;
    match text.trim().parse() {
        Ok(address) => Some(address),
        Err(e) => {
            tracing::warn!("Ignoring announcement: {}", e);
            None
        }
    }
}

enum AnnounceAction {
    Register(ServiceAddress),
    Unregister(String),
    Shutdown,
}

/// Background thread that periodically announces registered services
pub struct Announcer {
    actions: Sender<AnnounceAction>,
    handle: Option<JoinHandle<()>>,
}

impl Announcer {
    pub fn spawn(target: SocketAddr, interval: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))?;
        let (actions, rx) = crossbeam::channel::unbounded();

        let handle = thread::Builder::new()
            .name("announcer".into())
            .spawn(move || run_announcer(socket, target, interval, rx))?;

        Ok(Self {
            actions,
            handle: Some(handle),
        })
    }

    /// Start announcing `address`; replaces an earlier one with the same name
    pub fn register(&self, address: ServiceAddress) {
        let _ = self.actions.send(AnnounceAction::Register(address));
    }

    pub fn unregister(&self, name: &str) {
        let _ = self.actions.send(AnnounceAction::Unregister(name.to_string()));
    }

    /// Stop the thread; idempotent
    pub fn shutdown(&mut self) {
        let _ = self.actions.send(AnnounceAction::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_announcer(
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    actions: Receiver<AnnounceAction>,
) {
    let ticker = crossbeam::channel::tick(interval);
    let mut services: BTreeMap<String, ServiceAddress> = BTreeMap::new();

    let announce = |address: &ServiceAddress| {
        if let Err(e) = socket.send_to(address.to_string().as_bytes(), target) {
            tracing::debug!("Announcement of {} failed: {}", address.display(), e);
        }
    };

    loop {
        select! {
            recv(actions) -> action => match action {
                Ok(AnnounceAction::Register(address)) => {
                    tracing::debug!("Announcing {}", address.display());
                    announce(&address);
                    services.insert(address.name.clone(), address);
                }
                Ok(AnnounceAction::Unregister(name)) => {
                    services.remove(&name);
                }
                Ok(AnnounceAction::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => services.values().for_each(&announce),
        }
    }
}
