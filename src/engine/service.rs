//! The channel service: listens for peers, queues what they deliver for the
//! host application, and runs export jobs towards other channels.

use chrono::{DateTime, Local};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use super::core::{
    ExportJob, FormatTag, Geometry, JobFailure, JobStatus, PresetStore, ServiceSettings,
};
use super::discovery::{
    Announcer, DEFAULT_DISCOVERY_ADDR, DiscoveryClient, DiscoveryError, ProbeTransport,
    ServiceAddress, UdpTransport,
};
use super::encode::EncoderSet;
use super::protocol::{
    ProtocolError, QueueState, Reply, Request, discard_body, read_body, read_message,
    write_message,
};
use super::registry::{ChannelDescriptor, ChannelRegistry};
use super::worker::{CancelToken, JobHandle, JobMessage, JobTracker};

/// Body bytes written between cancellation checks
const CHUNK_SIZE: usize = 64 * 1024;

/// How often the idle accept loop checks whether it should stop
const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// How long a rejected body is drained after the reply went out
const DISCARD_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl ServiceStatus {
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Listening)
                | (Starting, Stopped)
                | (Listening, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Listening => "listening",
            ServiceStatus::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceState {
    pub status: ServiceStatus,
    /// Where the service accepts connections while listening
    pub address: Option<ServiceAddress>,
    /// Reason the last start failed
    pub last_error: Option<String>,
    /// Peer connections currently being served
    pub active_connections: usize,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            address: None,
            last_error: None,
            active_connections: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("cannot bind {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    #[error("service did not settle within {0:?}")]
    Timeout(Duration),

    #[error("service is stopping")]
    Stopping,

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("cannot spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A file delivered by a peer, waiting for the host application
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub id: Uuid,
    pub source: String,
    pub format: FormatTag,
    pub name: String,
    pub data: Vec<u8>,
    pub received_at: DateTime<Local>,
}

/// Collaborators of a service; the defaults talk to the real discovery address
pub struct ServiceOptions {
    pub registry: Arc<ChannelRegistry>,
    pub encoders: EncoderSet,
    pub discovery_addr: SocketAddr,
    /// Defaults to UDP on `discovery_addr`
    pub transport: Option<Arc<dyn ProbeTransport>>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::builtin()),
            encoders: EncoderSet::builtin(),
            discovery_addr: DEFAULT_DISCOVERY_ADDR,
            transport: None,
        }
    }
}

/// Threads and sockets that exist only while listening
struct Runtime {
    address: ServiceAddress,
    stop: Arc<AtomicBool>,
    accept: JoinHandle<()>,
    announcer: Option<Announcer>,
}

impl Runtime {
    fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(mut announcer) = self.announcer.take() {
            announcer.unregister(&self.address.name);
            announcer.shutdown();
        }

        if self.accept.join().is_err() {
            tracing::warn!("Accept loop on {} panicked", self.address.socket_addr());
        }
    }
}

struct Inner {
    presets: Arc<PresetStore>,
    registry: Arc<ChannelRegistry>,
    encoders: EncoderSet,
    discovery: DiscoveryClient,
    discovery_addr: SocketAddr,
    state: Mutex<ServiceState>,
    changed: Condvar,
    tracker: Arc<JobTracker>,
    requests: Mutex<VecDeque<ServiceRequest>>,
    request_ready: Condvar,
    runtime: Mutex<Option<Runtime>>,
}

/// A local channel endpoint.
///
/// Every job and connection reads the active preset when it begins, so
/// preset edits apply to new work without restarting the service.
pub struct ChannelService {
    inner: Arc<Inner>,
}

impl ChannelService {
    pub fn new(presets: Arc<PresetStore>, options: ServiceOptions) -> Self {
        let transport = options
            .transport
            .unwrap_or_else(|| Arc::new(UdpTransport::new(options.discovery_addr)));

        Self {
            inner: Arc::new(Inner {
                presets,
                discovery: DiscoveryClient::new(options.registry.clone(), transport),
                registry: options.registry,
                encoders: options.encoders,
                discovery_addr: options.discovery_addr,
                state: Mutex::new(ServiceState::default()),
                changed: Condvar::new(),
                tracker: Arc::new(JobTracker::new()),
                requests: Mutex::new(VecDeque::new()),
                request_ready: Condvar::new(),
                runtime: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.state.lock().status
    }

    pub fn state(&self) -> ServiceState {
        let mut state = self.inner.state.lock().clone();
        state.active_connections = self.inner.tracker.active_connections();
        state
    }

    pub fn address(&self) -> Option<ServiceAddress> {
        self.inner.state.lock().address.clone()
    }

    pub fn presets(&self) -> &Arc<PresetStore> {
        &self.inner.presets
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.inner.registry
    }

    /// Settings from the currently active preset
    pub fn settings(&self) -> ServiceSettings {
        self.inner.settings()
    }

    /// Job progress events from now on
    pub fn subscribe(&self) -> crossbeam::channel::Receiver<JobMessage> {
        self.inner.tracker.subscribe()
    }

    /// Bind and start accepting connections.
    ///
    /// A no-op while starting or listening. If a stop is in progress this
    /// waits for it to finish, bounded by the drain and connect timeouts.
    pub fn start(&self) -> Result<ServiceStatus, ServiceError> {
        let inner = &self.inner;
        let settings = inner.settings();
        let settle = settle_timeout(&settings);

        {
            let mut state = inner.state.lock();
            let deadline = Instant::now() + settle;
            loop {
                match state.status {
                    ServiceStatus::Starting | ServiceStatus::Listening => return Ok(state.status),
                    ServiceStatus::Stopped => break,
                    ServiceStatus::Stopping => {
                        if inner.changed.wait_until(&mut state, deadline).timed_out()
                            && state.status == ServiceStatus::Stopping
                        {
                            return Err(ServiceError::Timeout(settle));
                        }
                    }
                }
            }
            state.last_error = None;
            inner.transition(&mut state, ServiceStatus::Starting);
        }

        match self.launch(&settings) {
            Ok(runtime) => {
                let address = runtime.address.clone();
                *inner.runtime.lock() = Some(runtime);

                let mut state = inner.state.lock();
                state.address = Some(address.clone());
                inner.transition(&mut state, ServiceStatus::Listening);
                tracing::info!("Channel service listening as {}", address.display());
                Ok(ServiceStatus::Listening)
            }
            Err(e) => {
                let mut state = inner.state.lock();
                state.last_error = Some(e.to_string());
                inner.transition(&mut state, ServiceStatus::Stopped);
                tracing::warn!("Channel service failed to start: {}", e);
                Err(e)
            }
        }
    }

    fn launch(&self, settings: &ServiceSettings) -> Result<Runtime, ServiceError> {
        let bind_addr = settings.bind_addr();
        let bind_err = |e: io::Error| ServiceError::BindError {
            addr: bind_addr,
            reason: e.to_string(),
        };

        let listener = TcpListener::bind(bind_addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        let reachable = if local.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        } else {
            local
        };
        let address = ServiceAddress::new(&settings.service_name, reachable);

        let stop = Arc::new(AtomicBool::new(false));
        let accept = {
            let inner = self.inner.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("channel-accept".into())
                .spawn(move || inner.accept_loop(listener, stop))
                .map_err(ServiceError::Spawn)?
        };

        let announcer = match Announcer::spawn(self.inner.discovery_addr, settings.announce_interval) {
            Ok(announcer) => {
                announcer.register(address.clone());
                Some(announcer)
            }
            Err(e) => {
                tracing::warn!("Service will not be announced: {}", e);
                None
            }
        };

        Ok(Runtime {
            address,
            stop,
            accept,
            announcer,
        })
    }

    /// Stop using the active preset's drain timeout
    pub fn stop(&self) -> Result<ServiceStatus, ServiceError> {
        let drain = self.inner.settings().drain_timeout;
        self.stop_within(drain)
    }

    /// Stop accepting, give running work `drain` to finish, then cancel the rest.
    ///
    /// A no-op while stopped. A concurrent start or stop is waited for,
    /// bounded by `drain` plus the connect timeout.
    pub fn stop_within(&self, drain: Duration) -> Result<ServiceStatus, ServiceError> {
        let inner = &self.inner;
        let settle = drain + inner.settings().connect_timeout;

        {
            let mut state = inner.state.lock();
            let deadline = Instant::now() + settle;
            loop {
                match state.status {
                    ServiceStatus::Stopped => return Ok(ServiceStatus::Stopped),
                    ServiceStatus::Listening => break,
                    busy @ (ServiceStatus::Starting | ServiceStatus::Stopping) => {
                        if inner.changed.wait_until(&mut state, deadline).timed_out()
                            && state.status == busy
                        {
                            return Err(ServiceError::Timeout(settle));
                        }
                    }
                }
            }
            inner.transition(&mut state, ServiceStatus::Stopping);
        }

        let runtime = inner.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown();
        }

        if !inner.tracker.wait_idle(Instant::now() + drain) {
            let cancelled = inner.tracker.cancel_all();
            tracing::warn!(
                "Drain window of {:?} elapsed, cancelled {} job(s)",
                drain,
                cancelled
            );
        }

        let mut state = inner.state.lock();
        state.address = None;
        inner.transition(&mut state, ServiceStatus::Stopped);
        tracing::info!("Channel service stopped");
        Ok(ServiceStatus::Stopped)
    }

    /// Queue an export of `payload` to `channel_id`.
    ///
    /// Allowed while stopped; rejected while a stop is draining.
    pub fn submit(
        &self,
        channel_id: &str,
        format: FormatTag,
        payload: Geometry,
    ) -> Result<JobHandle, ServiceError> {
        self.inner.submit(channel_id, format, payload)
    }

    /// Look up a peer and remember its endpoint
    pub fn find(&self, channel_id: &str, timeout: Duration) -> Result<SocketAddr, ServiceError> {
        Ok(self.inner.discovery.find(channel_id, timeout)?)
    }

    /// Take every request peers have delivered so far
    pub fn drain_requests(&self) -> Vec<ServiceRequest> {
        self.inner.requests.lock().drain(..).collect()
    }

    /// Wait up to `timeout` for the next delivered request
    pub fn next_request(&self, timeout: Duration) -> Option<ServiceRequest> {
        let deadline = Instant::now() + timeout;
        let mut requests = self.inner.requests.lock();
        loop {
            if let Some(request) = requests.pop_front() {
                return Some(request);
            }
            if self
                .inner
                .request_ready
                .wait_until(&mut requests, deadline)
                .timed_out()
            {
                return requests.pop_front();
            }
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.lock().len()
    }
}

impl Drop for ChannelService {
    fn drop(&mut self) {
        if self.status() != ServiceStatus::Stopped {
            if let Err(e) = self.stop() {
                tracing::warn!("Channel service did not stop cleanly: {}", e);
            }
        }
    }
}

fn settle_timeout(settings: &ServiceSettings) -> Duration {
    settings.drain_timeout + settings.connect_timeout
}

impl Inner {
    fn settings(&self) -> ServiceSettings {
        ServiceSettings::from_preset(&self.presets.get_active())
    }

    fn transition(&self, state: &mut ServiceState, next: ServiceStatus) {
        debug_assert!(
            state.status.can_transition_to(next),
            "invalid transition {} -> {}",
            state.status,
            next
        );
        tracing::debug!("Service {} -> {}", state.status, next);
        state.status = next;
        self.changed.notify_all();
    }

    /// Runs until `stop` is set; the listener is closed when this returns
    fn accept_loop(self: Arc<Self>, listener: TcpListener, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::debug!("Dropping connection: {}", e);
                        continue;
                    }
                    let guard = self.tracker.open_connection(&stream);
                    let worker = self.clone();
                    let spawned = thread::Builder::new()
                        .name("channel-conn".into())
                        .spawn(move || {
                            let _guard = guard;
                            worker.serve_connection(stream);
                        });
                    if let Err(e) = spawned {
                        tracing::warn!("Cannot spawn connection worker: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    tracing::debug!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        tracing::debug!("Accept loop stopped");
    }

    /// Read one request, write one reply
    fn serve_connection(self: &Arc<Self>, mut stream: TcpStream) {
        let settings = self.settings();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        let _ = stream.set_read_timeout(Some(settings.connect_timeout));
        let _ = stream.set_write_timeout(Some(settings.connect_timeout));

        let mut reader = match stream.try_clone() {
            Ok(clone) => BufReader::new(clone),
            Err(e) => {
                tracing::warn!("Dropping connection from {}: {}", peer, e);
                return;
            }
        };

        let (reply, unread) = match read_message::<_, Request>(&mut reader) {
            Ok(request) => {
                tracing::debug!("Request from {}: {}", peer, request_kind(&request));
                self.handle_request(request, &mut reader, &settings)
            }
            Err(ProtocolError::Closed) => return,
            Err(e) => {
                tracing::warn!("Bad request from {}: {}", peer, e);
                let reply = Reply::Error {
                    message: e.to_string(),
                };
                (reply, 0)
            }
        };

        if let Err(e) = write_message(&mut stream, &reply) {
            tracing::debug!("Reply to {} failed: {}", peer, e);
            return;
        }

        // Closing with unread bytes resets the link before the peer reads the reply
        if unread > 0 {
            let _ = stream.set_read_timeout(Some(DISCARD_WINDOW));
            let dropped = discard_body(&mut reader, unread, Instant::now() + DISCARD_WINDOW);
            tracing::debug!("Discarded {} of {} body bytes from {}", dropped, unread, peer);
        }
    }

    /// The reply plus how many body bytes were left unread on the link
    fn handle_request(
        self: &Arc<Self>,
        request: Request,
        reader: &mut BufReader<TcpStream>,
        settings: &ServiceSettings,
    ) -> (Reply, u64) {
        let reply = match request {
            Request::Ping => Reply::Status {
                state: self.queue_state(settings.queue_size),
                service: self
                    .state
                    .lock()
                    .address
                    .as_ref()
                    .map(ServiceAddress::display)
                    .unwrap_or_else(|| settings.service_name.clone()),
            },
            Request::Import {
                source,
                name,
                length,
                ..
            } if self.queue_state(settings.queue_size) == QueueState::Full => {
                tracing::warn!("Rejected {} from {}: queue full", name, source);
                let reply = Reply::Rejected {
                    message: "queue full".to_string(),
                };
                return (reply, length);
            }
            Request::Import {
                source,
                format,
                name,
                length,
            } => match read_body(reader, length) {
                Ok(data) => self.enqueue(
                    ServiceRequest {
                        id: Uuid::new_v4(),
                        source,
                        format,
                        name,
                        data,
                        received_at: Local::now(),
                    },
                    settings.queue_size,
                ),
                Err(e) => Reply::Error {
                    message: e.to_string(),
                },
            },
            Request::Export {
                target,
                format,
                payload,
            } => match self.submit(&target, format, payload) {
                Ok(handle) => Reply::Job {
                    report: handle.wait(),
                },
                Err(e) => Reply::Error {
                    message: e.to_string(),
                },
            },
        };
        (reply, 0)
    }

    fn queue_state(&self, capacity: usize) -> QueueState {
        let len = self.requests.lock().len();
        if capacity != 0 && len >= capacity {
            QueueState::Full
        } else {
            QueueState::Ok
        }
    }

    fn enqueue(&self, request: ServiceRequest, capacity: usize) -> Reply {
        let mut requests = self.requests.lock();
        if capacity != 0 && requests.len() >= capacity {
            tracing::warn!(
                "Rejected {} from {}: queue full ({} pending)",
                request.name,
                request.source,
                requests.len()
            );
            return Reply::Rejected {
                message: "queue full".to_string(),
            };
        }

        tracing::info!(
            "Received {} ({}, {} bytes) from {}",
            request.name,
            request.format,
            request.data.len(),
            request.source
        );
        requests.push_back(request);
        self.request_ready.notify_one();
        Reply::Accepted
    }
}

impl Inner {
    fn submit(
        self: &Arc<Self>,
        channel_id: &str,
        format: FormatTag,
        payload: Geometry,
    ) -> Result<JobHandle, ServiceError> {
        if self.state.lock().status == ServiceStatus::Stopping {
            return Err(ServiceError::Stopping);
        }
        let target = self
            .registry
            .resolve(channel_id)
            .map_err(|_| ServiceError::UnknownChannel(channel_id.to_string()))?;

        let mut job = ExportJob::new(target.clone(), format, payload);
        let payload = job.payload.take().unwrap_or_default();
        let (token, handle) = self.tracker.begin(job);
        let id = handle.id;
        tracing::debug!("Export job {} to '{}' as {}", id, target.id, format);

        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("export-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let outcome = worker.run_export(id, &target, format, payload, &token);
                match &outcome {
                    Ok(bytes) => tracing::info!(
                        "Sent {} bytes of {} to {}",
                        bytes,
                        format,
                        target.display_name
                    ),
                    Err(reason) => tracing::warn!("Export job {} failed: {}", id, reason),
                }
                worker.tracker.finish(id, outcome);
            });

        if let Err(e) = spawned {
            self.tracker.finish(
                id,
                Err(JobFailure::Connection(format!("cannot spawn worker: {}", e))),
            );
        }
        Ok(handle)
    }

    /// Encode, locate the peer and stream the file to it
    fn run_export(
        &self,
        id: Uuid,
        target: &ChannelDescriptor,
        format: FormatTag,
        payload: Geometry,
        token: &CancelToken,
    ) -> Result<u64, JobFailure> {
        let settings = self.settings();
        if !target.accepts(format) || self.encoders.get(format).is_none() {
            return Err(JobFailure::UnsupportedFormat(format));
        }
        token.check()?;

        self.tracker.set_status(id, JobStatus::Encoding);
        let name = format!("{}.{}", export_stem(&payload), format.extension());
        let encoded = self.encoders.encode_scoped(
            format,
            payload,
            settings.export_dir.as_deref(),
            &id.to_string(),
        )?;
        token.check()?;

        self.tracker.set_status(id, JobStatus::Sending);
        let endpoint = self.locate(target, &settings)?;
        token.check()?;

        let mut stream = TcpStream::connect_timeout(&endpoint, settings.connect_timeout)
            .map_err(|e| {
                let _ = self.registry.forget_endpoint(&target.id);
                JobFailure::Connection(format!("{}: {}", endpoint, e))
            })?;
        self.tracker.attach_stream(id, &stream);
        let _ = stream.set_read_timeout(Some(settings.connect_timeout));
        let _ = stream.set_write_timeout(Some(settings.connect_timeout));

        let link_err = |e: ProtocolError| {
            if token.is_cancelled() {
                JobFailure::Cancelled
            } else {
                JobFailure::Connection(e.to_string())
            }
        };

        let length = encoded.bytes.len() as u64;
        let header = Request::Import {
            source: settings.service_name.clone(),
            format,
            name,
            length,
        };
        let sent = write_message(&mut stream, &header).and_then(|()| {
            for chunk in encoded.bytes.chunks(CHUNK_SIZE) {
                token.check().map_err(|_| ProtocolError::Closed)?;
                stream.write_all(chunk)?;
            }
            stream.flush()?;
            Ok(())
        });
        token.check()?;

        // A peer may reject before the body is through; its reply explains why
        let mut reader = BufReader::new(&stream);
        let reply = match (sent, read_message::<_, Reply>(&mut reader)) {
            (_, Ok(reply)) => reply,
            (Err(e), Err(_)) | (Ok(()), Err(e)) => return Err(link_err(e)),
        };
        match reply {
            Reply::Accepted => Ok(length),
            Reply::Rejected { message } | Reply::Error { message } => {
                Err(JobFailure::Rejected(message))
            }
            other => Err(JobFailure::Connection(format!(
                "unexpected reply: {:?}",
                other
            ))),
        }
    }

    /// Cached endpoint, or a fresh discovery
    fn locate(
        &self,
        target: &ChannelDescriptor,
        settings: &ServiceSettings,
    ) -> Result<SocketAddr, JobFailure> {
        let cached = self
            .registry
            .resolve(&target.id)
            .ok()
            .and_then(|c| c.last_known_endpoint);
        if let Some(endpoint) = cached {
            return Ok(endpoint);
        }

        self.discovery
            .find(&target.id, settings.discovery_timeout)
            .map_err(|e| match e {
                DiscoveryError::NotFound { .. } => JobFailure::NotFound(target.id.clone()),
                DiscoveryError::UnknownChannel(id) => JobFailure::UnknownChannel(id),
                other => JobFailure::Connection(other.to_string()),
            })
    }
}

/// File name stem for an export, from its first object
fn export_stem(payload: &Geometry) -> String {
    payload
        .objects
        .first()
        .map(|o| o.name.trim().replace(['/', '\\'], "_"))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Export".to_string())
}

fn request_kind(request: &Request) -> &'static str {
    match request {
        Request::Ping => "ping",
        Request::Import { .. } => "import",
        Request::Export { .. } => "export",
    }
}
