//! Unix-domain-socket transport for local bus clients
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Transport Module Structure                │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  spec.rs        - listen spec parsing / normalization         │
//! │  credentials.rs - peer uid/gid/pid exchange per platform      │
//! │  endpoint.rs    - per-connection state + push barrier         │
//! │  registry.rs    - mutex-guarded set of live endpoints         │
//! │  listener.rs    - bind/listen + accept loop thread            │
//! │  stats.rs       - transport counters                          │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod credentials;
pub mod endpoint;
pub mod listener;
pub mod registry;
pub mod spec;
pub mod stats;

use credentials::{OsCredentialSource, PeerCredentialSource, DEFAULT_CREDENTIAL_TIMEOUT};
use endpoint::Endpoint;
use listener::{ListenLoop, StopHandle};
use registry::EndpointRegistry;
use spec::ListenSpec;
use stats::TransportStats;

/// Name (and listen spec prefix) of this transport
pub const TRANSPORT_NAME: &str = "unix";

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by the transport control surface
#[derive(Debug)]
pub enum TransportError {
    /// Listen spec is malformed or names neither/both of path and abstract
    BadTransportArgs(String),
    /// `start_listen` called while a listener is already running
    AlreadyListening,
    /// Transport has been shut down
    NotStarted,
    /// Creating the socket failed
    SocketCreate(io::Error),
    /// Binding the socket failed
    Bind(io::Error),
    /// Listening on the socket failed
    Listen(io::Error),
    /// Any other OS failure (poll setup, thread spawn, ...)
    Os(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::BadTransportArgs(msg) => write!(f, "bad transport args: {}", msg),
            TransportError::AlreadyListening => write!(f, "transport is already listening"),
            TransportError::NotStarted => write!(f, "transport not started"),
            TransportError::SocketCreate(e) => write!(f, "socket create failed: {}", e),
            TransportError::Bind(e) => write!(f, "bind failed: {}", e),
            TransportError::Listen(e) => write!(f, "listen failed: {}", e),
            TransportError::Os(e) => write!(f, "OS error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::SocketCreate(e)
            | TransportError::Bind(e)
            | TransportError::Listen(e)
            | TransportError::Os(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure reported by the authentication handoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffError(pub String);

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handoff failed: {}", self.0)
    }
}

impl std::error::Error for HandoffError {}

// ============================================================================
// Handoff
// ============================================================================

/// Receives every endpoint that passed the credential exchange.
///
/// Runs the authentication conversation and, on success, takes the endpoint
/// over (typically by starting its I/O threads). On error the transport
/// unregisters and destroys the endpoint. Called on the listen thread, after
/// the endpoint is already in the registry.
pub trait Handoff: Send + Sync {
    fn establish(&self, endpoint: &Arc<Endpoint>) -> Result<(), HandoffError>;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound on the credential exchange per connection
    pub credential_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            credential_timeout_ms: DEFAULT_CREDENTIAL_TIMEOUT.as_millis() as u64,
        }
    }
}

impl TransportConfig {
    pub fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// The listener was running and is now closed
    Stopped,
    /// Nothing was listening; no-op
    NotStarted,
}

struct Running {
    spec: ListenSpec,
    stop: StopHandle,
    thread: JoinHandle<()>,
}

/// Local transport: one listening Unix socket driven by its own thread
pub struct UnixTransport {
    config: TransportConfig,
    registry: Arc<EndpointRegistry>,
    credentials: Arc<dyn PeerCredentialSource>,
    handoff: Arc<dyn Handoff>,
    stats: Arc<TransportStats>,
    running: Option<Running>,
    shut_down: bool,
}

impl UnixTransport {
    pub fn new(
        config: TransportConfig,
        registry: Arc<EndpointRegistry>,
        handoff: Arc<dyn Handoff>,
    ) -> Self {
        UnixTransport {
            config,
            registry,
            credentials: Arc::new(OsCredentialSource),
            handoff,
            stats: Arc::new(TransportStats::new()),
            running: None,
            shut_down: false,
        }
    }

    /// Replace the platform credential source (e.g. for a sandboxed peer)
    pub fn with_credential_source(mut self, source: Arc<dyn PeerCredentialSource>) -> Self {
        self.credentials = source;
        self
    }

    pub fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.stats
    }

    /// True while the listen thread is alive. A loop that ended on its own
    /// (broken poll) no longer counts.
    pub fn is_listening(&self) -> bool {
        self.live().is_some()
    }

    /// Normalized spec of the running listener
    pub fn listen_spec(&self) -> Option<&ListenSpec> {
        self.live().map(|r| &r.spec)
    }

    fn live(&self) -> Option<&Running> {
        self.running.as_ref().filter(|r| !r.thread.is_finished())
    }

    /// Join a listen thread that already exited so the transport can listen
    /// again.
    fn reap_exited(&mut self) {
        if self.running.is_none() || self.live().is_some() {
            return;
        }
        if let Some(running) = self.running.take() {
            if running.thread.join().is_err() {
                log::error!("Listen thread for {} panicked", running.spec);
            }
            log::warn!("Listen loop on {} had exited; released", running.spec);
        }
    }

    pub fn normalize_spec(&self, listen_spec: &str) -> Result<ListenSpec, TransportError> {
        spec::normalize(listen_spec)
    }

    /// Bind `listen_spec` and start the accept thread.
    pub fn start_listen(&mut self, listen_spec: &str) -> Result<(), TransportError> {
        if self.shut_down {
            return Err(TransportError::NotStarted);
        }
        self.reap_exited();
        if self.running.is_some() {
            return Err(TransportError::AlreadyListening);
        }

        let spec = spec::normalize(listen_spec).map_err(|e| {
            log::error!("Invalid Unix listen spec \"{}\": {}", listen_spec, e);
            e
        })?;

        // From here on the listener closes itself if a later step fails.
        let listener = listener::bind_and_listen(spec.bind_address())?;
        let (listen_loop, stop) = ListenLoop::new(
            listener,
            Arc::clone(&self.registry),
            Arc::clone(&self.credentials),
            Arc::clone(&self.handoff),
            Arc::clone(&self.stats),
            self.config.credential_timeout(),
        )?;

        let thread = thread::Builder::new()
            .name(format!("{}-listen", TRANSPORT_NAME))
            .spawn(move || listen_loop.run())
            .map_err(TransportError::Os)?;

        log::info!("Unix transport listening on {}", spec);
        self.running = Some(Running { spec, stop, thread });
        Ok(())
    }

    /// Stop the accept thread and close the listening socket.
    ///
    /// Endpoints already handed off are left alone.
    pub fn stop_listen(&mut self) -> Result<StopStatus, TransportError> {
        self.stop_with(|stop| stop.request_stop())
    }

    fn stop_with(
        &mut self,
        wake: impl FnOnce(&StopHandle) -> io::Result<()>,
    ) -> Result<StopStatus, TransportError> {
        match &self.running {
            // The handle stays in place on failure so the stop can be retried.
            Some(running) => wake(&running.stop).map_err(TransportError::Os)?,
            None => return Ok(StopStatus::NotStarted),
        }
        let running = match self.running.take() {
            Some(running) => running,
            None => return Ok(StopStatus::NotStarted),
        };

        if running.thread.join().is_err() {
            log::error!("Listen thread for {} panicked", running.spec);
        }

        log::info!("Unix transport stopped listening on {}", running.spec);
        Ok(StopStatus::Stopped)
    }

    /// Stop listening and stop every endpoint in the registry. The transport
    /// cannot listen again afterwards.
    pub fn shutdown(&mut self) -> Result<StopStatus, TransportError> {
        let status = self.stop_listen()?;
        self.shut_down = true;
        self.registry.shutdown_all();
        Ok(status)
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        if let Err(e) = self.stop_listen() {
            log::warn!("Failed to stop listener: {}", e);
        }
    }
}
