//! Per-connection endpoint state
//!
//! An endpoint owns the accepted stream and the peer's credentials. Writers
//! into the stream hold a [`PushGuard`]; dropping the endpoint blocks until
//! every guard is gone, so no writer can outlive the stream it writes to.

use std::fmt;
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use super::credentials::Credentials;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Identity / Features
// ============================================================================

/// Process-unique endpoint identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    fn next() -> Self {
        EndpointId(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Capabilities negotiated for an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointFeatures {
    /// Peer is another bus daemon rather than a client
    pub is_bus_to_bus: bool,
    /// Peer may receive messages from remote buses
    pub allow_remote: bool,
    /// Peer may pass file descriptors
    pub handle_passing: bool,
}

impl EndpointFeatures {
    /// Features for a local client accepted on a Unix socket
    pub fn local_client() -> Self {
        EndpointFeatures {
            is_bus_to_bus: false,
            allow_remote: false,
            handle_passing: true,
        }
    }
}

// ============================================================================
// Push counting
// ============================================================================

/// Count of in-flight writes, used only as a teardown rendezvous
#[derive(Debug, Default)]
pub struct PushCounter {
    count: Mutex<usize>,
    zero: Condvar,
}

impl PushCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight write; it ends when the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> PushGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        PushGuard {
            counter: Arc::clone(self),
        }
    }

    pub fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no write is in flight.
    pub fn wait_for_zero(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .zero
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Marks one in-flight write into an endpoint
#[must_use = "the write is only counted while the guard is alive"]
#[derive(Debug)]
pub struct PushGuard {
    counter: Arc<PushCounter>,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        let mut count = self
            .counter
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.counter.zero.notify_all();
        }
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// A connected peer on the Unix transport
pub struct Endpoint {
    id: EndpointId,
    connect_spec: String,
    incoming: bool,
    credentials: Credentials,
    features: EndpointFeatures,
    auth_name: Mutex<Option<String>>,
    pushes: Arc<PushCounter>,
    stream: UnixStream,
}

impl Endpoint {
    pub fn new(
        stream: UnixStream,
        incoming: bool,
        connect_spec: impl Into<String>,
        credentials: Credentials,
        features: EndpointFeatures,
    ) -> Self {
        Endpoint {
            id: EndpointId::next(),
            connect_spec: connect_spec.into(),
            incoming,
            credentials,
            features,
            auth_name: Mutex::new(None),
            pushes: Arc::new(PushCounter::new()),
            stream,
        }
    }

    /// Endpoint for a connection accepted by the listener
    pub fn accepted(stream: UnixStream, credentials: Credentials) -> Self {
        Self::new(
            stream,
            true,
            String::new(),
            credentials,
            EndpointFeatures::local_client(),
        )
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn connect_spec(&self) -> &str {
        &self.connect_spec
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub fn user_id(&self) -> u32 {
        self.credentials.uid
    }

    pub fn group_id(&self) -> u32 {
        self.credentials.gid
    }

    pub fn process_id(&self) -> u32 {
        self.credentials.pid
    }

    /// Unix transports always report uid/gid/pid
    pub fn supports_unix_ids(&self) -> bool {
        true
    }

    pub fn features(&self) -> EndpointFeatures {
        self.features
    }

    /// Authentication mechanism the peer completed, once known
    pub fn auth_name(&self) -> Option<String> {
        self.auth_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_auth_name(&self, name: impl Into<String>) {
        *self.auth_name.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.into());
    }

    /// The owned stream, for the owner's reader thread
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Hold off destruction for the lifetime of the returned guard.
    pub fn push_guard(&self) -> PushGuard {
        self.pushes.enter()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.current()
    }

    /// Write `bytes` to the peer as one counted push.
    pub fn push(&self, bytes: &[u8]) -> io::Result<()> {
        let _guard = self.push_guard();
        (&self.stream).write_all(bytes)
    }

    /// Shut the stream down in both directions, waking any blocked reader.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("incoming", &self.incoming)
            .field("credentials", &self.credentials)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Don't finish destruction while threads are pushing to this endpoint.
        let pending = self.pushes.current();
        if pending > 0 {
            log::debug!("{}: waiting for {} in-flight pushes", self.id, pending);
        }
        self.pushes.wait_for_zero();
        log::trace!("{}: destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn creds() -> Credentials {
        Credentials {
            uid: 1000,
            gid: 100,
            pid: 4242,
        }
    }

    #[test]
    fn test_accepted_endpoint_defaults() {
        let (_client, server) = UnixStream::pair().unwrap();
        let ep = Endpoint::accepted(server, creds());

        assert!(ep.is_incoming());
        assert_eq!(ep.connect_spec(), "");
        assert_eq!(ep.user_id(), 1000);
        assert_eq!(ep.group_id(), 100);
        assert_eq!(ep.process_id(), 4242);
        assert!(ep.supports_unix_ids());
        assert_eq!(ep.features(), EndpointFeatures::local_client());
        assert!(!ep.features().is_bus_to_bus);
        assert!(!ep.features().allow_remote);
        assert!(ep.features().handle_passing);
        assert_eq!(ep.auth_name(), None);
    }

    #[test]
    fn test_ids_are_unique() {
        let (_a, b) = UnixStream::pair().unwrap();
        let (_c, d) = UnixStream::pair().unwrap();
        let first = Endpoint::accepted(b, creds());
        let second = Endpoint::accepted(d, creds());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_push_writes_and_releases_count() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let ep = Endpoint::accepted(server, creds());

        ep.push(b"hello").unwrap();
        assert_eq!(ep.push_count(), 0);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_drop_waits_for_in_flight_push() {
        let (_client, server) = UnixStream::pair().unwrap();
        let ep = Endpoint::accepted(server, creds());
        let guard = ep.push_guard();
        assert_eq!(ep.push_count(), 1);

        let (done_tx, done_rx) = mpsc::channel();
        let destroyer = thread::spawn(move || {
            drop(ep);
            done_tx.send(()).unwrap();
        });

        // Destruction must still be blocked while the push is outstanding.
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());

        drop(guard);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        destroyer.join().unwrap();
    }

    #[test]
    fn test_counter_tracks_nested_guards() {
        let counter = Arc::new(PushCounter::new());
        let a = counter.enter();
        let b = counter.enter();
        assert_eq!(counter.current(), 2);
        drop(a);
        assert_eq!(counter.current(), 1);
        drop(b);
        counter.wait_for_zero();
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_auth_name_recorded() {
        let (_client, server) = UnixStream::pair().unwrap();
        let ep = Endpoint::accepted(server, creds());
        ep.set_auth_name("EXTERNAL");
        assert_eq!(ep.auth_name().as_deref(), Some("EXTERNAL"));
    }
}
