//! Listening socket and the accept loop
//!
//! ```text
//!  LISTENING ──readable──► ACCEPTING ──► CRED_EXCHANGE ──► REGISTERED ──► HANDOFF
//!      ▲                      │               │                              │
//!      └──────────────────────┴───────────────┴──────────────────────────────┘
//!      │
//!      └──stop──► CLOSED
//! ```
//!
//! Connections are handled one at a time on the loop's thread. Per-connection
//! failures are logged and the connection dropped; only a stop request (or a
//! broken poll) ends the loop.

use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, SockAddr, Socket, Type};

use super::credentials::{self, PeerCredentialSource};
use super::endpoint::Endpoint;
use super::registry::EndpointRegistry;
use super::spec::BindAddress;
use super::stats::TransportStats;
use super::{Handoff, TransportError};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// mio token for the stop waker
const WAKER_TOKEN: Token = Token(1);

/// Platform default accept backlog
const LISTEN_BACKLOG: i32 = 128;

// ============================================================================
// Bound listener
// ============================================================================

/// A bound, listening, non-blocking Unix socket.
///
/// Closing it (drop) also unlinks a filesystem socket path.
#[derive(Debug)]
pub struct BoundListener {
    listener: UnixListener,
    address: BindAddress,
}

impl BoundListener {
    pub fn address(&self) -> &BindAddress {
        &self.address
    }

    fn accept(&self) -> io::Result<UnixStream> {
        self.listener.accept().map(|(stream, _)| stream)
    }
}

impl AsRawFd for BoundListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        if let BindAddress::Path(path) = &self.address {
            remove_socket_file(path);
        }
        log::debug!("Closed listener on {}", self.address);
    }
}

fn remove_socket_file(path: &std::path::Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove socket file {}: {}", path.display(), e);
        }
    }
}

fn socket_address(address: &BindAddress) -> io::Result<SockAddr> {
    match address {
        BindAddress::Path(path) => SockAddr::unix(path),
        BindAddress::Abstract(name) => abstract_address(name),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_address(name: &str) -> io::Result<SockAddr> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    // Abstract names are a leading NUL followed by the name, unterminated.
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.push(0);
    bytes.extend_from_slice(name.as_bytes());
    SockAddr::unix(OsStr::from_bytes(&bytes))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_address(name: &str) -> io::Result<SockAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket @{} requires Linux", name),
    ))
}

/// Create a Unix stream socket, bind it to `address`, and listen.
///
/// Each step fails with its own error; a socket created before the failure
/// is closed on return. Credential passing is switched on before `listen`
/// so accepted sockets inherit it.
pub fn bind_and_listen(address: &BindAddress) -> Result<BoundListener, TransportError> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(|e| {
        log::error!("socket() failed: {}", e);
        TransportError::SocketCreate(e)
    })?;

    let sock_addr = socket_address(address).map_err(TransportError::Bind)?;
    socket.bind(&sock_addr).map_err(|e| {
        log::error!("bind({}) failed: {}", address, e);
        TransportError::Bind(e)
    })?;

    let listening = credentials::prepare_listener(socket.as_raw_fd())
        .map_err(TransportError::Os)
        .and_then(|()| socket.listen(LISTEN_BACKLOG).map_err(TransportError::Listen));
    if let Err(e) = listening {
        log::error!("listen({}) failed: {}", address, e);
        if let BindAddress::Path(path) = address {
            remove_socket_file(path);
        }
        return Err(e);
    }

    let listener = BoundListener {
        listener: UnixListener::from(OwnedFd::from(socket)),
        address: address.clone(),
    };
    listener
        .listener
        .set_nonblocking(true)
        .map_err(TransportError::Os)?;

    log::debug!("Listening on {}", address);
    Ok(listener)
}

// ============================================================================
// Listen loop
// ============================================================================

enum Wake {
    Readable,
    Stopping,
}

/// Everything the loop's thread owns
pub(crate) struct ListenLoop {
    poll: Poll,
    listener: BoundListener,
    stopping: Arc<AtomicBool>,
    registry: Arc<EndpointRegistry>,
    credentials: Arc<dyn PeerCredentialSource>,
    handoff: Arc<dyn Handoff>,
    stats: Arc<TransportStats>,
    credential_timeout: Duration,
}

/// Handle used by the transport to stop a running loop
pub(crate) struct StopHandle {
    stopping: Arc<AtomicBool>,
    waker: Waker,
}

impl StopHandle {
    pub(crate) fn request_stop(&self) -> io::Result<()> {
        self.stopping.store(true, Ordering::Release);
        self.waker.wake()
    }
}

impl ListenLoop {
    pub(crate) fn new(
        listener: BoundListener,
        registry: Arc<EndpointRegistry>,
        credentials: Arc<dyn PeerCredentialSource>,
        handoff: Arc<dyn Handoff>,
        stats: Arc<TransportStats>,
        credential_timeout: Duration,
    ) -> Result<(Self, StopHandle), TransportError> {
        let poll = Poll::new().map_err(TransportError::Os)?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER_TOKEN,
                Interest::READABLE,
            )
            .map_err(TransportError::Os)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(TransportError::Os)?;
        let stopping = Arc::new(AtomicBool::new(false));

        let listen_loop = ListenLoop {
            poll,
            listener,
            stopping: Arc::clone(&stopping),
            registry,
            credentials,
            handoff,
            stats,
            credential_timeout,
        };

        Ok((listen_loop, StopHandle { stopping, waker }))
    }

    /// Run until a stop is requested. Closes the listener on exit.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(16);

        loop {
            match self.wait(&mut events) {
                Ok(Wake::Stopping) => break,
                Ok(Wake::Readable) => self.accept_pending(),
                Err(e) => {
                    log::error!("Listener wait failed on {}: {}", self.listener.address(), e);
                    break;
                }
            }
        }

        log::info!("Listen loop on {} exiting", self.listener.address());
    }

    fn wait(&mut self, events: &mut Events) -> io::Result<Wake> {
        loop {
            match self.poll.poll(events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if self.stopping.load(Ordering::Acquire) {
                return Ok(Wake::Stopping);
            }
            if events.iter().any(|event| event.token() == LISTENER_TOKEN) {
                return Ok(Wake::Readable);
            }
        }
    }

    /// Accept until the backlog is empty (readiness is edge-triggered).
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(stream) => self.handle_connection(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Error accepting new connection. Ignoring...: {}", e);
                    // Re-arm so connections still queued are reported again.
                    if let Err(e) = self.poll.registry().reregister(
                        &mut SourceFd(&self.listener.as_raw_fd()),
                        LISTENER_TOKEN,
                        Interest::READABLE,
                    ) {
                        log::error!("Failed to re-arm listener: {}", e);
                    }
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: UnixStream) {
        TransportStats::bump(&self.stats.accepted_total);

        if let Err(e) = stream.set_nonblocking(false) {
            log::warn!("Dropping connection: {}", e);
            return;
        }

        let credentials = match self.credentials.fetch(&stream, self.credential_timeout) {
            Ok(credentials) => credentials,
            Err(e) => {
                TransportStats::bump(&self.stats.credential_failures_total);
                log::warn!("Dropping connection: credential exchange failed: {}", e);
                return;
            }
        };

        let endpoint = Arc::new(Endpoint::accepted(stream, credentials));
        let id = endpoint.id();
        self.registry.insert(Arc::clone(&endpoint));
        TransportStats::bump(&self.stats.registered_total);
        log::info!(
            "Accepted {} on {} (uid={} gid={} pid={})",
            id,
            self.listener.address(),
            credentials.uid,
            credentials.gid,
            credentials.pid
        );

        if let Err(e) = self.handoff.establish(&endpoint) {
            TransportStats::bump(&self.stats.handoff_failures_total);
            log::error!("Error starting {}: {}", id, e);
            drop(self.registry.remove(id));
            // Last reference: blocks until in-flight pushes finish.
            drop(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bus-listener-{}-{}.sock", name, std::process::id()))
    }

    #[test]
    fn test_bind_path_and_unlink_on_drop() {
        let path = temp_socket_path("unlink");
        let _ = fs::remove_file(&path);
        let address = BindAddress::Path(path.clone());

        let listener = bind_and_listen(&address).unwrap();
        assert!(path.exists());
        assert!(UnixStream::connect(&path).is_ok());

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_conflict_keeps_existing_socket() {
        let path = temp_socket_path("conflict");
        let _ = fs::remove_file(&path);
        let address = BindAddress::Path(path.clone());

        let first = bind_and_listen(&address).unwrap();
        let second = bind_and_listen(&address);
        assert!(matches!(second, Err(TransportError::Bind(_))));
        assert!(path.exists());
        drop(first);
    }

    #[test]
    fn test_bind_missing_directory() {
        let address = BindAddress::Path(PathBuf::from("/nonexistent-dir-for-bus/x.sock"));
        assert!(matches!(
            bind_and_listen(&address),
            Err(TransportError::Bind(_))
        ));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn passcred_enabled(fd: RawFd) -> bool {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(ret, 0);
        value != 0
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_accepted_socket_inherits_passcred() {
        let path = temp_socket_path("passcred");
        let _ = fs::remove_file(&path);
        let listener = bind_and_listen(&BindAddress::Path(path.clone())).unwrap();
        assert!(passcred_enabled(listener.as_raw_fd()));

        let _client = UnixStream::connect(&path).unwrap();
        let accepted = listener.accept().unwrap();
        assert!(passcred_enabled(accepted.as_raw_fd()));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_plain_sentinel_after_accept_has_real_credentials() {
        use crate::transport::credentials::{OsCredentialSource, SENTINEL};
        use std::io::Write;

        let path = temp_socket_path("plain");
        let _ = fs::remove_file(&path);
        let listener = bind_and_listen(&BindAddress::Path(path.clone())).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        let accepted = listener.accept().unwrap();
        accepted.set_nonblocking(false).unwrap();
        client.write_all(&[SENTINEL]).unwrap();

        let creds = OsCredentialSource
            .fetch(&accepted, Duration::from_millis(500))
            .unwrap();
        assert_eq!(creds.uid, unsafe { libc::getuid() });
        assert_eq!(creds.pid, std::process::id());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_bind_abstract() {
        use std::os::linux::net::SocketAddrExt;

        let name = format!("bus-listener-test-{}", std::process::id());
        let listener = bind_and_listen(&BindAddress::Abstract(name.clone())).unwrap();

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        assert!(UnixStream::connect_addr(&addr).is_ok());
        drop(listener);
    }
}
