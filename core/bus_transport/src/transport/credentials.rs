//! Peer credential exchange over a connected Unix socket
//!
//! The client writes one NUL sentinel byte; reading it on the server side
//! yields the OS credential record of the peer. On Linux the record arrives
//! as `SCM_CREDENTIALS` ancillary data (after opting in with `SO_PASSCRED`).
//! On the BSDs `getpeereid` is used after consuming the sentinel, and the
//! pid is reported as 0.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// Bounds the credential exchange so a silent peer cannot stall the listener
pub const DEFAULT_CREDENTIAL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Byte a client sends to trigger credential attachment
pub const SENTINEL: u8 = 0;

const PEER_TOKEN: Token = Token(0);

// ============================================================================
// Types
// ============================================================================

/// OS identity of the process on the other end of a local socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    /// 0 when the platform cannot report it
    pub pid: u32,
}

/// Errors from the credential exchange
#[derive(Debug)]
pub enum CredentialError {
    /// A socket option or system call failed
    Os(io::Error),
    /// Reading the sentinel failed or returned something unexpected
    Read(String),
    /// Socket still not readable after the single permitted retry
    WouldBlock,
    /// Peer sent nothing within the timeout
    Timeout(Duration),
    /// Sentinel arrived without a credential record
    MissingCredentials,
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::Os(e) => write!(f, "OS error: {}", e),
            CredentialError::Read(msg) => write!(f, "read error: {}", msg),
            CredentialError::WouldBlock => write!(f, "credential read would block"),
            CredentialError::Timeout(t) => {
                write!(f, "credentials exchange timed out after {} ms", t.as_millis())
            }
            CredentialError::MissingCredentials => {
                write!(f, "no credential record attached to sentinel")
            }
        }
    }
}

impl std::error::Error for CredentialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CredentialError::Os(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Credential source
// ============================================================================

/// Fetches the credentials of the peer on a freshly accepted socket.
///
/// Called exactly once per connection; implementations need not be reentrant
/// for a given socket.
pub trait PeerCredentialSource: Send + Sync {
    fn fetch(&self, stream: &UnixStream, timeout: Duration) -> Result<Credentials, CredentialError>;
}

/// Credential source backed by the running platform's socket facilities
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCredentialSource;

impl PeerCredentialSource for OsCredentialSource {
    fn fetch(&self, stream: &UnixStream, timeout: Duration) -> Result<Credentials, CredentialError> {
        let _mode = NonBlocking::enter(stream)?;
        let credentials = platform::fetch(stream, timeout)?;
        log::debug!(
            "Received UID: {}  GID: {}  PID: {}",
            credentials.uid,
            credentials.gid,
            credentials.pid
        );
        Ok(credentials)
    }
}

/// Client side of the exchange: send the sentinel (with credentials where
/// the platform lets the sender attach them).
pub fn send_credentials(stream: &UnixStream) -> io::Result<()> {
    platform::send(stream)
}

/// Configure a listening socket (before `listen`) so that every accepted
/// socket carries credentials from its very first byte.
pub(crate) fn prepare_listener(fd: RawFd) -> io::Result<()> {
    platform::prepare_listener(fd)
}

/// Puts the stream in non-blocking mode for the exchange and restores
/// blocking mode on every exit path.
struct NonBlocking<'a> {
    stream: &'a UnixStream,
}

impl<'a> NonBlocking<'a> {
    fn enter(stream: &'a UnixStream) -> Result<Self, CredentialError> {
        stream.set_nonblocking(true).map_err(CredentialError::Os)?;
        Ok(NonBlocking { stream })
    }
}

impl Drop for NonBlocking<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.stream.set_nonblocking(false) {
            log::debug!("Failed to restore blocking mode: {}", e);
        }
    }
}

/// Run `recv` once; if it would block, wait (bounded) for readability and
/// try exactly once more.
fn recv_with_retry<T>(
    fd: RawFd,
    timeout: Duration,
    mut recv: impl FnMut() -> io::Result<T>,
) -> Result<T, CredentialError> {
    match recv() {
        Ok(value) => return Ok(value),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(CredentialError::Read(e.to_string())),
    }

    wait_readable(fd, timeout)?;

    match recv() {
        Ok(value) => Ok(value),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(CredentialError::WouldBlock),
        Err(e) => Err(CredentialError::Read(e.to_string())),
    }
}

fn wait_readable(fd: RawFd, timeout: Duration) -> Result<(), CredentialError> {
    let mut poll = Poll::new().map_err(CredentialError::Os)?;
    poll.registry()
        .register(&mut SourceFd(&fd), PEER_TOKEN, Interest::READABLE)
        .map_err(CredentialError::Os)?;

    let deadline = Instant::now() + timeout;
    let mut events = Events::with_capacity(4);

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match poll.poll(&mut events, Some(left)) {
            Ok(()) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CredentialError::Os(e)),
        }
    }

    let _ = poll.registry().deregister(&mut SourceFd(&fd));

    if events.iter().any(|event| event.token() == PEER_TOKEN) {
        Ok(())
    } else {
        log::warn!("Credentials exchange timeout on fd {}", fd);
        Err(CredentialError::Timeout(timeout))
    }
}

fn check_sentinel(read: usize, byte: u8) -> Result<(), CredentialError> {
    match (read, byte) {
        (1, SENTINEL) => Ok(()),
        (0, _) => Err(CredentialError::Read(
            "peer closed before sending credentials".to_string(),
        )),
        (_, other) => Err(CredentialError::Read(format!(
            "unexpected sentinel byte 0x{:02x}",
            other
        ))),
    }
}

// ============================================================================
// Linux: SO_PASSCRED + SCM_CREDENTIALS
// ============================================================================

#[cfg(any(target_os = "linux", target_os = "android"))]
mod platform {
    use std::io;
    use std::mem;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::ptr;
    use std::time::Duration;

    use super::{check_sentinel, recv_with_retry, CredentialError, Credentials, SENTINEL};

    const UCRED_LEN: u32 = mem::size_of::<libc::ucred>() as u32;

    /// Control buffer sized and aligned for one `ucred` record
    fn control_buffer() -> Vec<u64> {
        let space = unsafe { libc::CMSG_SPACE(UCRED_LEN) } as usize;
        vec![0u64; (space + 7) / 8]
    }

    pub(super) fn fetch(stream: &UnixStream, timeout: Duration) -> Result<Credentials, CredentialError> {
        let fd = stream.as_raw_fd();
        enable_passcred(fd).map_err(CredentialError::Os)?;

        let (read, byte, credentials) = recv_with_retry(fd, timeout, || recv_sentinel(fd))?;
        check_sentinel(read, byte)?;
        match credentials {
            // The kernel fills in overflow ids and pid 0 for data queued
            // while SO_PASSCRED was off; that record names nobody.
            Some(credentials) if credentials.pid == 0 => {
                log::warn!(
                    "Rejecting placeholder credentials (uid={} gid={} pid=0)",
                    credentials.uid,
                    credentials.gid
                );
                Err(CredentialError::MissingCredentials)
            }
            Some(credentials) => Ok(credentials),
            None => Err(CredentialError::MissingCredentials),
        }
    }

    pub(super) fn prepare_listener(fd: RawFd) -> io::Result<()> {
        enable_passcred(fd)
    }

    fn enable_passcred(fd: RawFd) -> io::Result<()> {
        let enable: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &enable as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv_sentinel(fd: RawFd) -> io::Result<(usize, u8, Option<Credentials>)> {
        let mut byte = [0xffu8; 1];
        let mut control = control_buffer();
        let mut iov = libc::iovec {
            iov_base: byte.as_mut_ptr() as *mut libc::c_void,
            iov_len: byte.len(),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

        let ret = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut credentials = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS
                {
                    let ucred: libc::ucred =
                        ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::ucred);
                    credentials = Some(Credentials {
                        uid: ucred.uid,
                        gid: ucred.gid,
                        pid: ucred.pid as u32,
                    });
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok((ret as usize, byte[0], credentials))
    }

    pub(super) fn send(stream: &UnixStream) -> io::Result<()> {
        let fd = stream.as_raw_fd();
        let mut byte = [SENTINEL];
        let mut control = control_buffer();
        let ucred = unsafe {
            libc::ucred {
                pid: libc::getpid(),
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        };
        let mut iov = libc::iovec {
            iov_base: byte.as_mut_ptr() as *mut libc::c_void,
            iov_len: byte.len(),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(UCRED_LEN) } as _;

        let ret = unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_CREDENTIALS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(UCRED_LEN) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::ucred, ucred);
            libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL)
        };
        match ret {
            1 => Ok(()),
            -1 => Err(io::Error::last_os_error()),
            _ => Err(io::Error::new(io::ErrorKind::WriteZero, "sentinel not sent")),
        }
    }
}

// ============================================================================
// BSD family: sentinel + getpeereid
// ============================================================================

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod platform {
    use std::io::{self, Read, Write};
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::{check_sentinel, recv_with_retry, CredentialError, Credentials, SENTINEL};

    pub(super) fn fetch(stream: &UnixStream, timeout: Duration) -> Result<Credentials, CredentialError> {
        let fd = stream.as_raw_fd();
        let mut byte = [0xffu8; 1];
        let read = recv_with_retry(fd, timeout, || (&*stream).read(&mut byte))?;
        check_sentinel(read, byte[0])?;

        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;
        let ret = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
        if ret == -1 {
            return Err(CredentialError::Os(io::Error::last_os_error()));
        }

        Ok(Credentials { uid, gid, pid: 0 })
    }

    pub(super) fn send(stream: &UnixStream) -> io::Result<()> {
        (&*stream).write_all(&[SENTINEL])
    }

    pub(super) fn prepare_listener(_fd: RawFd) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
mod platform {
    use std::io;
    use std::os::unix::io::RawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::{CredentialError, Credentials};

    pub(super) fn fetch(_stream: &UnixStream, _timeout: Duration) -> Result<Credentials, CredentialError> {
        Err(CredentialError::Os(io::Error::new(
            io::ErrorKind::Unsupported,
            "peer credentials not supported on this platform",
        )))
    }

    pub(super) fn send(_stream: &UnixStream) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "peer credentials not supported on this platform",
        ))
    }

    pub(super) fn prepare_listener(_fd: RawFd) -> io::Result<()> {
        Ok(())
    }
}
