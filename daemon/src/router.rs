//! EXTERNAL authentication and endpoint ownership
//!
//! Admits a peer based on the uid the transport obtained from the kernel,
//! then gives the endpoint a reader thread that owns it until the peer
//! disconnects or the daemon shuts the stream down.

use std::io::Read;
use std::sync::Arc;
use std::thread;

use bus_transport::{Endpoint, EndpointRegistry, Handoff, HandoffError};

/// Mechanism name recorded on admitted endpoints
pub const AUTH_MECHANISM: &str = "EXTERNAL";

const READ_BUF_SIZE: usize = 4096;

pub struct ExternalAuth {
    registry: Arc<EndpointRegistry>,
    allow_uids: Vec<u32>,
    daemon_uid: u32,
}

impl ExternalAuth {
    pub fn new(registry: Arc<EndpointRegistry>, allow_uids: Vec<u32>) -> Self {
        let daemon_uid = unsafe { libc::geteuid() };
        ExternalAuth {
            registry,
            allow_uids,
            daemon_uid,
        }
    }

    /// With no explicit allow list only the daemon's own user and root get in.
    pub fn admits(&self, uid: u32) -> bool {
        if self.allow_uids.is_empty() {
            uid == self.daemon_uid || uid == 0
        } else {
            self.allow_uids.contains(&uid)
        }
    }
}

impl Handoff for ExternalAuth {
    fn establish(&self, endpoint: &Arc<Endpoint>) -> Result<(), HandoffError> {
        let uid = endpoint.user_id();
        if !self.admits(uid) {
            return Err(HandoffError(format!(
                "{} rejected for uid {}",
                AUTH_MECHANISM, uid
            )));
        }
        endpoint.set_auth_name(AUTH_MECHANISM);

        let registry = Arc::clone(&self.registry);
        let owned = Arc::clone(endpoint);
        thread::Builder::new()
            .name(format!("{}-reader", endpoint.id()))
            .spawn(move || run_reader(registry, owned))
            .map_err(|e| HandoffError(format!("reader thread: {}", e)))?;

        log::info!(
            "{} authenticated via {} (uid={} pid={})",
            endpoint.id(),
            AUTH_MECHANISM,
            uid,
            endpoint.process_id()
        );
        Ok(())
    }
}

fn run_reader(registry: Arc<EndpointRegistry>, endpoint: Arc<Endpoint>) {
    let id = endpoint.id();
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut total: u64 = 0;

    loop {
        match (&*endpoint.stream()).read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                log::trace!("{}: read {} bytes", id, n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("{}: read error: {}", id, e);
                break;
            }
        }
    }

    log::info!("{} disconnected after {} bytes", id, total);
    drop(registry.remove(id));
}
