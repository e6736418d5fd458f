//! Bus Transport Core
//!
//! This crate provides the local-connection side of the bus daemon:
//! - Unix-domain-socket listener (filesystem path or Linux abstract namespace)
//! - Peer credential exchange (uid/gid/pid) before a connection is trusted
//! - Endpoint registry with a teardown barrier against in-flight writes
//! - STUN XOR-MAPPED-ADDRESS attribute codec (RFC 5389)

// ============================================================================
// Modules
// ============================================================================

/// STUN attribute encoding used by NAT traversal
pub mod stun;

/// Unix listener, credentials, endpoints
pub mod transport;

pub use stun::{AddressFamily, StunError, TransactionId, XorKey, XorMappedAddress};
pub use transport::credentials::{
    send_credentials, CredentialError, Credentials, OsCredentialSource, PeerCredentialSource,
};
pub use transport::endpoint::{Endpoint, EndpointFeatures, EndpointId, PushGuard};
pub use transport::registry::EndpointRegistry;
pub use transport::spec::{BindAddress, ListenSpec};
pub use transport::stats::{StatsSnapshot, TransportStats};
pub use transport::{
    Handoff, HandoffError, StopStatus, TransportConfig, TransportError, UnixTransport,
    TRANSPORT_NAME,
};
