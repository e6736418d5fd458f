//! STUN attribute support used for NAT address discovery
//!
//! Only the pieces the bus needs from RFC 5389 live here: the XOR key
//! derivation (magic cookie + transaction id) and the XOR-MAPPED-ADDRESS
//! attribute body. The generic message/attribute framing is owned by the
//! caller, which hands us the attribute body and the enclosing message's
//! transaction id.
//!
//! # XOR-MAPPED-ADDRESS body
//!
//! ```text
//! +--------+--------+-----------------+
//! | 0x00   | Family | X-Port (2 bytes)|
//! +--------+--------+-----------------+
//! | X-Address (4 bytes IPv4 / 16 bytes IPv6)
//! +-----------------------------------
//! ```

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};

pub mod cursor;
pub mod xor_mapped_address;

pub use cursor::{OutputBuffer, Reader};
pub use xor_mapped_address::{AddressFamily, XorMappedAddress};

// ============================================================================
// Constants
// ============================================================================

/// Fixed magic cookie carried in every STUN header (RFC 5389 Section 6)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of a STUN transaction id in bytes
pub const TRANSACTION_ID_LEN: usize = 12;

/// Size of the XOR key (magic cookie followed by transaction id)
pub const XOR_KEY_LEN: usize = 4 + TRANSACTION_ID_LEN;

// ============================================================================
// Transaction ID / XOR key
// ============================================================================

/// 96-bit identifier of one STUN request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; TRANSACTION_ID_LEN]);

impl TransactionId {
    pub fn new(bytes: [u8; TRANSACTION_ID_LEN]) -> Self {
        TransactionId(bytes)
    }

    /// Generate a transaction id from the system CSPRNG
    pub fn random() -> Result<Self, StunError> {
        let mut bytes = [0u8; TRANSACTION_ID_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| StunError::RandomUnavailable)?;
        Ok(TransactionId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_LEN] {
        &self.0
    }
}

/// Key that obfuscates the address fields of XOR-MAPPED-ADDRESS.
///
/// Always derived from the protocol values (cookie ‖ transaction id), never
/// from bytes the caller may already have serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorKey([u8; XOR_KEY_LEN]);

impl XorKey {
    pub fn new(transaction_id: &TransactionId) -> Self {
        let mut key = [0u8; XOR_KEY_LEN];
        key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        key[4..].copy_from_slice(transaction_id.as_bytes());
        XorKey(key)
    }

    pub fn as_bytes(&self) -> &[u8; XOR_KEY_LEN] {
        &self.0
    }

    /// Mask applied to the port: the high 16 bits of the magic cookie
    pub const fn port_mask() -> u16 {
        (MAGIC_COOKIE >> 16) as u16
    }

    /// XOR `bytes` in place against the leading octets of the key.
    ///
    /// `bytes` must not be longer than the key; address bodies are 4 or 16.
    pub fn apply(&self, bytes: &mut [u8]) {
        debug_assert!(bytes.len() <= XOR_KEY_LEN);
        for (index, (byte, key)) in bytes.iter_mut().zip(self.0.iter()).enumerate() {
            let masked = *byte ^ key;
            log::trace!(
                "xor[{}]: {:02x} ^ {:02x} => {:02x}",
                index,
                byte,
                key,
                masked
            );
            *byte = masked;
        }
    }
}

impl From<&TransactionId> for XorKey {
    fn from(transaction_id: &TransactionId) -> Self {
        XorKey::new(transaction_id)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while parsing or rendering STUN attribute bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    /// Not enough input for the attribute (need `needed`, have `available`)
    BufferTooSmall { needed: usize, available: usize },
    /// Family octet (or address length when rendering) is not IPv4/IPv6
    InvalidAddressFamily(u8),
    /// System random source failed
    RandomUnavailable,
}

impl fmt::Display for StunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StunError::BufferTooSmall { needed, available } => write!(
                f,
                "buffer too small: need {} bytes, {} available",
                needed, available
            ),
            StunError::InvalidAddressFamily(family) => {
                write!(f, "invalid address family 0x{:02x}", family)
            }
            StunError::RandomUnavailable => write!(f, "system random source unavailable"),
        }
    }
}

impl std::error::Error for StunError {}
