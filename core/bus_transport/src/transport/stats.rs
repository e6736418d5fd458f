//! Transport counters
//!
//! Atomic counters updated by the listen loop. Rendered in Prometheus text
//! exposition format so the daemon can log or serve them.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransportStats {
    /// Connections accepted on the listening socket (counter)
    pub accepted_total: AtomicU64,
    /// Connections dropped because the credential exchange failed (counter)
    pub credential_failures_total: AtomicU64,
    /// Endpoints registered after a successful credential exchange (counter)
    pub registered_total: AtomicU64,
    /// Endpoints removed because the authentication handoff failed (counter)
    pub handoff_failures_total: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub credential_failures: u64,
    pub registered: u64,
    pub handoff_failures: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted_total.load(Ordering::Relaxed),
            credential_failures: self.credential_failures_total.load(Ordering::Relaxed),
            registered: self.registered_total.load(Ordering::Relaxed),
            handoff_failures: self.handoff_failures_total.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        format!(
            "# HELP bus_unix_accepted_total Connections accepted on the Unix listener\n\
             # TYPE bus_unix_accepted_total counter\n\
             bus_unix_accepted_total {}\n\
             # HELP bus_unix_credential_failures_total Connections dropped during credential exchange\n\
             # TYPE bus_unix_credential_failures_total counter\n\
             bus_unix_credential_failures_total {}\n\
             # HELP bus_unix_registered_total Endpoints registered\n\
             # TYPE bus_unix_registered_total counter\n\
             bus_unix_registered_total {}\n\
             # HELP bus_unix_handoff_failures_total Endpoints dropped after a failed handoff\n\
             # TYPE bus_unix_handoff_failures_total counter\n\
             bus_unix_handoff_failures_total {}\n",
            s.accepted, s.credential_failures, s.registered, s.handoff_failures,
        )
    }
}
