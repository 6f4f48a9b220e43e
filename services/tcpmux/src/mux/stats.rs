//! Process-wide relay counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Statistics for a running multiplexer.
#[derive(Debug, Default)]
pub struct MuxStats {
    /// Total clients accepted.
    pub clients_accepted: AtomicU64,
    /// Clients currently registered.
    pub clients_active: AtomicU64,
    /// Clients that have terminated.
    pub clients_closed: AtomicU64,
    /// Bytes forwarded from clients to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes read from upstream.
    pub bytes_from_upstream: AtomicU64,
    /// Broadcast cycles completed.
    pub broadcasts: AtomicU64,
    /// Per-member write failures during broadcast.
    pub broadcast_failures: AtomicU64,
    /// Listener accept errors.
    pub accept_errors: AtomicU64,
    /// Set once the upstream read loop has ended.
    pub relay_ended: AtomicBool,
}

/// Point-in-time copy of [`MuxStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub clients_accepted: u64,
    pub clients_active: u64,
    pub clients_closed: u64,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
    pub broadcasts: u64,
    pub broadcast_failures: u64,
    pub accept_errors: u64,
    pub relay_ended: bool,
}

impl MuxStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            clients_accepted: self.clients_accepted.load(Ordering::Relaxed),
            clients_active: self.clients_active.load(Ordering::Relaxed),
            clients_closed: self.clients_closed.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            broadcast_failures: self.broadcast_failures.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            relay_ended: self.relay_ended.load(Ordering::Relaxed),
        }
    }
}
