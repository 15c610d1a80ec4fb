//! Connection counters shared by the acceptor and connection handlers.
//!
//! An explicit shared object rather than process globals: the server hands
//! an `Arc<Stats>` to every component that updates it, and the admin
//! endpoint only ever reads a snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide connection counters.
#[derive(Debug, Default)]
pub struct Stats {
    current_connections: AtomicI64,
    total_connections: AtomicU64,
    timeout_errors: AtomicU64,
    rejected_connections: AtomicU64,
    ttl_expirations: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tcp_current_connections: i64,
    pub tcp_total_connections: u64,
    pub tcp_timeout_errors: u64,
    pub tcp_rejected_connections: u64,
    pub tcp_ttl_expirations: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection was admitted.
    pub fn connection_opened(&self) {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// An admitted connection finished.
    pub fn connection_closed(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_timeout(&self) {
        self.timeout_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ttl_expiry(&self) {
        self.ttl_expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tcp_current_connections: self.current_connections.load(Ordering::Relaxed),
            tcp_total_connections: self.total_connections.load(Ordering::Relaxed),
            tcp_timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            tcp_rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            tcp_ttl_expirations: self.ttl_expirations.load(Ordering::Relaxed),
        }
    }
}
