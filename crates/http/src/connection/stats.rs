//! Connection counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomically maintained connection statistics.
///
/// `active` counts connections currently parsing or serving a request;
/// a connection parked between keep-alive turns moves to `keep_alive_idle`.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    total_accepted: AtomicU64,
    active: AtomicU64,
    keep_alive_idle: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an accepted socket.
    pub fn on_accept(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_keep_alive(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.keep_alive_idle.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_keep_alive(&self) {
        self.keep_alive_idle.fetch_sub(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self, was_idle: bool) {
        if was_idle {
            self.keep_alive_idle.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Total sockets accepted since startup.
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    /// Connections currently serving a request.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Connections parked between keep-alive turns.
    pub fn keep_alive_idle(&self) -> u64 {
        self.keep_alive_idle.load(Ordering::Relaxed)
    }
}
