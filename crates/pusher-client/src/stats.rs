//! Status counters for faults that are handled internally instead of returned.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct ClientStats {
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub decode_errors: AtomicU64,
    pub send_failures: AtomicU64,
    pub connection_attempts: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub auth_failures: AtomicU64,
    pub listener_panics: AtomicU64,
}

/// Point-in-time copy of the client's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Inbound frames discarded because they could not be decoded.
    pub decode_errors: u64,
    /// Outbound frames that could not be written.
    pub send_failures: u64,
    /// Transport opens started (initial connect and every retry).
    pub connection_attempts: u64,
    /// Opens that failed or connections that dropped unexpectedly.
    pub failed_attempts: u64,
    pub heartbeat_timeouts: u64,
    pub auth_failures: u64,
    /// Listener calls that panicked. The panic is contained and logged.
    pub listener_panics: u64,
}

/// Increment `counter`, returning the new total.
pub(crate) fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

impl ClientStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_received: load(&self.frames_received),
            frames_sent: load(&self.frames_sent),
            decode_errors: load(&self.decode_errors),
            send_failures: load(&self.send_failures),
            connection_attempts: load(&self.connection_attempts),
            failed_attempts: load(&self.failed_attempts),
            heartbeat_timeouts: load(&self.heartbeat_timeouts),
            auth_failures: load(&self.auth_failures),
            listener_panics: load(&self.listener_panics),
        }
    }
}
