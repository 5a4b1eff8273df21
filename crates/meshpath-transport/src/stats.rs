//! Lock-free transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated from any reader or sender task.
#[derive(Debug, Default)]
pub struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
    dropped_unsupported: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors surfaced to callers
    pub send_errors: u64,
    /// Receive errors seen by readers
    pub recv_errors: u64,
    /// Packets silently dropped because the address family is unavailable
    pub dropped_unsupported: u64,
}

impl TransportStats {
    /// Record a successful send of `packets` datagrams totalling `bytes`.
    pub fn record_send(&self, packets: usize, bytes: usize) {
        self.packets_sent.fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one received datagram.
    pub fn record_recv(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a send error.
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error.
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `packets` datagrams dropped for lack of a local address family.
    pub fn record_unsupported_drop(&self, packets: usize) {
        self.dropped_unsupported
            .fetch_add(packets as u64, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            dropped_unsupported: self.dropped_unsupported.load(Ordering::Relaxed),
        }
    }
}
