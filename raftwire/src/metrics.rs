//! Transport operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by a transport's loops.
///
/// All counters are monotonic and relaxed; they exist for observability,
/// not for synchronization.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    exchanges_completed: AtomicU64,
    exchanges_faulted: AtomicU64,
    protocol_violations: AtomicU64,
    pool_rejections: AtomicU64,
}

impl TransportMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total packets written to the wire.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Total packets read from the wire.
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Exchanges that reached `Completed`.
    pub fn exchanges_completed(&self) -> u64 {
        self.exchanges_completed.load(Ordering::Relaxed)
    }

    /// Exchanges that reached `Faulted` (cancellation included).
    pub fn exchanges_faulted(&self) -> u64 {
        self.exchanges_faulted.load(Ordering::Relaxed)
    }

    /// Packets dropped as protocol violations.
    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations.load(Ordering::Relaxed)
    }

    /// Inbound requests rejected because the exchange pool was exhausted.
    pub fn pool_rejections(&self) -> u64 {
        self.pool_rejections.load(Ordering::Relaxed)
    }

    pub(crate) fn record_packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exchange_completed(&self) {
        self.exchanges_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exchange_faulted(&self) {
        self.exchanges_faulted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pool_rejection(&self) {
        self.pool_rejections.fetch_add(1, Ordering::Relaxed);
    }
}
