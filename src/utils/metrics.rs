//! Observability counters.
//!
//! Atomic counters for protocol health: traffic volume both ways plus the
//! rejection reasons that matter operationally (checksum and framing
//! failures are the usual first sign of an abusive or desynchronized
//! client).

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters for protocol operations.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Frames accepted by the receive path
    pub messages_received: AtomicU64,
    /// Frames delivered to connections
    pub messages_sent: AtomicU64,
    /// Bytes accepted by the receive path
    pub bytes_received: AtomicU64,
    /// Bytes delivered to connections
    pub bytes_sent: AtomicU64,
    /// Frames rejected for a checksum or sequence violation
    pub checksum_failures: AtomicU64,
    /// Frames rejected for a length/alignment mismatch
    pub framing_failures: AtomicU64,
    /// Operations dropped because the connection was gone
    pub expired_drops: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_failure(&self) {
        self.framing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn expired_drop(&self) {
        self.expired_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            framing_failures: self.framing_failures.load(Ordering::Relaxed),
            expired_drops: self.expired_drops.load(Ordering::Relaxed),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            messages_received = snapshot.messages_received,
            messages_sent = snapshot.messages_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            checksum_failures = snapshot.checksum_failures,
            framing_failures = snapshot.framing_failures,
            expired_drops = snapshot.expired_drops,
            "protocol metrics snapshot"
        );
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub checksum_failures: u64,
    pub framing_failures: u64,
    pub expired_drops: u64,
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
