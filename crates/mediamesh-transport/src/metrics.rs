//! Passive transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of transport counters at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Frames accepted by `transmit`.
    pub frames_transmitted: u64,
    /// Payload bytes accepted by `transmit`.
    pub bytes_transmitted: u64,
    /// Frames delivered to a linked sink.
    pub frames_delivered: u64,
    /// Payload bytes delivered to a linked sink.
    pub bytes_delivered: u64,
    /// Frames dropped for lack of a link.
    pub frames_dropped: u64,
    /// Sink `on_receive` calls that returned an error.
    pub delivery_errors: u64,
    /// Fatal fabric errors observed by workers.
    pub fabric_errors: u64,
}

/// Thread-safe counter set owned by each transport connection.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    frames_transmitted: AtomicU64,
    bytes_transmitted: AtomicU64,
    frames_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    delivery_errors: AtomicU64,
    fabric_errors: AtomicU64,
}

impl TransportMetrics {
    /// Fresh counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transmit(&self, bytes: usize) {
        self.frames_transmitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_transmitted
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self, bytes: usize) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery_error(&self) {
        self.delivery_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fabric_error(&self) {
        self.fabric_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters out.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_transmitted: self.frames_transmitted.load(Ordering::Relaxed),
            bytes_transmitted: self.bytes_transmitted.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            fabric_errors: self.fabric_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = TransportMetrics::new();
        metrics.record_transmit(100);
        metrics.record_transmit(50);
        metrics.record_delivery(100);
        metrics.record_drop();
        metrics.record_delivery_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_transmitted, 2);
        assert_eq!(snap.bytes_transmitted, 150);
        assert_eq!(snap.frames_delivered, 1);
        assert_eq!(snap.bytes_delivered, 100);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.delivery_errors, 1);
        assert_eq!(snap.fabric_errors, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = TransportMetrics::new();
        metrics.record_fabric_error();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"fabric_errors\":1"));
    }
}
