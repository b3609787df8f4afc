//! Shared pipeline counters.
//!
//! Written by the producer handle, the dispatcher and delivery tasks, and
//! read by the diagnostics task. All counters are monotonic; readers that need
//! per-window values take deltas between snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Statistics for the event pipeline.
#[derive(Debug, Default)]
pub struct EventStats {
    /// Events accepted into the intake queue.
    pub received: AtomicU64,
    /// Events dropped: intake or outbox full, or the payload was abandoned.
    pub dropped: AtomicU64,
    /// Context dedup hits.
    pub deduplicated_contexts: AtomicU64,
    /// Elements in the most recent analytics payload.
    pub events_in_last_batch: AtomicU64,
    /// Analytics payloads handed to the sender.
    pub flushes: AtomicU64,
    /// Analytics payloads that were not delivered.
    pub delivery_failures: AtomicU64,
    /// Events omitted because their context failed validation.
    pub malformed_contexts: AtomicU64,
}

impl EventStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EventStatsSnapshot {
        EventStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            deduplicated_contexts: self.deduplicated_contexts.load(Ordering::Relaxed),
            events_in_last_batch: self.events_in_last_batch.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            malformed_contexts: self.malformed_contexts.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_deduplicated(&self) {
        self.deduplicated_contexts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of pipeline statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventStatsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub deduplicated_contexts: u64,
    pub events_in_last_batch: u64,
    pub flushes: u64,
    pub delivery_failures: u64,
    pub malformed_contexts: u64,
}

impl EventStatsSnapshot {
    /// Drop rate as a percentage of everything submitted.
    pub fn drop_rate(&self) -> f64 {
        let total = self.received + self.dropped;
        if total == 0 {
            0.0
        } else {
            (self.dropped as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = EventStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_dropped(2);
        stats.record_deduplicated();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.dropped, 2);
        assert_eq!(snapshot.deduplicated_contexts, 1);
        assert!((snapshot.drop_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drop_rate_empty() {
        assert_eq!(EventStatsSnapshot::default().drop_rate(), 0.0);
    }
}
