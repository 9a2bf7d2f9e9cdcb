//! Deque statistics.
//!
//! Counters are updated with relaxed atomics and can be read while the
//! deque is in use.
//!
//! ```rust,ignore
//! let stats = deque.stats();
//! println!("offers: {} rollovers: {}", stats.offers, stats.rollovers);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Live deque counters.
#[derive(Debug, Default)]
pub struct DequeStats {
    offers: AtomicU64,
    bytes_written: AtomicU64,
    polls: AtomicU64,
    bytes_read: AtomicU64,
    rollovers: AtomicU64,
    segments_deleted: AtomicU64,
    segments_quarantined: AtomicU64,
    truncations: AtomicU64,
    retention_passes: AtomicU64,
}

impl DequeStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_offer(&self, bytes: u64) {
        self.offers.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_poll(&self, bytes: u64) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_rollover(&self) {
        self.rollovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deleted(&self, segments: u64) {
        self.segments_deleted.fetch_add(segments, Ordering::Relaxed);
    }

    pub(crate) fn record_quarantine(&self) {
        self.segments_quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_truncation(&self) {
        self.truncations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retention_pass(&self) {
        self.retention_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            offers: self.offers.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            segments_deleted: self.segments_deleted.load(Ordering::Relaxed),
            segments_quarantined: self.segments_quarantined.load(Ordering::Relaxed),
            truncations: self.truncations.load(Ordering::Relaxed),
            retention_passes: self.retention_passes.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`DequeStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Entries accepted by `offer`, `push` and the gap writer.
    pub offers: u64,
    /// Encoded bytes appended to segments.
    pub bytes_written: u64,
    /// Entries returned to cursors.
    pub polls: u64,
    /// Payload bytes returned to cursors.
    pub bytes_read: u64,
    /// Write segment rollovers.
    pub rollovers: u64,
    /// Segment files removed.
    pub segments_deleted: u64,
    /// Segments moved into quarantine.
    pub segments_quarantined: u64,
    /// Truncations applied by `parse_and_truncate` or recovery.
    pub truncations: u64,
    /// Completed retention enforcement passes.
    pub retention_passes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = DequeStats::new();
        stats.record_offer(10);
        stats.record_offer(5);
        stats.record_poll(7);
        stats.record_deleted(3);

        let snap = stats.snapshot();
        assert_eq!(snap.offers, 2);
        assert_eq!(snap.bytes_written, 15);
        assert_eq!(snap.polls, 1);
        assert_eq!(snap.bytes_read, 7);
        assert_eq!(snap.segments_deleted, 3);
        assert_eq!(snap.rollovers, 0);
    }
}
