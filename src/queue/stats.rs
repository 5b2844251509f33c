use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time counters for one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub inserted: u64,
    pub removed: u64,
    pub rejected_full: u64,
    pub alloc_failures: u64,
    pub timeouts: u64,
    /// Elements dropped by `clear`.
    pub cleared: u64,
    /// Highest element count observed right after an insert.
    pub max_len: u64,
}

#[derive(Default)]
pub(crate) struct QueueStatsAtomic {
    inserted: AtomicU64,
    removed: AtomicU64,
    rejected_full: AtomicU64,
    alloc_failures: AtomicU64,
    timeouts: AtomicU64,
    cleared: AtomicU64,
    max_len: AtomicUsize,
}

impl QueueStatsAtomic {
    pub(crate) fn record_insert(&self, len_after: usize) {
        self.inserted.fetch_add(1, Ordering::Relaxed);
        self.max_len.fetch_max(len_after, Ordering::Relaxed);
    }

    pub(crate) fn record_remove(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_full(&self) {
        self.rejected_full.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_alloc_failure(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clear(&self, released: usize) {
        self.cleared.fetch_add(released as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> QueueStats {
        QueueStats {
            inserted: self.inserted.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cleared: self.cleared.load(Ordering::Relaxed),
            max_len: self.max_len.load(Ordering::Relaxed) as u64,
        }
    }
}
