//! 📊 Stats: "how's it going?" answered with integers instead of vibes.
//!
//! One mutex, tiny critical sections, deep copies on read. Callers get a snapshot that cannot
//! tear, and workers never wait on a reader that wandered off to render a table.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::response::BulkResponseItem;

/// 📊 Point-in-time counters for a whole processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkProcessorStats {
    /// 🚽 Number of times `flush()` ran (manual or periodic).
    pub flushed: u64,
    /// 📬 Number of commits (a commit with three retries still counts once).
    pub committed: u64,
    pub indexed: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub workers: Vec<BulkProcessorWorkerStats>,
}

/// 🧵 Per-worker numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkProcessorWorkerStats {
    /// 📦 Operations sitting in this worker's accumulator at last report.
    pub queued: u64,
    /// ⏱️ Server-reported duration of this worker's last send.
    pub last_duration: Duration,
}

/// 🔒 The registry workers write into. Disabled registries still count flushes.
#[derive(Debug)]
pub(crate) struct StatsRegistry {
    enabled: bool,
    inner: Mutex<BulkProcessorStats>,
}

impl StatsRegistry {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inner: Mutex::new(BulkProcessorStats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BulkProcessorStats> {
        // 🩹 A panicking worker can poison the lock; counters are still good integers.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 🔁 Fresh counters, one slot per worker. Called on every `start()`.
    pub(crate) fn reset(&self, workers: usize) {
        *self.lock() = BulkProcessorStats {
            workers: vec![BulkProcessorWorkerStats::default(); workers],
            ..Default::default()
        };
    }

    pub(crate) fn record_flush(&self) {
        self.lock().flushed += 1;
    }

    pub(crate) fn record_queued(&self, worker: usize, queued: usize) {
        if !self.enabled {
            return;
        }
        if let Some(slot) = self.lock().workers.get_mut(worker) {
            slot.queued = queued as u64;
        }
    }

    /// 🧾 Fold final item outcomes into the counters. Called as soon as items are final, even
    /// while siblings are still being retried.
    pub(crate) fn record_items<'a>(&self, items: impl IntoIterator<Item = &'a BulkResponseItem>) {
        if !self.enabled {
            return;
        }
        let mut stats = self.lock();
        for item in items {
            tally(&mut stats, &item.op_type, item.succeeded());
        }
    }

    /// 🪦 Ops abandoned when the retry budget ran out. They never got a final verdict, so they
    /// count as failed.
    pub(crate) fn record_abandoned(&self, count: usize) {
        if !self.enabled {
            return;
        }
        self.lock().failed += count as u64;
    }

    /// 📬 Close out a commit: bump `committed`, report what's left queued and how long the
    /// last send took.
    pub(crate) fn record_commit(&self, worker: usize, queued: usize, took: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let mut stats = self.lock();
        stats.committed += 1;
        if let Some(slot) = stats.workers.get_mut(worker) {
            slot.queued = queued as u64;
            if let Some(took) = took {
                slot.last_duration = took;
            }
        }
    }

    /// 📸 Deep copy. Hold it as long as you like.
    pub(crate) fn snapshot(&self) -> BulkProcessorStats {
        self.lock().clone()
    }
}

fn tally(stats: &mut BulkProcessorStats, op_type: &str, succeeded: bool) {
    match op_type {
        "index" => stats.indexed += 1,
        "create" => stats.created += 1,
        "update" => stats.updated += 1,
        "delete" => stats.deleted += 1,
        _ => {}
    }
    if succeeded {
        stats.succeeded += 1;
    } else {
        stats.failed += 1;
    }
}
