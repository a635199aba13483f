//! Global memory accounting and admission control

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Tracks bytes owned by all blocks of one map
///
/// Writes are admitted only while `allocated + requested <= limit`. Updates can
/// be switched off during bulk load; the owner recomputes the total afterwards.
#[derive(Debug)]
pub struct MemoryTracker {
    allocated: AtomicU64,
    limit: Option<u64>,
    stats_disabled: AtomicBool,
}

impl MemoryTracker {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            allocated: AtomicU64::new(0),
            limit,
            stats_disabled: AtomicBool::new(false),
        }
    }

    /// Apply a signed delta to the allocated counter
    pub fn incr(&self, delta: i64) {
        if delta == 0 || self.stats_updates_disabled() {
            return;
        }
        if delta > 0 {
            self.allocated.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            let dec = delta.unsigned_abs();
            // never wrap below zero
            let _ = self
                .allocated
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_sub(dec)));
        }
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Would admitting `extra` more bytes cross the limit?
    pub fn would_exceed(&self, extra: u64) -> bool {
        match self.limit {
            Some(limit) => self.allocated().saturating_add(extra) > limit,
            None => false,
        }
    }

    pub fn set_stats_updates_disabled(&self, disabled: bool) {
        self.stats_disabled.store(disabled, Ordering::Release);
    }

    pub fn stats_updates_disabled(&self) -> bool {
        self.stats_disabled.load(Ordering::Acquire)
    }

    /// Overwrite the counter after a full recount
    pub fn reset(&self, allocated: u64) {
        self.allocated.store(allocated, Ordering::Relaxed);
    }
}
