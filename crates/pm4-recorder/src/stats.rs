use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of [`RecorderStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecorderStatsSnapshot {
    pub draws: u64,
    pub dispatches: u64,
    pub barriers: u64,
    pub cache_flushes: u64,
    pub upload_bytes: u64,
    pub prolog_cache_hits: u64,
    pub prolog_cache_misses: u64,
    pub submissions: u64,
}

/// Device-wide recording counters.
///
/// Updated from every command buffer of a device; readers on other threads see relaxed
/// values.
#[derive(Debug, Default)]
pub struct RecorderStats {
    draws: AtomicU64,
    dispatches: AtomicU64,
    barriers: AtomicU64,
    cache_flushes: AtomicU64,
    upload_bytes: AtomicU64,
    prolog_cache_hits: AtomicU64,
    prolog_cache_misses: AtomicU64,
    submissions: AtomicU64,
}

impl RecorderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_draws(&self, count: u64) {
        self.draws.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_dispatches(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_barriers(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_flushes(&self) {
        self.cache_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_upload_bytes(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_prolog_cache_hits(&self) {
        self.prolog_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_prolog_cache_misses(&self) {
        self.prolog_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submissions(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RecorderStatsSnapshot {
        RecorderStatsSnapshot {
            draws: self.draws.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            cache_flushes: self.cache_flushes.load(Ordering::Relaxed),
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
            prolog_cache_hits: self.prolog_cache_hits.load(Ordering::Relaxed),
            prolog_cache_misses: self.prolog_cache_misses.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
        }
    }
}
