use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking page-lifecycle activity in the storage environment.
///
/// Implementations collect counts of scratch allocations, version lookups,
/// temporary page requests and journal flushes for monitoring and profiling.
pub trait StorageMetrics: Send + Sync {
    /// Records a scratch allocation of `pages` pages.
    fn scratch_allocated(&self, pages: u64);

    /// Records a scratch free.
    ///
    /// # Parameters
    /// * `pending` - `true` when reuse waits on older readers, `false` for a rollback free.
    fn scratch_freed(&self, pending: bool);

    /// Records a version lookup and whether it resolved to a scratch location.
    fn page_resolved(&self, found: bool);

    /// Records a temporary page handed out by the decompression pool.
    fn temp_page_acquired(&self, bytes: usize);

    /// Records a journal flush.
    fn journal_flushed(&self, frames: usize, bytes: u64);
}

/// A no-op implementation of [`StorageMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl StorageMetrics for NoopMetrics {
    fn scratch_allocated(&self, _pages: u64) {}
    fn scratch_freed(&self, _pending: bool) {}
    fn page_resolved(&self, _found: bool) {}
    fn temp_page_acquired(&self, _bytes: usize) {}
    fn journal_flushed(&self, _frames: usize, _bytes: u64) {}
}

/// A thread-safe counter-based implementation of [`StorageMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Scratch allocations served.
    pub scratch_allocations: AtomicU64,

    /// Pages handed out by scratch allocations.
    pub scratch_pages_allocated: AtomicU64,

    /// Frees deferred behind older readers.
    pub scratch_pending_frees: AtomicU64,

    /// Frees reusable immediately.
    pub scratch_immediate_frees: AtomicU64,

    /// Lookups that found a visible version.
    pub resolve_hits: AtomicU64,

    /// Lookups that found nothing visible.
    pub resolve_misses: AtomicU64,

    /// Temporary pages handed out.
    pub temp_pages: AtomicU64,

    /// Bytes handed out as temporary pages.
    pub temp_page_bytes: AtomicU64,

    /// Journal frames written.
    pub journal_frames: AtomicU64,

    /// Journal bytes written.
    pub journal_bytes: AtomicU64,
}

impl StorageMetrics for CounterMetrics {
    fn scratch_allocated(&self, pages: u64) {
        self.scratch_allocations.fetch_add(1, Ordering::Relaxed);
        self.scratch_pages_allocated
            .fetch_add(pages, Ordering::Relaxed);
    }

    fn scratch_freed(&self, pending: bool) {
        if pending {
            self.scratch_pending_frees.fetch_add(1, Ordering::Relaxed);
        } else {
            self.scratch_immediate_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn page_resolved(&self, found: bool) {
        if found {
            self.resolve_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.resolve_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn temp_page_acquired(&self, bytes: usize) {
        self.temp_pages.fetch_add(1, Ordering::Relaxed);
        self.temp_page_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn journal_flushed(&self, frames: usize, bytes: u64) {
        self.journal_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.journal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StorageMetrics> {
    Arc::new(NoopMetrics)
}
