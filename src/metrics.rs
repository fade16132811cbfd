use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks for counting bookkeeping operations of a mounted filesystem.
///
/// Implementations observe reverse-map and reference-count updates, CoW
/// staging and btree block traffic. The session calls them after each
/// operation succeeds.
pub trait AgMetrics: Send + Sync {
    /// A reverse mapping was added.
    fn rmap_mapped(&self);

    /// A reverse mapping was removed.
    fn rmap_unmapped(&self);

    /// A shared-count adjustment ran.
    ///
    /// # Parameters
    /// * `direction` - `"increase"` or `"decrease"`.
    fn refcount_adjusted(&self, direction: &'static str);

    /// A CoW staging extent was created (`true`) or dropped (`false`).
    fn cow_staging(&self, created: bool);

    /// A btree grew (`true`) or shrank (`false`) by one block.
    fn btree_block(&self, allocated: bool);

    /// Queued reverse-map intents were applied.
    fn intents_applied(&self, count: usize);
}

/// Discards every event.
#[derive(Default)]
pub struct NoopMetrics;

impl AgMetrics for NoopMetrics {
    fn rmap_mapped(&self) {}
    fn rmap_unmapped(&self) {}
    fn refcount_adjusted(&self, _direction: &'static str) {}
    fn cow_staging(&self, _created: bool) {}
    fn btree_block(&self, _allocated: bool) {}
    fn intents_applied(&self, _count: usize) {}
}

/// Atomic counters for every event.
#[derive(Default)]
pub struct CounterMetrics {
    /// Reverse mappings added.
    pub rmaps_mapped: AtomicU64,

    /// Reverse mappings removed.
    pub rmaps_unmapped: AtomicU64,

    /// Shared-count increases.
    pub refcount_increases: AtomicU64,

    /// Shared-count decreases.
    pub refcount_decreases: AtomicU64,

    /// CoW staging extents created.
    pub cow_staged: AtomicU64,

    /// CoW staging extents dropped.
    pub cow_dropped: AtomicU64,

    /// Btree blocks allocated.
    pub btree_blocks_allocated: AtomicU64,

    /// Btree blocks freed.
    pub btree_blocks_freed: AtomicU64,

    /// Intents applied from the deferred queue.
    pub intents_applied: AtomicU64,
}

impl AgMetrics for CounterMetrics {
    fn rmap_mapped(&self) {
        self.rmaps_mapped.fetch_add(1, Ordering::Relaxed);
    }

    fn rmap_unmapped(&self) {
        self.rmaps_unmapped.fetch_add(1, Ordering::Relaxed);
    }

    fn refcount_adjusted(&self, direction: &'static str) {
        match direction {
            "increase" => {
                self.refcount_increases.fetch_add(1, Ordering::Relaxed);
            }
            "decrease" => {
                self.refcount_decreases.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn cow_staging(&self, created: bool) {
        if created {
            self.cow_staged.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cow_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn btree_block(&self, allocated: bool) {
        if allocated {
            self.btree_blocks_allocated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.btree_blocks_freed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn intents_applied(&self, count: usize) {
        self.intents_applied.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// The default metrics sink, a [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn AgMetrics> {
    Arc::new(NoopMetrics)
}
