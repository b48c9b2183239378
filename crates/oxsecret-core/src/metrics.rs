//! Reconciliation and notification counters for profiling and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-collection counters.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct CollectionMetrics {
    /// Reconciliation passes started (any trigger)
    pub reconciliations_started: AtomicU64,

    /// Passes that swapped a new mapping into the cache
    pub reconciliations_completed: AtomicU64,

    /// Passes that left the cache untouched because of an error
    pub reconciliations_failed: AtomicU64,

    /// Cached items carried over into a new mapping
    pub items_reused: AtomicU64,

    /// Items constructed successfully
    pub items_constructed: AtomicU64,

    /// Item constructions that failed or were cancelled
    pub item_failures: AtomicU64,

    /// Change batches received from the transport
    pub notifications: AtomicU64,

    /// Item-list changes ignored while the collection was still constructing
    pub suppressed_reloads: AtomicU64,
}

impl CollectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a reconciliation pass
    #[inline]
    pub fn record_reconciliation_started(&self) {
        self.reconciliations_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pass that published its mapping
    #[inline]
    pub fn record_reconciliation_completed(&self, reused: u64, constructed: u64) {
        self.reconciliations_completed.fetch_add(1, Ordering::Relaxed);
        self.items_reused.fetch_add(reused, Ordering::Relaxed);
        self.items_constructed.fetch_add(constructed, Ordering::Relaxed);
    }

    /// Record a pass that left the cache untouched
    #[inline]
    pub fn record_reconciliation_failed(&self, failures: u64) {
        self.reconciliations_failed.fetch_add(1, Ordering::Relaxed);
        self.item_failures.fetch_add(failures, Ordering::Relaxed);
    }

    /// Record a change batch from the transport
    #[inline]
    pub fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an item-list change ignored during construction
    #[inline]
    pub fn record_suppressed_reload(&self) {
        self.suppressed_reloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> CollectionMetricsSnapshot {
        CollectionMetricsSnapshot {
            reconciliations_started: self.reconciliations_started.load(Ordering::Relaxed),
            reconciliations_completed: self.reconciliations_completed.load(Ordering::Relaxed),
            reconciliations_failed: self.reconciliations_failed.load(Ordering::Relaxed),
            items_reused: self.items_reused.load(Ordering::Relaxed),
            items_constructed: self.items_constructed.load(Ordering::Relaxed),
            item_failures: self.item_failures.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            suppressed_reloads: self.suppressed_reloads.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.reconciliations_started.store(0, Ordering::Relaxed);
        self.reconciliations_completed.store(0, Ordering::Relaxed);
        self.reconciliations_failed.store(0, Ordering::Relaxed);
        self.items_reused.store(0, Ordering::Relaxed);
        self.items_constructed.store(0, Ordering::Relaxed);
        self.item_failures.store(0, Ordering::Relaxed);
        self.notifications.store(0, Ordering::Relaxed);
        self.suppressed_reloads.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`CollectionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionMetricsSnapshot {
    pub reconciliations_started: u64,
    pub reconciliations_completed: u64,
    pub reconciliations_failed: u64,
    pub items_reused: u64,
    pub items_constructed: u64,
    pub item_failures: u64,
    pub notifications: u64,
    pub suppressed_reloads: u64,
}

impl CollectionMetricsSnapshot {
    /// Passes that have finished, successfully or not.
    pub fn reconciliations_finished(&self) -> u64 {
        self.reconciliations_completed + self.reconciliations_failed
    }
}
