//! Copy-on-write item cache.
//!
//! The cache holds an immutable mapping behind a single mutex. Readers clone
//! the `Arc` (or look up one entry) under the lock; reconciliation builds a
//! complete replacement mapping off to the side and swaps it in with one
//! pointer store. A reader therefore sees either the previous complete mapping
//! or the next one, never a partially populated one.
//!
//! The lock is held only for lookup, snapshot and swap; never across a
//! suspending or blocking call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::item::Item;

/// Mapping from item path to item.
pub type ItemMap = HashMap<String, Item>;

/// Thread-safe cache of a collection's items.
#[derive(Debug, Default)]
pub struct ItemCache {
    items: Mutex<Arc<ItemMap>>,
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one item by path.
    #[inline]
    pub fn lookup(&self, path: &str) -> Option<Item> {
        let item = self.items.lock().get(path).cloned();
        trace!(path, hit = item.is_some(), "item cache lookup");
        item
    }

    /// The current mapping. Later swaps do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<ItemMap> {
        Arc::clone(&*self.items.lock())
    }

    /// All cached items, each one a new shared handle.
    pub fn items(&self) -> Vec<Item> {
        self.snapshot().values().cloned().collect()
    }

    /// Swap in a complete new mapping, returning the previous one.
    ///
    /// The previous mapping is released by the caller, outside the lock.
    pub fn replace(&self, next: ItemMap) -> Arc<ItemMap> {
        let next = Arc::new(next);
        let previous = std::mem::replace(&mut *self.items.lock(), next);
        trace!(previous = previous.len(), "item cache swapped");
        previous
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Get cache statistics for monitoring and debugging.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
        }
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached items
    pub entries: usize,
}
