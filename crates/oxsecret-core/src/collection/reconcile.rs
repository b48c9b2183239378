//! Item reconciliation.
//!
//! A pass reads the remote item-path list, reuses every item already in the
//! cache, constructs the missing ones, and swaps the complete candidate
//! mapping into the cache. The async pass fans constructions out on the
//! service runtime and fans them back in through a [`JoinGroup`]; the blocking
//! pass constructs them one at a time on the calling thread.
//!
//! Failure policy is the same on both paths: if any construction fails the
//! candidate mapping is discarded and the previous cache stays in place. The
//! async pass still waits for every construction and reports all failures;
//! the blocking pass stops at the first one.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::cache::{ItemCache, ItemMap};
use super::dispatch::CollectionEvent;
use super::{CollectionError, ItemLoadFailure};
use crate::item::{Item, ItemError};
use crate::join::JoinGroup;
use crate::metrics::CollectionMetrics;
use crate::service::ServiceContext;
use crate::transport::{ObjectProxy, property};

/// What a successful pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Items in the new mapping
    pub total: usize,
    /// Items carried over from the previous mapping
    pub reused: usize,
    /// Items constructed by this pass
    pub constructed: usize,
}

/// Candidate mapping being assembled by one async pass.
struct Candidate {
    items: ItemMap,
    failures: Vec<ItemLoadFailure>,
}

impl Candidate {
    fn record(&mut self, path: String, result: Result<Item, ItemError>) {
        match result {
            Ok(item) => {
                self.items.insert(path, item);
            }
            Err(error) => self.failures.push(ItemLoadFailure { path, error }),
        }
    }
}

struct Plan {
    candidate: ItemMap,
    missing: Vec<String>,
}

/// Started pass in the metrics. A pass dropped before [`finish`](Self::finish)
/// is counted as failed.
struct PassRecord<'a> {
    metrics: &'a CollectionMetrics,
    finished: bool,
}

impl<'a> PassRecord<'a> {
    fn start(metrics: &'a CollectionMetrics) -> Self {
        metrics.record_reconciliation_started();
        Self {
            metrics,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for PassRecord<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.record_reconciliation_failed(0);
        }
    }
}

/// State one pass needs, detached from the collection handle so that a pass
/// running in the background does not keep the collection alive.
#[derive(Clone)]
pub(crate) struct Reconciler {
    pub(crate) proxy: Arc<dyn ObjectProxy>,
    pub(crate) cache: Arc<ItemCache>,
    pub(crate) metrics: Arc<CollectionMetrics>,
    pub(crate) events: broadcast::Sender<CollectionEvent>,
}

impl Reconciler {
    fn collection_path(&self) -> &str {
        self.proxy.object_path()
    }

    fn remote_paths(&self) -> Result<Vec<String>, CollectionError> {
        self.proxy
            .cached_property(property::ITEMS)
            .and_then(|v| v.as_object_paths().map(<[String]>::to_vec))
            .ok_or_else(|| CollectionError::MissingProperty {
                path: self.collection_path().to_string(),
                property: property::ITEMS,
            })
    }

    /// Split the remote list into cached items (reused as-is) and paths that
    /// still need an item.
    fn plan(&self, paths: Vec<String>) -> Plan {
        let mut seen = HashSet::with_capacity(paths.len());
        let mut candidate = ItemMap::with_capacity(paths.len());
        let mut missing = Vec::new();

        for path in paths {
            if !seen.insert(path.clone()) {
                continue;
            }
            match self.cache.lookup(&path) {
                Some(item) => {
                    candidate.insert(path, item);
                }
                None => missing.push(path),
            }
        }

        trace!(
            reused = candidate.len(),
            missing = missing.len(),
            "Planned reconciliation"
        );
        Plan { candidate, missing }
    }

    fn publish(&self, items: ItemMap, reused: usize, constructed: usize) -> ReconcileSummary {
        let total = items.len();
        let previous = self.cache.replace(items);
        drop(previous);

        self.metrics
            .record_reconciliation_completed(reused as u64, constructed as u64);
        // No subscribers is fine
        let _ = self.events.send(CollectionEvent::ItemsChanged { count: total });

        debug!(
            collection = self.collection_path(),
            total, reused, constructed, "Item cache updated"
        );
        ReconcileSummary {
            total,
            reused,
            constructed,
        }
    }

    fn fail(&self, failures: Vec<ItemLoadFailure>, abandoned: usize) -> CollectionError {
        self.metrics
            .record_reconciliation_failed((failures.len() + abandoned) as u64);

        if failures.iter().all(|f| f.error.is_cancelled()) {
            debug!(
                collection = self.collection_path(),
                "Reconciliation cancelled, cache left unchanged"
            );
            return CollectionError::Cancelled;
        }

        for failure in &failures {
            warn!(
                collection = self.collection_path(),
                item = %failure.path,
                error = %failure.error,
                "Failed to load item"
            );
        }
        CollectionError::PartialReconciliation {
            path: self.collection_path().to_string(),
            failures,
        }
    }

    /// Run one async pass.
    pub(crate) async fn run(
        &self,
        context: &ServiceContext,
        cancel: &CancellationToken,
    ) -> Result<ReconcileSummary, CollectionError> {
        let pass = PassRecord::start(&self.metrics);
        let paths = self.remote_paths()?;
        let Plan { candidate, missing } = self.plan(paths);
        let reused = candidate.len();
        let constructed = missing.len();

        let (group, done) = JoinGroup::with_channel(Candidate {
            items: candidate,
            failures: Vec::new(),
        });

        // Constructions are aborted when this pass finishes or is dropped
        let scope = cancel.child_token();
        let _scope_guard = scope.clone().drop_guard();
        let limiter = Arc::new(Semaphore::new(context.config().item_load_concurrency));
        let runtime = context.runtime().clone();

        for path in missing {
            let ticket = group.add();
            let context = context.clone();
            let limiter = Arc::clone(&limiter);
            let scope = scope.clone();
            runtime.spawn(async move {
                let result = match limiter.acquire_owned().await {
                    Ok(_permit) => Item::new(&context, &path, &scope).await,
                    Err(_) => Err(ItemError::Cancelled),
                };
                ticket.complete(move |candidate: &mut Candidate| candidate.record(path, result));
            });
        }
        group.seal();

        let outcome = done.await.map_err(|_| CollectionError::Cancelled)?;
        let Candidate { items, failures } = outcome.value;
        let result = if failures.is_empty() && outcome.abandoned == 0 {
            Ok(self.publish(items, reused, constructed))
        } else {
            Err(self.fail(failures, outcome.abandoned))
        };
        pass.finish();
        result
    }

    /// Run one blocking pass on the calling thread.
    pub(crate) fn run_sync(
        &self,
        context: &ServiceContext,
        cancel: &CancellationToken,
    ) -> Result<ReconcileSummary, CollectionError> {
        let pass = PassRecord::start(&self.metrics);
        let paths = self.remote_paths()?;
        let Plan {
            mut candidate,
            missing,
        } = self.plan(paths);
        let reused = candidate.len();
        let constructed = missing.len();

        for path in missing {
            match Item::new_sync(context, &path, cancel) {
                Ok(item) => {
                    candidate.insert(path, item);
                }
                Err(error) => {
                    let err = self.fail(vec![ItemLoadFailure { path, error }], 0);
                    pass.finish();
                    return Err(err);
                }
            }
        }

        let summary = self.publish(candidate, reused, constructed);
        pass.finish();
        Ok(summary)
    }
}
