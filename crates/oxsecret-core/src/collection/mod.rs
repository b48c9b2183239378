//! Live collection proxies.
//!
//! A [`Collection`] mirrors one remote secret collection. Its scalar
//! properties are read straight from the proxy's property cache; its items are
//! kept in an [`ItemCache`] that is rebuilt by reconciliation whenever the
//! remote item list changes.
//!
//! # Construction
//!
//! [`Collection::create`] and [`Collection::create_sync`] run the same steps:
//!
//! 1. open the collection proxy
//! 2. fail with [`CollectionError::NoSuchCollection`] if the remote object is
//!    absent (no cached properties)
//! 3. load the initial item set
//!
//! Only then is the collection handed out. Item-list notifications that arrive
//! while step 3 is still running are ignored.
//!
//! # Notifications
//!
//! A listener task on the service runtime turns every change batch into one
//! [`CollectionEvent::PropertiesChanged`] and, when the item list changed,
//! starts a background reconciliation. Background failures are logged only.

pub mod cache;
mod dispatch;
mod reconcile;

pub use cache::{CacheStats, ItemCache, ItemMap};
pub use dispatch::{CollectionEvent, CollectionProperty};
pub use reconcile::ReconcileSummary;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::item::{Item, ItemError};
use crate::metrics::CollectionMetrics;
use crate::service::{Service, ServiceBinding, ServiceContext, ServiceError};
use crate::transport::{
    COLLECTION_INTERFACE, ObjectProxy, PropertyChanges, TransportError, Variant, property,
};
use dispatch::{Dispatch, classify};
use reconcile::Reconciler;

/// Errors from collection operations.
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("No such secret collection at path: {path}")]
    NoSuchCollection { path: String },

    #[error("Collection {path} has no cached {property} property")]
    MissingProperty {
        path: String,
        property: &'static str,
    },

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Failed to load {} item(s) of collection {path}", .failures.len())]
    PartialReconciliation {
        path: String,
        failures: Vec<ItemLoadFailure>,
    },

    #[error("Collection {path} is detached from its service")]
    ServiceDetached { path: String },

    #[error("Service error: {0}")]
    Service(ServiceError),
}

impl From<TransportError> for CollectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => CollectionError::Cancelled,
            other => CollectionError::Transport(other),
        }
    }
}

impl From<ServiceError> for CollectionError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Cancelled => CollectionError::Cancelled,
            ServiceError::Transport(t) => CollectionError::Transport(t),
            other => CollectionError::Service(other),
        }
    }
}

impl CollectionError {
    /// True when the operation was aborted through its cancellation token.
    ///
    /// Cancellation is not a failure; callers usually do not report it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CollectionError::Cancelled)
    }
}

/// One item that could not be constructed during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLoadFailure {
    pub path: String,
    pub error: ItemError,
}

impl fmt::Display for ItemLoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.error)
    }
}

struct CollectionShared {
    binding: Arc<ServiceBinding>,
    reconciler: Reconciler,
    /// Set until the initial item set is loaded.
    constructing: AtomicBool,
    /// Cancelled when the last handle goes away.
    lifetime: CancellationToken,
}

impl CollectionShared {
    fn path(&self) -> &str {
        self.reconciler.proxy.object_path()
    }

    fn apply(&self, dispatch: &Dispatch) {
        self.reconciler.metrics.record_notification();

        if let Some(event) = dispatch.event() {
            trace!(collection = self.path(), ?event, "Property change");
            let _ = self.reconciler.events.send(event);
        }

        if !dispatch.items_changed {
            return;
        }
        if self.constructing.load(Ordering::Acquire) {
            trace!(collection = self.path(), "Item list changed while constructing, ignored");
            self.reconciler.metrics.record_suppressed_reload();
            return;
        }
        match self.binding.context() {
            Some(context) => self.spawn_reconcile(context, "items changed"),
            None => debug!(
                collection = self.path(),
                "Item list changed but service is gone, not reloading"
            ),
        }
    }

    /// Start a background reconciliation pass. Errors are logged, not returned.
    fn spawn_reconcile(&self, context: ServiceContext, reason: &'static str) {
        let reconciler = self.reconciler.clone();
        let cancel = self.lifetime.child_token();
        let runtime = context.runtime().clone();
        runtime.spawn(async move {
            let path = reconciler.proxy.object_path().to_string();
            debug!(collection = %path, reason, "Background reconciliation");
            match reconciler.run(&context, &cancel).await {
                Ok(summary) => {
                    trace!(collection = %path, ?summary, "Background reconciliation done");
                }
                Err(e) if e.is_cancelled() => {
                    debug!(collection = %path, "Background reconciliation cancelled");
                }
                Err(e) => warn!(collection = %path, error = %e, "Background reconciliation failed"),
            }
        });
    }
}

impl Drop for CollectionShared {
    fn drop(&mut self) {
        self.lifetime.cancel();
        trace!(collection = self.path(), "Collection released");
    }
}

/// Forward change batches to the collection until it is released.
async fn listen(
    shared: Weak<CollectionShared>,
    mut changes: broadcast::Receiver<PropertyChanges>,
    lifetime: CancellationToken,
) {
    loop {
        let dispatch = tokio::select! {
            biased;
            () = lifetime.cancelled() => break,
            received = changes.recv() => match received {
                Ok(batch) => classify(&batch),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed property notifications, assuming everything changed");
                    Dispatch::everything()
                }
                Err(RecvError::Closed) => break,
            },
        };

        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.apply(&dispatch);
    }
    trace!("Collection listener stopped");
}

/// Shared handle to a live collection.
///
/// Clones refer to the same collection. When the last clone is dropped,
/// background work started for it is cancelled.
#[derive(Clone)]
pub struct Collection {
    shared: Arc<CollectionShared>,
}

impl Collection {
    /// Open the collection at `path` and load its items.
    #[instrument(level = "debug", skip(service, cancel))]
    pub async fn create(
        service: &Service,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Self, CollectionError> {
        let context = service.context();
        let proxy = context
            .call(
                "open_proxy",
                path,
                cancel,
                context
                    .transport()
                    .open_proxy(path, COLLECTION_INTERFACE, cancel),
            )
            .await?;

        let collection = Self::attach(service, proxy)?;
        collection.shared.reconciler.run(context, cancel).await?;
        collection.mark_ready();
        Ok(collection)
    }

    /// Blocking variant of [`create`](Self::create).
    #[instrument(level = "debug", skip(service, cancel))]
    pub fn create_sync(
        service: &Service,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Self, CollectionError> {
        if cancel.is_cancelled() {
            return Err(CollectionError::Cancelled);
        }
        let context = service.context();
        let proxy = context
            .transport()
            .open_proxy_sync(path, COLLECTION_INTERFACE, cancel)?;

        let collection = Self::attach(service, proxy)?;
        collection.shared.reconciler.run_sync(context, cancel)?;
        collection.mark_ready();
        Ok(collection)
    }

    /// Existence check, service registration and listener start-up.
    fn attach(service: &Service, proxy: Arc<dyn ObjectProxy>) -> Result<Self, CollectionError> {
        if !proxy.has_cached_properties() {
            return Err(CollectionError::NoSuchCollection {
                path: proxy.object_path().to_string(),
            });
        }

        let context = service.context();
        let (events, _) = broadcast::channel(context.config().event_capacity);
        // Subscribe before the first pass so no item-list change is lost
        let changes = proxy.subscribe();

        let shared = Arc::new(CollectionShared {
            binding: service.register(),
            reconciler: Reconciler {
                proxy,
                cache: Arc::new(ItemCache::new()),
                metrics: Arc::new(CollectionMetrics::new()),
                events,
            },
            constructing: AtomicBool::new(true),
            lifetime: CancellationToken::new(),
        });

        context.runtime().spawn(listen(
            Arc::downgrade(&shared),
            changes,
            shared.lifetime.clone(),
        ));

        Ok(Self { shared })
    }

    fn mark_ready(&self) {
        self.shared.constructing.store(false, Ordering::Release);
        info!(
            collection = self.path(),
            items = self.shared.reconciler.cache.len(),
            "Collection ready"
        );
    }

    fn context(&self) -> Result<ServiceContext, CollectionError> {
        self.shared
            .binding
            .context()
            .ok_or_else(|| CollectionError::ServiceDetached {
                path: self.path().to_string(),
            })
    }

    pub fn path(&self) -> &str {
        self.shared.path()
    }

    /// The service this collection was created through, or `None` once the
    /// service has been torn down.
    pub fn service(&self) -> Option<ServiceContext> {
        self.shared.binding.context()
    }

    /// Whether the initial item set has been loaded.
    pub fn is_ready(&self) -> bool {
        !self.shared.constructing.load(Ordering::Acquire)
    }

    /// All cached items.
    pub fn list_items(&self) -> Vec<Item> {
        self.shared.reconciler.cache.items()
    }

    pub fn find_item(&self, path: &str) -> Option<Item> {
        self.shared.reconciler.cache.lookup(path)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.reconciler.cache.stats()
    }

    pub fn label(&self) -> String {
        self.cached(property::LABEL)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Missing values read as locked.
    pub fn locked(&self) -> bool {
        self.cached(property::LOCKED)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn created(&self) -> u64 {
        self.cached(property::CREATED)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    pub fn modified(&self) -> u64 {
        self.cached(property::MODIFIED)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    fn cached(&self, name: &str) -> Option<Variant> {
        self.shared.reconciler.proxy.cached_property(name)
    }

    /// Change the remote label.
    ///
    /// The local label changes when the remote peer's notification arrives,
    /// not when this call returns.
    #[instrument(level = "debug", skip(self, cancel), fields(collection = %self.path()))]
    pub async fn set_label(
        &self,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CollectionError> {
        let context = self.context()?;
        let proxy = &self.shared.reconciler.proxy;
        context
            .call(
                "set_property",
                self.path(),
                cancel,
                proxy.set_property(property::LABEL, Variant::Str(label.to_string()), cancel),
            )
            .await?;
        debug!("Label change acknowledged");
        Ok(())
    }

    /// Blocking variant of [`set_label`](Self::set_label).
    #[instrument(level = "debug", skip(self, cancel), fields(collection = %self.path()))]
    pub fn set_label_sync(
        &self,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CollectionError> {
        if cancel.is_cancelled() {
            return Err(CollectionError::Cancelled);
        }
        self.context()?;
        self.shared.reconciler.proxy.set_property_sync(
            property::LABEL,
            Variant::Str(label.to_string()),
            cancel,
        )?;
        debug!("Label change acknowledged");
        Ok(())
    }

    /// Delete the remote collection.
    ///
    /// This handle is stale afterwards and should be dropped.
    #[instrument(level = "debug", skip(self, cancel), fields(collection = %self.path()))]
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<(), CollectionError> {
        self.context()?.delete_path(self.path(), cancel).await?;
        info!(collection = self.path(), "Collection deleted");
        Ok(())
    }

    /// Blocking variant of [`delete`](Self::delete).
    ///
    /// Drives a private event loop; fails with
    /// [`ServiceError::NestedBlockingCall`] when called from a runtime thread.
    #[instrument(level = "debug", skip(self, cancel), fields(collection = %self.path()))]
    pub fn delete_sync(&self, cancel: &CancellationToken) -> Result<(), CollectionError> {
        self.context()?.delete_path_sync(self.path(), cancel)?;
        info!(collection = self.path(), "Collection deleted");
        Ok(())
    }

    /// Re-read the remote properties and rebuild the item cache in the
    /// background. Errors are logged.
    pub fn refresh(&self) {
        let Some(context) = self.shared.binding.context() else {
            debug!(collection = self.path(), "Refresh skipped, service is gone");
            return;
        };
        let reconciler = self.shared.reconciler.clone();
        let cancel = self.shared.lifetime.child_token();
        let runtime = context.runtime().clone();

        runtime.spawn(async move {
            let path = reconciler.proxy.object_path().to_string();
            let reload = context
                .call(
                    "reload_properties",
                    &path,
                    &cancel,
                    reconciler.proxy.reload_properties(&cancel),
                )
                .await;
            if let Err(e) = reload {
                if e != TransportError::Cancelled {
                    warn!(collection = %path, error = %e, "Refresh failed to reload properties");
                }
                return;
            }
            match reconciler.run(&context, &cancel).await {
                Ok(summary) => debug!(collection = %path, ?summary, "Refresh done"),
                Err(e) if e.is_cancelled() => debug!(collection = %path, "Refresh cancelled"),
                Err(e) => warn!(collection = %path, error = %e, "Refresh failed"),
            }
        });
    }

    /// Rebuild the item cache now and wait for the result.
    #[instrument(level = "debug", skip(self, cancel), fields(collection = %self.path()))]
    pub async fn refresh_items(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReconcileSummary, CollectionError> {
        let context = self.context()?;
        self.shared.reconciler.run(&context, cancel).await
    }

    /// Blocking variant of [`refresh_items`](Self::refresh_items).
    #[instrument(level = "debug", skip(self, cancel), fields(collection = %self.path()))]
    pub fn refresh_items_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReconcileSummary, CollectionError> {
        let context = self.context()?;
        self.shared.reconciler.run_sync(&context, cancel)
    }

    /// Subscribe to property and item-list change events.
    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.shared.reconciler.events.subscribe()
    }

    pub fn metrics(&self) -> &CollectionMetrics {
        &self.shared.reconciler.metrics
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("path", &self.path())
            .field("items", &self.shared.reconciler.cache.len())
            .field("ready", &self.is_ready())
            .field("attached", &self.shared.binding.is_attached())
            .finish()
    }
}
