//! Service context and the registry of dependent collections.
//!
//! A [`Service`] owns the transport connection and the runtime handle that
//! drives asynchronous completions and change notifications. Collections never
//! own the service. Instead each collection registers a [`ServiceBinding`] and
//! the service detaches every binding when its last handle is dropped, so a
//! collection can observe "the service is gone" instead of reading a dangling
//! back-reference.
//!
//! # Teardown
//!
//! ```ignore
//! let service = Service::with_defaults(transport, runtime.handle().clone());
//! let login = "/org/freedesktop/secrets/collection/login";
//! let collection = Collection::create(&service, login, &cancel).await?;
//!
//! drop(service);
//! assert!(collection.service().is_none());
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::{ConfigError, ServiceConfig};
use crate::sync;
use crate::transport::{Transport, TransportError};

/// Errors from service-level operations.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Blocking call issued from a thread driving an async runtime; use the async variant")]
    NestedBlockingCall,

    #[error("Failed to start private event loop: {0}")]
    Runtime(#[source] std::io::Error),
}

impl From<TransportError> for ServiceError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => ServiceError::Cancelled,
            other => ServiceError::Transport(other),
        }
    }
}

impl ServiceError {
    /// True when the operation was aborted through its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ServiceError::Cancelled)
    }
}

/// Everything a dependent object needs to talk to the remote service.
///
/// Cheap to clone; all fields are shared.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    config: Arc<ServiceConfig>,
}

impl ServiceContext {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Runtime driving fire-and-forget work (notification listeners, reactive
    /// reconciliation).
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Run one transport round-trip under the configured timeout and the
    /// caller's cancellation token.
    pub(crate) async fn call<T, F>(
        &self,
        method: &'static str,
        path: &str,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let timeout = self.config.call_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                trace!(method, path, "Transport call cancelled");
                Err(TransportError::Cancelled)
            }
            res = tokio::time::timeout(timeout, fut) => res.unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    path: path.to_string(),
                    timeout,
                })
            }),
        }
    }

    /// Delete the remote object at `path`.
    #[instrument(level = "debug", skip(self, cancel))]
    pub async fn delete_path(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        self.call("delete_object", path, cancel, self.transport.delete_object(path, cancel))
            .await?;
        debug!("Deleted remote object");
        Ok(())
    }

    /// Blocking variant of [`delete_path`](Self::delete_path).
    ///
    /// Runs on a private event loop; must not be called from a thread that is
    /// driving an async runtime.
    pub fn delete_path_sync(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        sync::block_on(self.delete_path(path, cancel))?
    }
}

/// A collection's link to its service.
///
/// Cleared by the service on teardown, under the binding's own lock, so a
/// reader either gets a usable context or `None`.
#[derive(Debug)]
pub(crate) struct ServiceBinding {
    id: u64,
    context: RwLock<Option<ServiceContext>>,
}

impl ServiceBinding {
    pub(crate) fn context(&self) -> Option<ServiceContext> {
        self.context.read().clone()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.context.read().is_some()
    }

    fn detach(&self) {
        if self.context.write().take().is_some() {
            trace!(binding = self.id, "Detached collection from service");
        }
    }
}

/// Registry of bindings handed out by one service.
#[derive(Debug, Default)]
struct ServiceRegistry {
    bindings: DashMap<u64, Weak<ServiceBinding>>,
    next_id: AtomicU64,
}

impl ServiceRegistry {
    fn register(&self, context: ServiceContext) -> Arc<ServiceBinding> {
        // Prune bindings whose collections are gone
        self.bindings.retain(|_, binding| binding.strong_count() > 0);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let binding = Arc::new(ServiceBinding {
            id,
            context: RwLock::new(Some(context)),
        });
        self.bindings.insert(id, Arc::downgrade(&binding));
        binding
    }

    fn live(&self) -> usize {
        self.bindings
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    fn detach_all(&self) -> usize {
        let mut detached = 0;
        for entry in &self.bindings {
            if let Some(binding) = entry.value().upgrade() {
                binding.detach();
                detached += 1;
            }
        }
        self.bindings.clear();
        detached
    }
}

#[derive(Debug)]
struct ServiceInner {
    context: ServiceContext,
    registry: ServiceRegistry,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        let detached = self.registry.detach_all();
        debug!(detached, "Service torn down");
    }
}

/// Handle to the remote secret service.
///
/// Cloning shares the same connection; teardown happens when the last clone
/// is dropped.
#[derive(Debug, Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Create a service over `transport`, spawning background work on `runtime`.
    pub fn new(
        transport: Arc<dyn Transport>,
        runtime: Handle,
        config: ServiceConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(transport, runtime, config))
    }

    /// Create a service with [`ServiceConfig::default`].
    pub fn with_defaults(transport: Arc<dyn Transport>, runtime: Handle) -> Self {
        Self::from_parts(transport, runtime, ServiceConfig::default())
    }

    fn from_parts(transport: Arc<dyn Transport>, runtime: Handle, config: ServiceConfig) -> Self {
        debug!(?config, "Initializing Service");
        Self {
            inner: Arc::new(ServiceInner {
                context: ServiceContext {
                    transport,
                    runtime,
                    config: Arc::new(config),
                },
                registry: ServiceRegistry::default(),
            }),
        }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.inner.context
    }

    pub fn config(&self) -> &ServiceConfig {
        self.inner.context.config()
    }

    /// Number of live collections attached to this service.
    pub fn attached_collections(&self) -> usize {
        self.inner.registry.live()
    }

    pub(crate) fn register(&self) -> Arc<ServiceBinding> {
        self.inner.registry.register(self.inner.context.clone())
    }

    /// Delete the remote object at `path`.
    pub async fn delete_path(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        self.inner.context.delete_path(path, cancel).await
    }

    /// Blocking variant of [`delete_path`](Self::delete_path).
    pub fn delete_path_sync(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        self.inner.context.delete_path_sync(path, cancel)
    }
}
