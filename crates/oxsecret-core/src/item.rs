//! Secret items.
//!
//! An [`Item`] is a shared handle to the proxy of one remote secret entry.
//! Clones refer to the same instance; [`Item::ptr_eq`] compares identity.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::service::ServiceContext;
use crate::transport::{ITEM_INTERFACE, ObjectProxy, TransportError, property};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    #[error("No such secret item at path: {path}")]
    NoSuchItem { path: String },

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl From<TransportError> for ItemError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => ItemError::Cancelled,
            other => ItemError::Transport(other),
        }
    }
}

impl ItemError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ItemError::Cancelled)
    }
}

struct ItemInner {
    proxy: Arc<dyn ObjectProxy>,
}

/// Shared handle to one remote secret item.
#[derive(Clone)]
pub struct Item {
    inner: Arc<ItemInner>,
}

impl Item {
    /// Open the item at `path`.
    #[instrument(level = "debug", skip(context, cancel))]
    pub async fn new(
        context: &ServiceContext,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Self, ItemError> {
        let proxy = context
            .call(
                "open_proxy",
                path,
                cancel,
                context.transport().open_proxy(path, ITEM_INTERFACE, cancel),
            )
            .await?;
        Self::from_proxy(proxy)
    }

    /// Blocking variant of [`new`](Self::new).
    #[instrument(level = "debug", skip(context, cancel))]
    pub fn new_sync(
        context: &ServiceContext,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Self, ItemError> {
        if cancel.is_cancelled() {
            return Err(ItemError::Cancelled);
        }
        let proxy = context
            .transport()
            .open_proxy_sync(path, ITEM_INTERFACE, cancel)?;
        Self::from_proxy(proxy)
    }

    fn from_proxy(proxy: Arc<dyn ObjectProxy>) -> Result<Self, ItemError> {
        if !proxy.has_cached_properties() {
            return Err(ItemError::NoSuchItem {
                path: proxy.object_path().to_string(),
            });
        }
        debug!("Item proxy ready");
        Ok(Self {
            inner: Arc::new(ItemInner { proxy }),
        })
    }

    pub fn path(&self) -> &str {
        self.inner.proxy.object_path()
    }

    pub fn label(&self) -> String {
        self.inner
            .proxy
            .cached_property(property::LABEL)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Missing values read as locked.
    pub fn locked(&self) -> bool {
        self.inner
            .proxy
            .cached_property(property::LOCKED)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn created(&self) -> u64 {
        self.u64_property(property::CREATED)
    }

    pub fn modified(&self) -> u64 {
        self.u64_property(property::MODIFIED)
    }

    pub fn attributes(&self) -> BTreeMap<String, String> {
        self.inner
            .proxy
            .cached_property(property::ATTRIBUTES)
            .and_then(|v| v.as_dict().cloned())
            .unwrap_or_default()
    }

    /// Whether both handles refer to the same item instance.
    pub fn ptr_eq(a: &Item, b: &Item) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn u64_property(&self, name: &str) -> u64 {
        self.inner
            .proxy
            .cached_property(name)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item").field("path", &self.path()).finish()
    }
}
