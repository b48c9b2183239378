//! Seam to the inter-process transport.
//!
//! The wire protocol, connection management and property decoding live in an
//! external collaborator. This module only describes what the cache layer needs
//! from it:
//!
//! - [`Transport`] opens proxies for remote objects and deletes them
//! - [`ObjectProxy`] exposes one remote object's cached properties, property
//!   writes, and a change-notification stream
//!
//! Both traits are object safe and are used as `Arc<dyn ...>` so that the real
//! D-Bus binding and the in-memory test double are interchangeable.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// D-Bus interface implemented by remote collections.
pub const COLLECTION_INTERFACE: &str = "org.freedesktop.Secret.Collection";

/// D-Bus interface implemented by remote items.
pub const ITEM_INTERFACE: &str = "org.freedesktop.Secret.Item";

/// Remote property names.
pub mod property {
    pub const LABEL: &str = "Label";
    pub const LOCKED: &str = "Locked";
    pub const CREATED: &str = "Created";
    pub const MODIFIED: &str = "Modified";
    pub const ITEMS: &str = "Items";
    pub const ATTRIBUTES: &str = "Attributes";
}

/// A decoded remote property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Variant {
    Bool(bool),
    U64(u64),
    Str(String),
    ObjectPath(String),
    ObjectPaths(Vec<String>),
    Dict(BTreeMap<String, String>),
}

impl Variant {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(s) | Variant::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Variant::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object_paths(&self) -> Option<&[String]> {
        match self {
            Variant::ObjectPaths(paths) => Some(paths),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Variant::Dict(dict) => Some(dict),
            _ => None,
        }
    }
}

/// One batch of property changes pushed by the remote peer.
///
/// A batch is delivered atomically: the proxy's cached properties already hold
/// the new values by the time subscribers receive it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyChanges {
    /// Properties whose new value was sent along with the notification.
    pub changed: BTreeMap<String, Variant>,
    /// Properties that changed but whose value must be re-fetched.
    pub invalidated: Vec<String>,
}

impl PropertyChanges {
    /// Batch with a single changed property.
    pub fn single(name: impl Into<String>, value: Variant) -> Self {
        let mut changed = BTreeMap::new();
        changed.insert(name.into(), value);
        Self {
            changed,
            invalidated: Vec::new(),
        }
    }

    /// Add a changed property to the batch.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Variant) -> Self {
        self.changed.insert(name.into(), value);
        self
    }

    /// All property names touched by this batch, changed first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.changed
            .keys()
            .map(String::as_str)
            .chain(self.invalidated.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.invalidated.is_empty()
    }
}

/// Errors reported by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to the secret service was lost: {0}")]
    Disconnected(String),

    #[error("{method} on {path} timed out after {timeout:?}")]
    Timeout {
        method: String,
        path: String,
        timeout: Duration,
    },

    #[error("Remote error {name}: {message}")]
    Remote { name: String, message: String },

    #[error("Operation was cancelled")]
    Cancelled,
}

/// Local stand-in for one remote object.
#[async_trait]
pub trait ObjectProxy: Send + Sync + fmt::Debug {
    /// Stable object path identifying the remote object.
    fn object_path(&self) -> &str;

    /// Interface this proxy was opened for.
    fn interface_name(&self) -> &str;

    /// Read a property from the local property cache. Never suspends.
    fn cached_property(&self, name: &str) -> Option<Variant>;

    /// Whether the property cache was populated, i.e. the remote object exists.
    fn has_cached_properties(&self) -> bool;

    /// Write a remote property.
    async fn set_property(
        &self,
        name: &str,
        value: Variant,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Blocking variant of [`set_property`](Self::set_property).
    fn set_property_sync(
        &self,
        name: &str,
        value: Variant,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Re-fetch every property from the remote object, publishing a change
    /// batch for anything that differs from the cache.
    async fn reload_properties(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Subscribe to change batches for this object.
    fn subscribe(&self) -> broadcast::Receiver<PropertyChanges>;
}

/// Connection-level operations of the transport collaborator.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Open a proxy for the object at `path`.
    ///
    /// Opening succeeds for paths that do not exist; the returned proxy then
    /// reports `has_cached_properties() == false`.
    async fn open_proxy(
        &self,
        path: &str,
        interface: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ObjectProxy>, TransportError>;

    /// Blocking variant of [`open_proxy`](Self::open_proxy).
    fn open_proxy_sync(
        &self,
        path: &str,
        interface: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ObjectProxy>, TransportError>;

    /// Delete the remote object at `path`.
    async fn delete_object(&self, path: &str, cancel: &CancellationToken)
        -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_accessors() {
        assert_eq!(Variant::Str("x".into()).as_str(), Some("x"));
        assert_eq!(Variant::ObjectPath("/a".into()).as_str(), Some("/a"));
        assert_eq!(Variant::Bool(true).as_str(), None);
        assert_eq!(Variant::U64(7).as_u64(), Some(7));
        assert_eq!(Variant::Bool(false).as_bool(), Some(false));
        let paths = Variant::ObjectPaths(vec!["/a".into(), "/b".into()]);
        assert_eq!(paths.as_object_paths().map(<[String]>::len), Some(2));
    }

    #[test]
    fn test_variant_serde_shape() {
        let json = serde_json::to_string(&Variant::U64(3)).unwrap();
        assert_eq!(json, r#"{"type":"u64","value":3}"#);
        let back: Variant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Variant::U64(3));
    }

    #[test]
    fn test_property_changes_names() {
        let mut changes = PropertyChanges::single(property::LABEL, Variant::Str("a".into()))
            .with(property::LOCKED, Variant::Bool(true));
        changes.invalidated.push(property::ITEMS.to_string());

        let names: Vec<_> = changes.names().collect();
        assert_eq!(names, vec!["Label", "Locked", "Items"]);
        assert!(!changes.is_empty());
        assert!(PropertyChanges::default().is_empty());
    }
}
