//! Client-side cache for Secret Service collections.
//!
//! A [`Collection`] mirrors one remote secret collection and keeps a live
//! cache of its [`Item`]s. The cache is rebuilt by reconciliation whenever the
//! remote item list changes: items already cached are reused, missing ones are
//! constructed concurrently, and the complete new mapping replaces the old one
//! in a single swap.
//!
//! Every operation comes in an async and a blocking flavor. Blocking variants
//! must not be called from a thread that is driving a Tokio runtime.
//!
//! The wire protocol is not part of this crate. It is reached through the
//! [`Transport`] and [`ObjectProxy`] traits.

pub mod collection;
pub mod config;
pub mod error;
pub mod item;
pub mod join;
pub mod metrics;
pub mod service;
mod sync;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use collection::{
    Collection, CollectionEvent, CollectionProperty, ItemCache, ReconcileSummary,
};
pub use config::ServiceConfig;
pub use item::Item;
pub use join::{JoinGroup, JoinOutcome, JoinTicket};
pub use metrics::{CollectionMetrics, CollectionMetricsSnapshot};
pub use service::{Service, ServiceContext};
pub use transport::{ObjectProxy, PropertyChanges, Transport, Variant};
