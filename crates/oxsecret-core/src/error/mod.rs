//! Error types for the secret collection cache
//!
//! Every error type of the crate, re-exported in one place.

pub use crate::collection::{CollectionError, ItemLoadFailure};
pub use crate::config::ConfigError;
pub use crate::item::ItemError;
pub use crate::service::ServiceError;
pub use crate::transport::TransportError;
