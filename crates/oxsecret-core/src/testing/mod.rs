//! Testing utilities for collection integration tests.
//!
//! - **Mock transport**: an in-memory secret service with failure injection,
//!   per-path delays and a gate that holds item construction back
//! - **Polling**: [`eventually`] for waiting on background reconciliation
//!
//! # Usage
//!
//! ```ignore
//! use oxsecret_core::testing::{MockTransport, eventually};
//!
//! let transport = MockTransport::new();
//! transport.add_collection("/c", "Login");
//! let service = Service::with_defaults(transport.clone(), Handle::current());
//! let collection = Collection::create(&service, "/c", &cancel).await?;
//!
//! transport.add_item("/c", "/c/1", "Wifi");
//! assert!(eventually(|| collection.list_items().len() == 1).await);
//! ```

pub mod mock;

pub use mock::{MockProxy, MockTransport};

use std::time::Duration;

/// How long [`eventually`] polls before giving up.
pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds or [`EVENTUALLY_TIMEOUT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Blocking variant of [`eventually`] for tests without a runtime.
pub fn eventually_sync(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + EVENTUALLY_TIMEOUT;
    loop {
        if condition() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
