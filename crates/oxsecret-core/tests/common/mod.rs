//! Shared fixtures for collection integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use oxsecret_core::testing::MockTransport;
use oxsecret_core::{CollectionEvent, Service};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub const COLLECTION: &str = "/org/freedesktop/secrets/collection/login";

/// Hang guard for anything awaiting background work.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test-writer subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn item_path(n: usize) -> String {
    format!("{COLLECTION}/{n}")
}

/// A transport holding one collection with `items` listed items.
pub fn transport_with_items(items: usize) -> Arc<MockTransport> {
    init_tracing();
    let transport = MockTransport::new();
    transport.add_collection(COLLECTION, "Login");
    for n in 0..items {
        transport.add_item(COLLECTION, &item_path(n), &format!("secret {n}"));
    }
    transport
}

/// A service on the current runtime.
pub fn service_on_current(transport: &Arc<MockTransport>) -> Service {
    Service::with_defaults(transport.clone(), tokio::runtime::Handle::current())
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut broadcast::Receiver<CollectionEvent>) -> CollectionEvent {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for collection event")
        .expect("event channel closed")
}
