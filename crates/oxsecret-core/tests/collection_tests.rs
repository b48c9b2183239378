//! Integration tests for collection construction, reconciliation and
//! notification handling.
//!
//! Focus areas:
//! - Async and blocking construction run the same steps
//! - Reconciliation reuses cached items and swaps atomically
//! - A failed item construction leaves the cache untouched on both paths
//! - One notification batch produces one event and one reconciliation
//! - Service teardown and cancellation

mod common;

use std::time::Duration;

use common::{
    COLLECTION, TEST_TIMEOUT, item_path, next_event, service_on_current, transport_with_items,
};
use oxsecret_core::collection::{CollectionError, ItemLoadFailure};
use oxsecret_core::error::{ItemError, ServiceError, TransportError};
use oxsecret_core::testing::eventually;
use oxsecret_core::transport::property;
use oxsecret_core::{
    Collection, CollectionEvent, CollectionProperty, Item, PropertyChanges, ReconcileSummary,
    Service, ServiceConfig, Variant,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn failures_by_path(err: CollectionError) -> Vec<ItemLoadFailure> {
    match err {
        CollectionError::PartialReconciliation { mut failures, .. } => {
            failures.sort_by(|a, b| a.path.cmp(&b.path));
            failures
        }
        other => panic!("expected PartialReconciliation, got {other:?}"),
    }
}

// ============================================================================
// Construction
// ============================================================================

#[tokio::test]
async fn test_create_loads_initial_items() {
    let transport = transport_with_items(3);
    let service = service_on_current(&transport);

    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .expect("Failed to create collection");

    assert!(collection.is_ready());
    assert_eq!(collection.path(), COLLECTION);
    assert_eq!(collection.label(), "Login");
    assert!(!collection.locked());
    assert!(collection.created() > 0);
    assert_eq!(collection.created(), collection.modified());

    let mut labels: Vec<_> = collection.list_items().iter().map(Item::label).collect();
    labels.sort();
    assert_eq!(labels, vec!["secret 0", "secret 1", "secret 2"]);

    let snap = collection.metrics().snapshot();
    assert_eq!(snap.reconciliations_completed, 1);
    assert_eq!(snap.items_constructed, 3);
}

#[test]
fn test_create_sync_matches_async() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let transport = transport_with_items(3);
    let service = Service::with_defaults(transport.clone(), runtime.handle().clone());

    let collection = Collection::create_sync(&service, COLLECTION, &CancellationToken::new())
        .expect("Failed to create collection");

    assert!(collection.is_ready());
    assert_eq!(collection.cache_stats().entries, 3);
    for n in 0..3 {
        let item = collection.find_item(&item_path(n)).expect("item cached");
        assert_eq!(item.label(), format!("secret {n}"));
        assert_eq!(transport.open_count(&item_path(n)), 1);
    }
}

#[tokio::test]
async fn test_create_absent_collection_fails_before_loading_items() {
    let transport = transport_with_items(0);
    transport.add_unlisted_item("/nowhere/1", "orphan");
    let service = service_on_current(&transport);

    let err = Collection::create(&service, "/nowhere", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, CollectionError::NoSuchCollection { path } if path == "/nowhere"),
        "unexpected error: {err:?}"
    );
    assert_eq!(err.to_string(), "No such secret collection at path: /nowhere");
    assert_eq!(transport.open_count("/nowhere/1"), 0);
    assert_eq!(service.attached_collections(), 0);
}

#[test]
fn test_create_sync_absent_collection() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let transport = transport_with_items(0);
    let service = Service::with_defaults(transport, runtime.handle().clone());

    let err = Collection::create_sync(&service, "/nowhere", &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, CollectionError::NoSuchCollection { .. }));
}

#[tokio::test]
async fn test_create_propagates_transport_error() {
    let transport = transport_with_items(0);
    transport.fail_path(COLLECTION, TransportError::Disconnected("bus closed".into()));
    let service = service_on_current(&transport);

    let err = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CollectionError::Transport(TransportError::Disconnected(_))));
}

#[tokio::test]
async fn test_create_fails_when_any_item_fails() {
    let transport = transport_with_items(2);
    transport.fail_path(&item_path(1), TransportError::Disconnected("bus closed".into()));
    let service = service_on_current(&transport);

    let err = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap_err();
    let failures = failures_by_path(err);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].path, item_path(1));
}

#[tokio::test]
async fn test_create_with_cancelled_token() {
    let transport = transport_with_items(1);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = Collection::create(&service, COLLECTION, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    // Blocking construction never drives the runtime, so it may run here
    let err = Collection::create_sync(&service, COLLECTION, &cancel).unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_item_changes_during_construction_are_ignored() {
    let transport = transport_with_items(1);
    transport.add_unlisted_item(&item_path(1), "secret 1");
    let service = service_on_current(&transport);

    transport.hold();
    let creating = {
        let service = service.clone();
        tokio::spawn(async move {
            Collection::create(&service, COLLECTION, &CancellationToken::new()).await
        })
    };
    // Let the initial pass park on the gate
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.set_item_paths(COLLECTION, &[item_path(0), item_path(1)]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.release();

    let collection = timeout(TEST_TIMEOUT, creating)
        .await
        .expect("construction hung")
        .expect("task panicked")
        .expect("Failed to create collection");

    assert!(collection.is_ready());
    let snap = collection.metrics().snapshot();
    assert_eq!(snap.suppressed_reloads, 1);
    assert_eq!(snap.reconciliations_started, 1);
    assert_eq!(collection.list_items().len(), 1);
    assert!(collection.find_item(&item_path(0)).is_some());
    assert!(collection.find_item(&item_path(1)).is_none());
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let transport = transport_with_items(3);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    let collection = Collection::create(&service, COLLECTION, &cancel).await.unwrap();

    let first = collection.refresh_items(&cancel).await.unwrap();
    let before = collection.list_items();
    let second = collection.refresh_items(&cancel).await.unwrap();

    let expected = ReconcileSummary {
        total: 3,
        reused: 3,
        constructed: 0,
    };
    assert_eq!(first, expected);
    assert_eq!(second, expected);
    for item in &before {
        let again = collection.find_item(item.path()).expect("still cached");
        assert!(Item::ptr_eq(item, &again), "{} was reconstructed", item.path());
    }
    assert_eq!(transport.open_count(&item_path(0)), 1);
}

#[tokio::test]
async fn test_reconcile_preserves_identity_of_existing_items() {
    let transport = transport_with_items(2);
    let service = service_on_current(&transport);
    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap();
    let a = collection.find_item(&item_path(0)).unwrap();
    let b = collection.find_item(&item_path(1)).unwrap();

    transport.add_item(COLLECTION, &item_path(2), "secret 2");
    assert!(eventually(|| collection.list_items().len() == 3).await);

    assert!(Item::ptr_eq(&a, &collection.find_item(&item_path(0)).unwrap()));
    assert!(Item::ptr_eq(&b, &collection.find_item(&item_path(1)).unwrap()));
    assert_eq!(transport.open_count(&item_path(0)), 1);
    assert_eq!(transport.open_count(&item_path(2)), 1);
}

#[tokio::test]
async fn test_removed_item_leaves_cache_but_caller_handle_survives() {
    let transport = transport_with_items(2);
    let service = service_on_current(&transport);
    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap();
    let held = collection.find_item(&item_path(1)).unwrap();

    transport.remove_item(COLLECTION, &item_path(1));
    assert!(eventually(|| collection.find_item(&item_path(1)).is_none()).await);

    assert_eq!(collection.list_items().len(), 1);
    assert_eq!(held.label(), "secret 1");
}

#[tokio::test]
async fn test_duplicate_remote_paths_are_cached_once() {
    let transport = transport_with_items(1);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    let collection = Collection::create(&service, COLLECTION, &cancel).await.unwrap();

    let path = item_path(0);
    transport.set_item_paths(COLLECTION, &[path.clone(), path]);
    let summary = collection.refresh_items(&cancel).await.unwrap();
    assert_eq!(summary.total, 1);
}

#[test]
fn test_sync_failure_leaves_cache_unchanged() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let transport = transport_with_items(1);
    let service = Service::with_defaults(transport.clone(), runtime.handle().clone());
    let cancel = CancellationToken::new();
    let collection = Collection::create_sync(&service, COLLECTION, &cancel).unwrap();
    let original = collection.find_item(&item_path(0)).unwrap();

    transport.fail_path(&item_path(1), TransportError::Disconnected("bus closed".into()));
    transport.fail_path(&item_path(2), TransportError::Disconnected("bus closed".into()));
    transport.add_unlisted_item(&item_path(1), "broken");
    transport.add_unlisted_item(&item_path(2), "broken");
    transport.set_item_paths(COLLECTION, &[item_path(0), item_path(1), item_path(2)]);

    // The blocking pass stops at the first failure
    let failures = failures_by_path(collection.refresh_items_sync(&cancel).unwrap_err());
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].error,
        ItemError::Transport(TransportError::Disconnected(_))
    ));

    assert_eq!(collection.list_items().len(), 1);
    assert!(Item::ptr_eq(&original, &collection.find_item(&item_path(0)).unwrap()));
}

#[tokio::test]
async fn test_async_failure_leaves_cache_unchanged_and_reports_all() {
    let transport = transport_with_items(1);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    let collection = Collection::create(&service, COLLECTION, &cancel).await.unwrap();
    let original = collection.find_item(&item_path(0)).unwrap();

    transport.fail_path(&item_path(1), TransportError::Disconnected("bus closed".into()));
    transport.add_unlisted_item(&item_path(2), "fine");
    transport.set_item_paths(
        COLLECTION,
        &[item_path(0), item_path(1), item_path(2), item_path(3)],
    );

    // Every construction runs to completion; both failures are reported
    let failures = failures_by_path(collection.refresh_items(&cancel).await.unwrap_err());
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].path, item_path(1));
    assert!(matches!(failures[0].error, ItemError::Transport(_)));
    assert_eq!(failures[1].path, item_path(3));
    assert_eq!(
        failures[1].error,
        ItemError::NoSuchItem {
            path: item_path(3)
        }
    );

    // Nothing from the failed pass was published
    assert_eq!(collection.list_items().len(), 1);
    assert!(collection.find_item(&item_path(2)).is_none());

    transport.clear_failure(&item_path(1));
    transport.add_unlisted_item(&item_path(1), "fixed");
    transport.add_unlisted_item(&item_path(3), "fixed");
    let summary = collection.refresh_items(&cancel).await.unwrap();
    assert_eq!(summary.total, 4);
    assert!(Item::ptr_eq(&original, &collection.find_item(&item_path(0)).unwrap()));
}

#[tokio::test]
async fn test_missing_items_property() {
    let transport = transport_with_items(0);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    let collection = Collection::create(&service, COLLECTION, &cancel).await.unwrap();

    transport.set_remote_property(COLLECTION, property::ITEMS, Variant::Bool(true));
    let err = collection.refresh_items(&cancel).await.unwrap_err();
    assert!(matches!(err, CollectionError::MissingProperty { property: "Items", .. }));
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn test_batch_is_coalesced_into_one_event_and_one_pass() {
    let transport = transport_with_items(2);
    let service = service_on_current(&transport);
    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap();
    let mut events = collection.subscribe();
    let before = collection.metrics().snapshot();

    transport.add_unlisted_item(&item_path(2), "secret 2");
    let batch = PropertyChanges::single(property::LABEL, Variant::Str("Renamed".into()))
        .with(property::LOCKED, Variant::Bool(true))
        .with(
            property::ITEMS,
            Variant::ObjectPaths(vec![item_path(0), item_path(1), item_path(2)]),
        );
    transport.emit_changes(COLLECTION, batch);

    assert_eq!(
        next_event(&mut events).await,
        CollectionEvent::PropertiesChanged(vec![
            CollectionProperty::Label,
            CollectionProperty::Locked
        ])
    );
    assert_eq!(
        next_event(&mut events).await,
        CollectionEvent::ItemsChanged { count: 3 }
    );
    assert_eq!(collection.label(), "Renamed");
    assert!(collection.locked());

    // Give a stray second pass the chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = collection.metrics().snapshot();
    assert_eq!(after.notifications - before.notifications, 1);
    assert_eq!(after.reconciliations_started - before.reconciliations_started, 1);
    assert_eq!(after.reconciliations_completed - before.reconciliations_completed, 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_set_label_is_observed_through_notification() {
    let transport = transport_with_items(0);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    let collection = Collection::create(&service, COLLECTION, &cancel).await.unwrap();
    let mut events = collection.subscribe();

    collection.set_label("Personal", &cancel).await.expect("set label");

    assert_eq!(
        next_event(&mut events).await,
        CollectionEvent::PropertiesChanged(vec![CollectionProperty::Label])
    );
    assert_eq!(collection.label(), "Personal");
    assert_eq!(
        transport.remote_property(COLLECTION, property::LABEL),
        Some(Variant::Str("Personal".into()))
    );
}

#[test]
fn test_set_label_sync() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let transport = transport_with_items(0);
    let service = Service::with_defaults(transport.clone(), runtime.handle().clone());
    let cancel = CancellationToken::new();
    let collection = Collection::create_sync(&service, COLLECTION, &cancel).unwrap();

    collection.set_label_sync("Work", &cancel).unwrap();
    assert_eq!(collection.label(), "Work");

    transport.fail_path(COLLECTION, TransportError::Remote {
        name: "org.freedesktop.DBus.Error.AccessDenied".into(),
        message: "read-only".into(),
    });
    let err = collection.set_label_sync("Other", &cancel).unwrap_err();
    assert!(matches!(err, CollectionError::Transport(TransportError::Remote { .. })));
    assert_eq!(collection.label(), "Work");
}

#[tokio::test]
async fn test_lagged_listener_reannounces_everything() {
    let transport = transport_with_items(1);
    let config = ServiceConfig {
        event_capacity: 256,
        ..ServiceConfig::default()
    };
    let service =
        Service::new(transport.clone(), tokio::runtime::Handle::current(), config).unwrap();
    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap();
    let mut events = collection.subscribe();

    // The listener cannot run until this task yields, so it falls behind
    for n in 0..100 {
        transport.set_remote_property(COLLECTION, property::MODIFIED, Variant::U64(n));
    }

    assert_eq!(
        next_event(&mut events).await,
        CollectionEvent::PropertiesChanged(CollectionProperty::ALL.to_vec())
    );
    assert!(
        eventually(|| collection.metrics().snapshot().reconciliations_completed == 2).await
    );
    assert_eq!(collection.modified(), 99);
}

// ============================================================================
// Refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_runs_in_background() {
    let transport = transport_with_items(2);
    let service = service_on_current(&transport);
    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap();
    let before = collection.metrics().snapshot();

    collection.refresh();

    assert!(
        eventually(|| {
            collection.metrics().snapshot().reconciliations_completed
                == before.reconciliations_completed + 1
        })
        .await
    );
    assert_eq!(collection.metrics().snapshot().items_reused, before.items_reused + 2);
}

#[tokio::test]
async fn test_refresh_failure_is_not_propagated() {
    let transport = transport_with_items(1);
    let service = service_on_current(&transport);
    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap();
    let before = collection.metrics().snapshot();

    transport.fail_path(COLLECTION, TransportError::Disconnected("bus closed".into()));
    collection.refresh();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(collection.metrics().snapshot(), before);
    assert_eq!(collection.list_items().len(), 1);
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete() {
    let transport = transport_with_items(1);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    let collection = Collection::create(&service, COLLECTION, &cancel).await.unwrap();

    collection.delete(&cancel).await.expect("delete");
    assert!(!transport.contains(COLLECTION));

    // Stale handle: the remote object is gone
    let err = collection.delete(&cancel).await.unwrap_err();
    assert!(matches!(err, CollectionError::Transport(TransportError::Remote { .. })));
}

#[test]
fn test_delete_sync() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let transport = transport_with_items(1);
    let service = Service::with_defaults(transport.clone(), runtime.handle().clone());
    let cancel = CancellationToken::new();
    let collection = Collection::create_sync(&service, COLLECTION, &cancel).unwrap();

    collection.delete_sync(&cancel).expect("delete");
    assert!(!transport.contains(COLLECTION));
}

#[tokio::test]
async fn test_delete_sync_inside_runtime_is_rejected() {
    let transport = transport_with_items(0);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    let collection = Collection::create(&service, COLLECTION, &cancel).await.unwrap();

    let err = collection.delete_sync(&cancel).unwrap_err();
    assert!(matches!(err, CollectionError::Service(ServiceError::NestedBlockingCall)));
    assert!(transport.contains(COLLECTION));
}

// ============================================================================
// Lifetime and cancellation
// ============================================================================

#[tokio::test]
async fn test_service_teardown_detaches_collection() {
    let transport = transport_with_items(2);
    let service = service_on_current(&transport);
    let cancel = CancellationToken::new();
    let collection = Collection::create(&service, COLLECTION, &cancel).await.unwrap();
    assert!(collection.service().is_some());

    drop(service);

    assert!(collection.service().is_none());
    assert_eq!(collection.list_items().len(), 2);
    assert_eq!(collection.label(), "Login");
    assert!(matches!(
        collection.set_label("x", &cancel).await,
        Err(CollectionError::ServiceDetached { .. })
    ));
    assert!(matches!(
        collection.refresh_items(&cancel).await,
        Err(CollectionError::ServiceDetached { .. })
    ));
    assert!(matches!(
        collection.delete(&cancel).await,
        Err(CollectionError::ServiceDetached { .. })
    ));

    // Item-list changes no longer trigger reconciliation
    let before = collection.metrics().snapshot();
    transport.add_item(COLLECTION, &item_path(2), "late");
    assert!(
        eventually(|| collection.metrics().snapshot().notifications > before.notifications).await
    );
    let after = collection.metrics().snapshot();
    assert_eq!(after.reconciliations_started, before.reconciliations_started);
    assert_eq!(collection.list_items().len(), 2);
}

#[tokio::test]
async fn test_cancelled_pass_completes_and_keeps_cache() {
    let transport = transport_with_items(1);
    let service = service_on_current(&transport);
    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap();

    transport.hold();
    transport.add_item(COLLECTION, &item_path(1), "held");

    let cancel = CancellationToken::new();
    let pass = {
        let collection = collection.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { collection.refresh_items(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = timeout(TEST_TIMEOUT, pass)
        .await
        .expect("cancelled pass hung")
        .expect("task panicked");
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(collection.list_items().len(), 1);

    // The notification-driven pass is still parked on the gate
    transport.release();
    assert!(eventually(|| collection.list_items().len() == 2).await);
}

#[tokio::test]
async fn test_dropped_pass_is_counted_as_finished() {
    let transport = transport_with_items(1);
    let service = service_on_current(&transport);
    let collection = Collection::create(&service, COLLECTION, &CancellationToken::new())
        .await
        .unwrap();

    transport.hold();
    transport.add_item(COLLECTION, &item_path(1), "held");

    // The awaited pass parks on the gate and is dropped by the timeout
    let parked = timeout(
        Duration::from_millis(20),
        collection.refresh_items(&CancellationToken::new()),
    )
    .await;
    assert!(parked.is_err());

    transport.release();
    assert!(eventually(|| collection.list_items().len() == 2).await);
    assert!(
        eventually(|| {
            let snap = collection.metrics().snapshot();
            snap.reconciliations_started == snap.reconciliations_finished()
        })
        .await
    );

    let snap = collection.metrics().snapshot();
    assert_eq!(snap.reconciliations_started, 3);
    assert_eq!(snap.reconciliations_completed, 2);
    assert_eq!(snap.reconciliations_failed, 1);
}
