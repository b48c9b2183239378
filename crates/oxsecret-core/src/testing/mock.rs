//! In-memory transport double.
//!
//! Remote objects live in a shared table keyed by path. Proxies read that table
//! directly, so a property write is visible through every open proxy before the
//! change batch announcing it is delivered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::transport::{
    ITEM_INTERFACE, ObjectProxy, PropertyChanges, Transport, TransportError, Variant, property,
};

const CHANGE_CAPACITY: usize = 64;
const FIRST_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Debug)]
struct MockObject {
    path: String,
    props: RwLock<BTreeMap<String, Variant>>,
    changes: broadcast::Sender<PropertyChanges>,
}

impl MockObject {
    fn new(path: &str, props: BTreeMap<String, Variant>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Arc::new(Self {
            path: path.to_string(),
            props: RwLock::new(props),
            changes,
        })
    }

    /// Apply a batch to the property table, then announce it.
    fn apply(&self, batch: PropertyChanges) {
        {
            let mut props = self.props.write();
            for (name, value) in &batch.changed {
                props.insert(name.clone(), value.clone());
            }
        }
        trace!(path = %self.path, ?batch, "mock change batch");
        let _ = self.changes.send(batch);
    }

    fn item_paths(&self) -> Vec<String> {
        self.props
            .read()
            .get(property::ITEMS)
            .and_then(|v| v.as_object_paths().map(<[String]>::to_vec))
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct MockState {
    objects: DashMap<String, Arc<MockObject>>,
    failures: DashMap<String, TransportError>,
    delays: DashMap<String, Duration>,
    opens: DashMap<String, usize>,
    /// `true` while item opens are held back.
    gate: watch::Sender<bool>,
    clock: AtomicU64,
}

impl MockState {
    fn check(&self, path: &str) -> Result<(), TransportError> {
        match self.failures.get(path) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

async fn wait_released(gate: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    loop {
        let held = *gate.borrow_and_update();
        if !held {
            return Ok(());
        }
        gate.changed().await?;
    }
}

/// Proxy handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockProxy {
    interface: String,
    object: Arc<MockObject>,
    state: Arc<MockState>,
}

#[async_trait]
impl ObjectProxy for MockProxy {
    fn object_path(&self) -> &str {
        &self.object.path
    }

    fn interface_name(&self) -> &str {
        &self.interface
    }

    fn cached_property(&self, name: &str) -> Option<Variant> {
        self.object.props.read().get(name).cloned()
    }

    fn has_cached_properties(&self) -> bool {
        !self.object.props.read().is_empty()
    }

    async fn set_property(
        &self,
        name: &str,
        value: Variant,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.set_property_sync(name, value, cancel)
    }

    fn set_property_sync(
        &self,
        name: &str,
        value: Variant,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.state.check(&self.object.path)?;
        self.object.apply(PropertyChanges::single(name, value));
        Ok(())
    }

    async fn reload_properties(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        // The property table is always current; nothing differs
        self.state.check(&self.object.path)
    }

    fn subscribe(&self) -> broadcast::Receiver<PropertyChanges> {
        self.object.changes.subscribe()
    }
}

/// In-memory stand-in for the secret service.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(false);
        Arc::new(Self {
            state: Arc::new(MockState {
                objects: DashMap::new(),
                failures: DashMap::new(),
                delays: DashMap::new(),
                opens: DashMap::new(),
                gate,
                clock: AtomicU64::new(FIRST_TIMESTAMP),
            }),
        })
    }

    fn tick(&self) -> u64 {
        self.state.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn object(&self, path: &str) -> Option<Arc<MockObject>> {
        self.state.objects.get(path).map(|o| Arc::clone(o.value()))
    }

    fn open(&self, path: &str, interface: &str) -> Result<Arc<dyn ObjectProxy>, TransportError> {
        *self.state.opens.entry(path.to_string()).or_insert(0) += 1;
        self.state.check(path)?;

        // Absent objects still get a proxy, just with nothing cached
        let object = self
            .object(path)
            .unwrap_or_else(|| MockObject::new(path, BTreeMap::new()));
        Ok(Arc::new(MockProxy {
            interface: interface.to_string(),
            object,
            state: Arc::clone(&self.state),
        }))
    }

    /// Create an unlocked, empty collection.
    pub fn add_collection(&self, path: &str, label: &str) {
        let now = self.tick();
        let props = BTreeMap::from([
            (property::LABEL.to_string(), Variant::Str(label.to_string())),
            (property::LOCKED.to_string(), Variant::Bool(false)),
            (property::CREATED.to_string(), Variant::U64(now)),
            (property::MODIFIED.to_string(), Variant::U64(now)),
            (property::ITEMS.to_string(), Variant::ObjectPaths(Vec::new())),
        ]);
        self.state
            .objects
            .insert(path.to_string(), MockObject::new(path, props));
    }

    /// Create an unlocked item without listing it in any collection.
    ///
    /// The item's attributes hold its label under the `label` key.
    pub fn add_unlisted_item(&self, path: &str, label: &str) {
        let now = self.tick();
        let props = BTreeMap::from([
            (property::LABEL.to_string(), Variant::Str(label.to_string())),
            (property::LOCKED.to_string(), Variant::Bool(false)),
            (property::CREATED.to_string(), Variant::U64(now)),
            (property::MODIFIED.to_string(), Variant::U64(now)),
            (
                property::ATTRIBUTES.to_string(),
                Variant::Dict(BTreeMap::from([("label".to_string(), label.to_string())])),
            ),
        ]);
        self.state
            .objects
            .insert(path.to_string(), MockObject::new(path, props));
    }

    /// Create an unlocked item and append it to `collection`'s item list.
    pub fn add_item(&self, collection: &str, path: &str, label: &str) {
        self.add_unlisted_item(path, label);
        if let Some(parent) = self.object(collection) {
            let mut items = parent.item_paths();
            items.push(path.to_string());
            parent.apply(PropertyChanges::single(
                property::ITEMS,
                Variant::ObjectPaths(items),
            ));
        }
    }

    /// Remove an item and drop it from `collection`'s item list.
    pub fn remove_item(&self, collection: &str, path: &str) {
        self.state.objects.remove(path);
        if let Some(parent) = self.object(collection) {
            let items = parent
                .item_paths()
                .into_iter()
                .filter(|p| p != path)
                .collect();
            parent.apply(PropertyChanges::single(
                property::ITEMS,
                Variant::ObjectPaths(items),
            ));
        }
    }

    /// Overwrite a collection's item list without touching any item objects.
    ///
    /// Paths without an object fail to load with a missing-item error.
    pub fn set_item_paths<S: AsRef<str>>(&self, collection: &str, paths: &[S]) {
        let paths = paths.iter().map(|p| p.as_ref().to_string()).collect();
        self.emit_changes(
            collection,
            PropertyChanges::single(property::ITEMS, Variant::ObjectPaths(paths)),
        );
    }

    /// Change one property remotely and announce it.
    pub fn set_remote_property(&self, path: &str, name: &str, value: Variant) {
        self.emit_changes(path, PropertyChanges::single(name, value));
    }

    /// Apply and announce a whole change batch at once.
    pub fn emit_changes(&self, path: &str, batch: PropertyChanges) {
        if let Some(object) = self.object(path) {
            object.apply(batch);
        }
    }

    /// Read a property straight from the remote table.
    pub fn remote_property(&self, path: &str, name: &str) -> Option<Variant> {
        self.object(path)
            .and_then(|o| o.props.read().get(name).cloned())
    }

    /// Make every call touching `path` fail with `error`.
    pub fn fail_path(&self, path: &str, error: TransportError) {
        self.state.failures.insert(path.to_string(), error);
    }

    pub fn clear_failure(&self, path: &str) {
        self.state.failures.remove(path);
    }

    /// Delay async opens of `path`.
    pub fn set_delay(&self, path: &str, delay: Duration) {
        self.state.delays.insert(path.to_string(), delay);
    }

    /// Hold back async item opens until [`release`](Self::release).
    pub fn hold(&self) {
        self.state.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.state.gate.send_replace(false);
    }

    /// How many proxies were opened for `path`.
    pub fn open_count(&self, path: &str) -> usize {
        self.state.opens.get(path).map_or(0, |n| *n)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.objects.contains_key(path)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_proxy(
        &self,
        path: &str,
        interface: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ObjectProxy>, TransportError> {
        if interface == ITEM_INTERFACE {
            let mut gate = self.state.gate.subscribe();
            tokio::select! {
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                res = wait_released(&mut gate) => {
                    res.map_err(|_| TransportError::Disconnected("mock gate closed".into()))?;
                }
            }
        }

        let delay = self.state.delays.get(path).map(|d| *d);
        if let Some(delay) = delay {
            tokio::select! {
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.open(path, interface)
    }

    fn open_proxy_sync(
        &self,
        path: &str,
        interface: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ObjectProxy>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.open(path, interface)
    }

    async fn delete_object(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.state.check(path)?;
        if self.state.objects.remove(path).is_none() {
            return Err(TransportError::Remote {
                name: "org.freedesktop.DBus.Error.UnknownObject".to_string(),
                message: format!("No such object: {path}"),
            });
        }

        // Unlink from any collection listing it
        let parents: Vec<_> = self
            .state
            .objects
            .iter()
            .filter(|entry| entry.value().item_paths().iter().any(|p| p == path))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for parent in parents {
            let items = parent
                .item_paths()
                .into_iter()
                .filter(|p| p != path)
                .collect();
            parent.apply(PropertyChanges::single(
                property::ITEMS,
                Variant::ObjectPaths(items),
            ));
        }
        Ok(())
    }
}
