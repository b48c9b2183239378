//! Property-change dispatch.
//!
//! A batch of remote property changes is turned into at most one observer
//! event (all touched properties, de-duplicated) plus a flag telling the
//! collection whether its item list has to be reconciled.

use crate::transport::{PropertyChanges, property};

/// Observable collection properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionProperty {
    Label,
    Locked,
    Created,
    Modified,
}

impl CollectionProperty {
    pub const ALL: [CollectionProperty; 4] = [
        CollectionProperty::Label,
        CollectionProperty::Locked,
        CollectionProperty::Created,
        CollectionProperty::Modified,
    ];

    fn from_remote(name: &str) -> Option<Self> {
        match name {
            property::LABEL => Some(Self::Label),
            property::LOCKED => Some(Self::Locked),
            property::CREATED => Some(Self::Created),
            property::MODIFIED => Some(Self::Modified),
            _ => None,
        }
    }
}

/// Event delivered to collection observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    /// One coalesced notification per remote change batch.
    PropertiesChanged(Vec<CollectionProperty>),
    /// The item cache was replaced; `count` is the new number of items.
    ItemsChanged { count: usize },
}

/// How one change batch affects a collection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Dispatch {
    pub(crate) properties: Vec<CollectionProperty>,
    pub(crate) items_changed: bool,
}

impl Dispatch {
    /// Everything may have changed (the notification stream lagged).
    pub(crate) fn everything() -> Self {
        Self {
            properties: CollectionProperty::ALL.to_vec(),
            items_changed: true,
        }
    }

    pub(crate) fn event(&self) -> Option<CollectionEvent> {
        (!self.properties.is_empty())
            .then(|| CollectionEvent::PropertiesChanged(self.properties.clone()))
    }
}

/// Only a changed `Items` value triggers reconciliation. An invalidated one
/// leaves nothing in the proxy cache to reconcile against.
pub(crate) fn classify(changes: &PropertyChanges) -> Dispatch {
    let mut properties: Vec<_> = changes
        .names()
        .filter_map(CollectionProperty::from_remote)
        .collect();
    properties.sort_unstable();
    properties.dedup();
    Dispatch {
        properties,
        items_changed: changes.changed.contains_key(property::ITEMS),
    }
}
