//! In-process resource store used by the controller and its tests.
//!
//! The production deployment fronts an external store; this crate defines
//! the contract the rest of the workspace programs against (typed CRUD with
//! optimistic concurrency, label-selected list, and per-kind watch streams)
//! and provides the in-memory implementation backing the single-binary
//! deployment and the test suites.
//!
//! Writes are compare-and-swap on `metadata.resource_version`: a stale
//! version yields [`Error::Conflict`], which the scheduler treats as a
//! requeue signal rather than a failure.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use chrono::Utc;
use jumpstarter_core::{Resource, Selector};
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Capacity of each per-kind watch channel. Slow watchers drop the oldest
/// events; the level-triggered reconciler recovers via periodic requeue.
const WATCH_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// The caller's `resource_version` was stale.
    #[error("conflict writing {kind} {namespace}/{name}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("object is missing a resource version; read it before updating")]
    MissingResourceVersion,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Watch events emitted by [`TypedStore::watch`].
#[derive(Debug, Clone)]
pub enum Event<K> {
    /// An object was created or modified.
    Applied(K),
    /// An object was deleted.
    Deleted(K),
}

impl<K> Event<K> {
    /// The object carried by this event.
    pub fn object(&self) -> &K {
        match self {
            Event::Applied(obj) | Event::Deleted(obj) => obj,
        }
    }
}

struct Shared<K> {
    objects: RwLock<BTreeMap<(String, String), K>>,
    events: Sender<Event<K>>,
    // Keeps the channel open while no watcher is active.
    _keepalive: InactiveReceiver<Event<K>>,
    version: AtomicU64,
}

/// Handle to all objects of one resource kind.
///
/// Clones share the same backing map, mirroring how `Api<K>` handles share a
/// client.
pub struct TypedStore<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for TypedStore<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> Default for TypedStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TypedStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (mut events, rx) = async_broadcast::broadcast(WATCH_CAPACITY);
        events.set_overflow(true);
        Self {
            shared: Arc::new(Shared {
                objects: RwLock::new(BTreeMap::new()),
                events,
                _keepalive: rx.deactivate(),
                version: AtomicU64::new(1),
            }),
        }
    }

    fn next_version(&self) -> String {
        self.shared.version.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn broadcast(&self, event: Event<K>) {
        // try_broadcast only fails when there are no receivers or the oldest
        // event is dropped under overflow; both are fine here.
        let _ = self.shared.events.try_broadcast(event);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<K> {
        self.shared
            .objects
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: K::KIND,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    /// List objects in a namespace, optionally filtered by a label selector.
    /// Results are ordered by name.
    pub fn list(&self, namespace: &str, selector: Option<&Selector>) -> Vec<K> {
        self.shared
            .objects
            .read()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, obj)| selector.is_none_or(|s| s.matches(&obj.meta().labels)))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    pub fn create(&self, mut obj: K) -> Result<K> {
        let key = (obj.meta().namespace.clone(), obj.meta().name.clone());
        let mut objects = self.shared.objects.write();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: K::KIND,
                namespace: key.0,
                name: key.1,
            });
        }
        let meta = obj.meta_mut();
        meta.uid = Uuid::new_v4().to_string();
        meta.creation_timestamp = Some(Utc::now());
        meta.resource_version = Some(self.next_version());
        objects.insert(key, obj.clone());
        drop(objects);
        self.broadcast(Event::Applied(obj.clone()));
        Ok(obj)
    }

    /// Compare-and-swap write. The caller's copy must carry the
    /// `resource_version` it read; a stale version is a [`Error::Conflict`].
    ///
    /// Status is not a separate row here: spec writers and the status-owning
    /// reconciler both go through this path, and the version check is what
    /// keeps them from clobbering each other.
    pub fn update(&self, mut obj: K) -> Result<K> {
        let key = (obj.meta().namespace.clone(), obj.meta().name.clone());
        let expected = obj
            .meta()
            .resource_version
            .clone()
            .ok_or(Error::MissingResourceVersion)?;
        let mut objects = self.shared.objects.write();
        let stored = objects.get_mut(&key).ok_or_else(|| Error::NotFound {
            kind: K::KIND,
            namespace: key.0.clone(),
            name: key.1.clone(),
        })?;
        if stored.meta().resource_version.as_deref() != Some(expected.as_str()) {
            return Err(Error::Conflict {
                kind: K::KIND,
                namespace: key.0,
                name: key.1,
            });
        }
        obj.meta_mut().resource_version = Some(self.next_version());
        *stored = obj.clone();
        drop(objects);
        self.broadcast(Event::Applied(obj.clone()));
        Ok(obj)
    }

    /// Status subresource write; same CAS semantics as [`TypedStore::update`].
    pub fn update_status(&self, obj: K) -> Result<K> {
        self.update(obj)
    }

    pub fn delete(&self, namespace: &str, name: &str) -> Result<K> {
        let key = (namespace.to_string(), name.to_string());
        let removed = self.shared.objects.write().remove(&key).ok_or_else(|| Error::NotFound {
            kind: K::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;
        self.broadcast(Event::Deleted(removed.clone()));
        Ok(removed)
    }

    /// Subscribe to changes of this kind. Events created before the call are
    /// not replayed; list first, then watch.
    pub fn watch(&self) -> Receiver<Event<K>> {
        self.shared.events.new_receiver()
    }
}

/// The full set of typed stores the control plane operates on.
#[derive(Clone, Default)]
pub struct Stores {
    pub clients: TypedStore<jumpstarter_core::Client>,
    pub exporters: TypedStore<jumpstarter_core::Exporter>,
    pub leases: TypedStore<jumpstarter_core::Lease>,
    pub policies: TypedStore<jumpstarter_core::ExporterAccessPolicy>,
}

impl Stores {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jumpstarter_core::{Exporter, Metadata};

    fn exporter(ns: &str, name: &str, labels: &[(&str, &str)]) -> Exporter {
        Exporter {
            metadata: Metadata {
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Metadata::named(ns, name)
            },
            ..Exporter::default()
        }
    }

    #[test]
    fn create_assigns_uid_and_version() {
        let store = TypedStore::<Exporter>::new();
        let created = store.create(exporter("lab", "e1", &[])).unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert!(created.metadata.resource_version.is_some());
        assert!(created.metadata.creation_timestamp.is_some());

        assert!(matches!(
            store.create(exporter("lab", "e1", &[])),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn list_filters_by_namespace_and_selector() {
        let store = TypedStore::<Exporter>::new();
        store.create(exporter("lab", "e1", &[("dut", "a")])).unwrap();
        store.create(exporter("lab", "e2", &[("dut", "b")])).unwrap();
        store.create(exporter("other", "e3", &[("dut", "a")])).unwrap();

        assert_eq!(store.list("lab", None).len(), 2);
        let selector: Selector = [("dut", "a")].into_iter().collect();
        let matched = store.list("lab", Some(&selector));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].metadata.name, "e1");
    }

    #[test]
    fn stale_update_conflicts() {
        let store = TypedStore::<Exporter>::new();
        let created = store.create(exporter("lab", "e1", &[])).unwrap();

        let mut first = created.clone();
        first.status.endpoint = "grpc://a".into();
        store.update(first).unwrap();

        let mut second = created;
        second.status.endpoint = "grpc://b".into();
        assert!(matches!(store.update(second), Err(Error::Conflict { .. })));

        // Re-reading picks up the new version and the write goes through.
        let mut fresh = store.get("lab", "e1").unwrap();
        fresh.status.endpoint = "grpc://b".into();
        store.update(fresh).unwrap();
        assert_eq!(store.get("lab", "e1").unwrap().status.endpoint, "grpc://b");
    }

    #[test]
    fn update_without_version_is_rejected() {
        let store = TypedStore::<Exporter>::new();
        store.create(exporter("lab", "e1", &[])).unwrap();
        let mut obj = store.get("lab", "e1").unwrap();
        obj.metadata.resource_version = None;
        assert!(matches!(store.update(obj), Err(Error::MissingResourceVersion)));
    }

    #[tokio::test]
    async fn watch_sees_applied_and_deleted() {
        let store = TypedStore::<Exporter>::new();
        let mut watch = store.watch();

        store.create(exporter("lab", "e1", &[])).unwrap();
        store.delete("lab", "e1").unwrap();

        let first = watch.recv().await.unwrap();
        assert!(matches!(&first, Event::Applied(obj) if obj.metadata.name == "e1"));
        let second = watch.recv().await.unwrap();
        assert!(matches!(&second, Event::Deleted(obj) if obj.metadata.name == "e1"));
    }
}
