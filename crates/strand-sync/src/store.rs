//! Scoped, named key/value stores with vector-clock versioning.
//!
//! A store keeps opaque byte keys mapped to sets of sibling versions. The
//! per-key sibling set is the only mutable shared structure in the
//! subsystem; it lives in a sharded concurrent map so sync tasks, election
//! reads and application writers never contend on a global lock. Local
//! operations complete against local state only and never touch the
//! network.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::version::{now_ms, NodeId, VectorClock};
use crate::versioned::{reconcile, Versioned, VersionedValue};

/// Replicated store holding the cluster node registry.
pub const SYSTEM_NODE_STORE: &str = "system.cluster.nodes";

/// Local-only store holding this node's bootstrap settings.
pub const SYSTEM_LOCAL_STORE: &str = "system.local";

/// Key in [`SYSTEM_LOCAL_STORE`]: this node's cluster id.
pub const LOCAL_NODE_ID: &str = "local-node-id";
/// Key in [`SYSTEM_LOCAL_STORE`]: hostname to advertise to peers.
pub const LOCAL_NODE_HOSTNAME: &str = "local-node-hostname";
/// Key in [`SYSTEM_LOCAL_STORE`]: interface to derive the address from.
pub const LOCAL_NODE_IFACE: &str = "local-node-iface";
/// Key in [`SYSTEM_LOCAL_STORE`]: cluster listen port.
pub const LOCAL_NODE_PORT: &str = "local-node-port";
/// Key in [`SYSTEM_LOCAL_STORE`]: comma-separated discovery seeds.
pub const SEEDS: &str = "seeds";
/// Key in [`SYSTEM_LOCAL_STORE`]: peer authentication scheme.
pub const AUTH_SCHEME: &str = "auth-scheme";
/// Key in [`SYSTEM_LOCAL_STORE`]: path to the cluster keystore.
pub const KEYSTORE_PATH: &str = "keystore-path";
/// Key in [`SYSTEM_LOCAL_STORE`]: password for the cluster keystore.
pub const KEYSTORE_PASSWORD: &str = "keystore-password";

/// Replication policy of a store, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Excluded from all replication traffic.
    Local,
    /// Vector-clock versioned and gossiped to all peers.
    Global,
    /// Exchanged opportunistically with raw values, never versioned on the
    /// wire and never persisted (ephemeral/status data).
    Unsynchronized,
}

/// Store identity as carried on the wire and in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRef {
    /// Store name, unique within the registry.
    pub name: String,
    /// Replication scope.
    pub scope: Scope,
    /// Whether the store survives restarts.
    pub persist: bool,
}

/// Whether a store update originated locally or arrived from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Update made through the local store API.
    Local,
    /// Update applied from a peer's sync values.
    Remote,
}

/// Notification of a store mutation, delivered to registered listeners
/// (the protocol engine and the membership mirror among them).
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// The store that changed.
    pub store: StoreRef,
    /// The key that changed.
    pub key: Vec<u8>,
    /// Where the update came from.
    pub origin: UpdateOrigin,
}

const UNASSIGNED: u32 = u32::MAX;

/// The node id this process writes with. Unassigned until the node joins
/// a cluster (or is statically configured).
#[derive(Debug)]
pub struct LocalNodeId(AtomicU32);

impl LocalNodeId {
    /// An id that has not been assigned yet.
    pub fn unassigned() -> Self {
        Self(AtomicU32::new(UNASSIGNED))
    }

    /// A pre-assigned id (static configuration).
    pub fn assigned(id: NodeId) -> Self {
        Self(AtomicU32::new(id as u32))
    }

    /// The current id, if assigned.
    pub fn get(&self) -> Option<NodeId> {
        match self.0.load(Ordering::SeqCst) {
            UNASSIGNED => None,
            id => Some(id as NodeId),
        }
    }

    /// Assign the id (join completion).
    pub fn set(&self, id: NodeId) {
        self.0.store(id as u32, Ordering::SeqCst);
    }
}

/// A named, scoped key/value store.
pub struct Store {
    descriptor: StoreRef,
    entries: DashMap<Vec<u8>, Vec<VersionedValue>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Store {
    fn new(descriptor: StoreRef, events: broadcast::Sender<StoreEvent>) -> Self {
        Self {
            descriptor,
            entries: DashMap::new(),
            events,
        }
    }

    /// The store's wire/registry descriptor.
    pub fn descriptor(&self) -> &StoreRef {
        &self.descriptor
    }

    /// The store name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// The store's replication scope.
    pub fn scope(&self) -> Scope {
        self.descriptor.scope
    }

    /// Whether the store is persisted across restarts.
    pub fn is_persistent(&self) -> bool {
        self.descriptor.persist
    }

    fn notify(&self, key: &[u8], origin: UpdateOrigin) {
        let _ = self.events.send(StoreEvent {
            store: self.descriptor.clone(),
            key: key.to_vec(),
            origin,
        });
    }

    /// Write a value: the new clock is the merge of all retained sibling
    /// clocks incremented by the local node, so the write dominates
    /// everything currently held for the key.
    pub fn put(&self, key: &[u8], value: Vec<u8>, local_node: NodeId) -> VectorClock {
        let mut entry = self.entries.entry(key.to_vec()).or_default();
        let merged = entry
            .iter()
            .fold(VectorClock::new(), |acc, v| acc.merge(&v.version));
        let version = merged.incremented(local_node);
        reconcile(&mut entry, VersionedValue::live(value, version.clone()));
        drop(entry);
        self.notify(key, UpdateOrigin::Local);
        version
    }

    /// Optimistic write: the caller supplies the version it read; the new
    /// clock is that version incremented by the local node. Fails with
    /// [`SyncError::ObsoleteVersion`] when a retained sibling already
    /// dominates the result — callers retry their read-modify-write loop.
    pub fn put_versioned(
        &self,
        key: &[u8],
        value: Vec<u8>,
        read_version: &VectorClock,
        local_node: NodeId,
    ) -> Result<VectorClock> {
        let version = read_version.incremented(local_node);
        let mut entry = self.entries.entry(key.to_vec()).or_default();
        if !reconcile(&mut entry, VersionedValue::live(value, version.clone())) {
            return Err(SyncError::ObsoleteVersion);
        }
        drop(entry);
        self.notify(key, UpdateOrigin::Local);
        Ok(version)
    }

    /// Delete a key by writing a tombstone that dominates all retained
    /// siblings. The tombstone is retained for the grace period so slow
    /// peers observe the deletion before it is physically removed.
    pub fn delete(&self, key: &[u8], local_node: NodeId) -> VectorClock {
        let mut entry = self.entries.entry(key.to_vec()).or_default();
        let merged = entry
            .iter()
            .fold(VectorClock::new(), |acc, v| acc.merge(&v.version));
        let version = merged.incremented(local_node);
        reconcile(&mut entry, VersionedValue::tombstone(version.clone()));
        drop(entry);
        self.notify(key, UpdateOrigin::Local);
        version
    }

    /// All live sibling versions for a key (tombstones excluded).
    pub fn get(&self, key: &[u8]) -> Vec<Versioned<Vec<u8>>> {
        self.entries
            .get(key)
            .map(|entry| {
                entry
                    .iter()
                    .filter_map(|v| {
                        v.value
                            .clone()
                            .map(|value| Versioned::new(value, v.version.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clocks of all retained entries for a key, tombstones included.
    pub fn get_versions(&self, key: &[u8]) -> Vec<VectorClock> {
        self.entries
            .get(key)
            .map(|entry| entry.iter().map(|v| v.version.clone()).collect())
            .unwrap_or_default()
    }

    /// All retained entries for a key, tombstones included (sync path).
    pub fn get_retained(&self, key: &[u8]) -> Vec<VersionedValue> {
        self.entries
            .get(key)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// All keys with at least one retained entry, tombstoned keys
    /// included.
    pub fn list_keys(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Apply versioned values received from a peer through the
    /// reconciliation rule. Returns true when local state changed.
    /// Idempotent: applying the same values twice is a no-op.
    pub fn apply_sync_values(&self, key: &[u8], values: Vec<VersionedValue>) -> bool {
        let mut entry = self.entries.entry(key.to_vec()).or_default();
        let mut changed = false;
        for mut value in values {
            // Remote tombstones are stamped on arrival so the local grace
            // period starts when this node first observes the deletion.
            if value.is_tombstone() && value.tombstoned_at_ms.is_none() {
                value.tombstoned_at_ms = Some(now_ms());
            }
            changed |= reconcile(&mut entry, value);
        }
        drop(entry);
        if changed {
            self.notify(key, UpdateOrigin::Remote);
        }
        changed
    }

    /// Apply a clockless value from a peer (unsynchronized stores only):
    /// the raw value replaces whatever is held locally.
    pub fn apply_unsync_value(&self, key: &[u8], value: Option<Vec<u8>>) {
        let entry = match value {
            Some(v) => VersionedValue::live(v, VectorClock::new()),
            None => VersionedValue::tombstone(VectorClock::new()),
        };
        self.entries.insert(key.to_vec(), vec![entry]);
        self.notify(key, UpdateOrigin::Remote);
    }

    /// Drop tombstones older than the grace period; keys left with no
    /// entries are removed entirely. Returns the number of tombstones
    /// collected.
    pub fn purge_tombstones(&self, grace: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(grace.as_millis() as u64);
        let mut collected = 0;
        self.entries.retain(|_, siblings| {
            let before = siblings.len();
            siblings.retain(|v| match (v.is_tombstone(), v.tombstoned_at_ms) {
                (true, Some(at)) => at > cutoff,
                _ => true,
            });
            collected += before - siblings.len();
            !siblings.is_empty()
        });
        if collected > 0 {
            debug!(store = self.name(), collected, "purged tombstones");
        }
        collected
    }

    /// Snapshot the full store contents (persistence).
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            descriptor: self.descriptor.clone(),
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Fold a snapshot back in through the reconciliation rule (startup).
    pub fn restore(&self, snapshot: StoreSnapshot) {
        for (key, values) in snapshot.entries {
            let mut entry = self.entries.entry(key).or_default();
            for value in values {
                reconcile(&mut entry, value);
            }
        }
    }
}

/// Serializable full-store snapshot for persistent stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Descriptor of the snapshotted store.
    pub descriptor: StoreRef,
    /// All retained entries.
    pub entries: Vec<(Vec<u8>, Vec<VersionedValue>)>,
}

/// Registry of all stores in one service instance. Registers the system
/// stores at construction.
pub struct StoreRegistry {
    stores: DashMap<String, Arc<Store>>,
    events: broadcast::Sender<StoreEvent>,
    local_node: Arc<LocalNodeId>,
}

impl StoreRegistry {
    /// Create a registry with the system stores registered.
    pub fn new(local_node: Arc<LocalNodeId>) -> Self {
        let (events, _) = broadcast::channel(4096);
        let registry = Self {
            stores: DashMap::new(),
            events,
            local_node,
        };
        // Registration of the built-in stores cannot conflict in a fresh
        // registry.
        let _ = registry.register_store(SYSTEM_NODE_STORE, Scope::Global, true);
        let _ = registry.register_store(SYSTEM_LOCAL_STORE, Scope::Local, false);
        registry
    }

    /// The local node id handle shared with membership and the engine.
    pub fn local_node(&self) -> &Arc<LocalNodeId> {
        &self.local_node
    }

    /// Register a store. Registering the same name with an identical
    /// descriptor is idempotent; a differing descriptor is a conflict.
    pub fn register_store(&self, name: &str, scope: Scope, persist: bool) -> Result<Arc<Store>> {
        let descriptor = StoreRef {
            name: name.to_string(),
            scope,
            persist,
        };
        if let Some(existing) = self.stores.get(name) {
            if *existing.descriptor() == descriptor {
                return Ok(existing.clone());
            }
            return Err(SyncError::StoreConflict {
                name: name.to_string(),
            });
        }
        let store = Arc::new(Store::new(descriptor, self.events.clone()));
        self.stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    /// Look up a registered store.
    pub fn get_store(&self, name: &str) -> Result<Arc<Store>> {
        self.stores
            .get(name)
            .map(|s| s.clone())
            .ok_or_else(|| SyncError::UnknownStore {
                name: name.to_string(),
            })
    }

    /// A typed client over a registered store.
    pub fn client<K, V>(&self, name: &str) -> Result<StoreClient<K, V>> {
        Ok(StoreClient {
            store: self.get_store(name)?,
            local_node: self.local_node.clone(),
            _marker: PhantomData,
        })
    }

    /// All stores with Global scope (the gossiped set).
    pub fn global_stores(&self) -> Vec<Arc<Store>> {
        self.stores
            .iter()
            .filter(|s| s.scope() == Scope::Global)
            .map(|s| s.clone())
            .collect()
    }

    /// Subscribe to store update events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Purge aged tombstones across all stores.
    pub fn purge_tombstones(&self, grace: Duration) -> usize {
        self.stores
            .iter()
            .map(|s| s.purge_tombstones(grace))
            .sum()
    }

    /// Write all persistent stores as JSON snapshots under `dir`.
    pub fn save_persistent(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for store in self.stores.iter().filter(|s| s.is_persistent()) {
            let snapshot = store.snapshot();
            let data = serde_json::to_vec_pretty(&snapshot)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            std::fs::write(dir.join(format!("{}.json", store.name())), data)?;
        }
        Ok(())
    }

    /// Load snapshots for persistent stores from `dir`, folding entries in
    /// through the reconciliation rule. Missing files are not an error.
    pub fn load_persistent(&self, dir: &Path) -> Result<()> {
        for store in self.stores.iter().filter(|s| s.is_persistent()) {
            let path = dir.join(format!("{}.json", store.name()));
            let data = match std::fs::read(&path) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let snapshot: StoreSnapshot = serde_json::from_slice(&data)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            store.restore(snapshot);
        }
        Ok(())
    }
}

/// Typed client over a raw store: serde_json key/value codec plus the
/// local-node clock bookkeeping for writes.
pub struct StoreClient<K, V> {
    store: Arc<Store>,
    local_node: Arc<LocalNodeId>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> StoreClient<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    /// The underlying raw store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>> {
        serde_json::to_vec(key).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    fn encode_value(&self, value: &V) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// The node id local writes are stamped with. Global stores require an
    /// assigned cluster id; Local and Unsynchronized stores may be written
    /// before the node has joined (their clocks never leave this node), so
    /// they fall back to the pre-join placeholder id 0.
    fn write_node(&self) -> Result<NodeId> {
        match self.local_node.get() {
            Some(id) => Ok(id),
            None if self.store.scope() != Scope::Global => Ok(0),
            None => Err(SyncError::Configuration {
                msg: "local node id not assigned; node has not joined a cluster".to_string(),
            }),
        }
    }

    /// All live sibling versions for a key. Callers needing a single value
    /// must apply their own reconciliation.
    pub fn get(&self, key: &K) -> Result<Vec<Versioned<V>>> {
        let raw = self.store.get(&self.encode_key(key)?);
        raw.into_iter()
            .map(|v| {
                let value: V = serde_json::from_slice(&v.value)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Versioned::new(value, v.version))
            })
            .collect()
    }

    /// Convenience single-value read: newest write wins by wall-clock
    /// timestamp. This is an explicit client-side reconciliation choice,
    /// not something the store enforces.
    pub fn get_value(&self, key: &K) -> Result<Option<V>> {
        let mut versions = self.get(key)?;
        versions.sort_by_key(|v| v.version.timestamp_ms);
        Ok(versions.pop().map(|v| v.value))
    }

    /// The merged clock over every retained sibling of a key, suitable as
    /// the read version for an optimistic [`StoreClient::put_versioned`].
    pub fn read_version(&self, key: &K) -> Result<VectorClock> {
        let versions = self.store.get_versions(&self.encode_key(key)?);
        Ok(versions
            .iter()
            .fold(VectorClock::new(), |acc, v| acc.merge(v)))
    }

    /// Plain write; the new version dominates all retained siblings.
    pub fn put(&self, key: &K, value: &V) -> Result<VectorClock> {
        let node = self.write_node()?;
        Ok(self
            .store
            .put(&self.encode_key(key)?, self.encode_value(value)?, node))
    }

    /// Optimistic write against a previously read version; fails with
    /// [`SyncError::ObsoleteVersion`] when the key moved on in between.
    pub fn put_versioned(
        &self,
        key: &K,
        value: &V,
        read_version: &VectorClock,
    ) -> Result<VectorClock> {
        let node = self.write_node()?;
        self.store.put_versioned(
            &self.encode_key(key)?,
            self.encode_value(value)?,
            read_version,
            node,
        )
    }

    /// Delete a key (tombstone write).
    pub fn delete(&self, key: &K) -> Result<()> {
        let node = self.write_node()?;
        self.store.delete(&self.encode_key(key)?, node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StoreRegistry {
        StoreRegistry::new(Arc::new(LocalNodeId::assigned(1)))
    }

    mod raw_store {
        use super::*;

        #[test]
        fn test_put_then_get_single_version() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, false).unwrap();
            store.put(b"k", b"v".to_vec(), 1);

            let versions = store.get(b"k");
            assert_eq!(versions.len(), 1);
            assert_eq!(versions[0].value, b"v");
            assert_eq!(versions[0].version.counter(1), 1);
        }

        #[test]
        fn test_sequential_puts_keep_one_version() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, false).unwrap();
            store.put(b"k", b"v1".to_vec(), 1);
            store.put(b"k", b"v2".to_vec(), 1);

            let versions = store.get(b"k");
            assert_eq!(versions.len(), 1);
            assert_eq!(versions[0].value, b"v2");
            assert_eq!(versions[0].version.counter(1), 2);
        }

        #[test]
        fn test_put_dominates_remote_siblings() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, false).unwrap();
            // Two concurrent remote writes land as siblings.
            store.apply_sync_values(
                b"k",
                vec![
                    VersionedValue::live(b"a".to_vec(), VectorClock::new().incremented(2)),
                    VersionedValue::live(b"b".to_vec(), VectorClock::new().incremented(3)),
                ],
            );
            assert_eq!(store.get(b"k").len(), 2);

            // A local write merges both sibling clocks and wins.
            let version = store.put(b"k", b"merged".to_vec(), 1);
            assert_eq!(version.counter(2), 1);
            assert_eq!(version.counter(3), 1);
            assert_eq!(version.counter(1), 1);
            let versions = store.get(b"k");
            assert_eq!(versions.len(), 1);
            assert_eq!(versions[0].value, b"merged");
        }

        #[test]
        fn test_put_versioned_rejects_stale_read() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, false).unwrap();
            store.put(b"k", b"v1".to_vec(), 1);
            let stale = VectorClock::new();

            let result = store.put_versioned(b"k", b"v2".to_vec(), &stale, 1);
            assert!(matches!(result, Err(SyncError::ObsoleteVersion)));
        }

        #[test]
        fn test_delete_leaves_tombstone_then_gc() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, false).unwrap();
            store.put(b"k", b"v".to_vec(), 1);
            store.delete(b"k", 1);

            assert!(store.get(b"k").is_empty());
            // The tombstone is still retained for sync purposes.
            assert_eq!(store.get_versions(b"k").len(), 1);
            assert_eq!(store.list_keys().len(), 1);

            let collected = store.purge_tombstones(Duration::from_millis(0));
            assert_eq!(collected, 1);
            assert!(store.list_keys().is_empty());
        }

        #[test]
        fn test_fresh_tombstones_survive_gc() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, false).unwrap();
            store.put(b"k", b"v".to_vec(), 1);
            store.delete(b"k", 1);

            let collected = store.purge_tombstones(Duration::from_secs(600));
            assert_eq!(collected, 0);
            assert_eq!(store.get_versions(b"k").len(), 1);
        }

        #[test]
        fn test_apply_sync_values_idempotent() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, false).unwrap();
            let values = vec![VersionedValue::live(
                b"v".to_vec(),
                VectorClock::new().incremented(2),
            )];

            assert!(store.apply_sync_values(b"k", values.clone()));
            assert!(!store.apply_sync_values(b"k", values));
            assert_eq!(store.get(b"k").len(), 1);
        }

        #[test]
        fn test_apply_sync_values_commutative() {
            let a = VersionedValue::live(b"a".to_vec(), VectorClock::new().incremented(2));
            let b = VersionedValue::live(b"b".to_vec(), VectorClock::new().incremented(3));

            let r1 = registry();
            let s1 = r1.register_store("data", Scope::Global, false).unwrap();
            s1.apply_sync_values(b"k", vec![a.clone()]);
            s1.apply_sync_values(b"k", vec![b.clone()]);

            let r2 = registry();
            let s2 = r2.register_store("data", Scope::Global, false).unwrap();
            s2.apply_sync_values(b"k", vec![b]);
            s2.apply_sync_values(b"k", vec![a]);

            let mut v1: Vec<_> = s1.get(b"k").into_iter().map(|v| v.value).collect();
            let mut v2: Vec<_> = s2.get(b"k").into_iter().map(|v| v.value).collect();
            v1.sort();
            v2.sort();
            assert_eq!(v1, v2);
            assert_eq!(v1.len(), 2);
        }

        #[test]
        fn test_remote_tombstone_deletes_local_value() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, false).unwrap();
            let version = store.put(b"k", b"v".to_vec(), 1);

            let mut tomb = VersionedValue::tombstone(version.incremented(2));
            tomb.tombstoned_at_ms = None; // arrives without a local stamp
            store.apply_sync_values(b"k", vec![tomb]);
            assert!(store.get(b"k").is_empty());
        }

        #[test]
        fn test_unsync_apply_overwrites() {
            let r = registry();
            let store = r
                .register_store("status", Scope::Unsynchronized, false)
                .unwrap();
            store.put(b"k", b"local".to_vec(), 1);
            store.apply_unsync_value(b"k", Some(b"remote".to_vec()));

            let versions = store.get(b"k");
            assert_eq!(versions.len(), 1);
            assert_eq!(versions[0].value, b"remote");
        }

        #[test]
        fn test_snapshot_restore_round_trip() {
            let r = registry();
            let store = r.register_store("data", Scope::Global, true).unwrap();
            store.put(b"k1", b"v1".to_vec(), 1);
            store.put(b"k2", b"v2".to_vec(), 1);

            let snapshot = store.snapshot();
            let r2 = registry();
            let store2 = r2.register_store("data", Scope::Global, true).unwrap();
            store2.restore(snapshot);

            assert_eq!(store2.get(b"k1")[0].value, b"v1");
            assert_eq!(store2.get(b"k2")[0].value, b"v2");
        }
    }

    mod registry_tests {
        use super::*;

        #[test]
        fn test_system_stores_registered() {
            let r = registry();
            assert_eq!(
                r.get_store(SYSTEM_NODE_STORE).unwrap().scope(),
                Scope::Global
            );
            assert_eq!(
                r.get_store(SYSTEM_LOCAL_STORE).unwrap().scope(),
                Scope::Local
            );
        }

        #[test]
        fn test_register_idempotent_same_descriptor() {
            let r = registry();
            r.register_store("s", Scope::Global, false).unwrap();
            assert!(r.register_store("s", Scope::Global, false).is_ok());
        }

        #[test]
        fn test_register_conflicting_descriptor() {
            let r = registry();
            r.register_store("s", Scope::Global, false).unwrap();
            assert!(matches!(
                r.register_store("s", Scope::Local, false),
                Err(SyncError::StoreConflict { .. })
            ));
        }

        #[test]
        fn test_unknown_store() {
            let r = registry();
            assert!(matches!(
                r.get_store("nope"),
                Err(SyncError::UnknownStore { .. })
            ));
        }

        #[test]
        fn test_global_stores_excludes_local_scope() {
            let r = registry();
            r.register_store("g", Scope::Global, false).unwrap();
            r.register_store("l", Scope::Local, false).unwrap();
            r.register_store("u", Scope::Unsynchronized, false).unwrap();

            let names: Vec<_> = r
                .global_stores()
                .iter()
                .map(|s| s.name().to_string())
                .collect();
            assert!(names.contains(&"g".to_string()));
            assert!(names.contains(&SYSTEM_NODE_STORE.to_string()));
            assert!(!names.contains(&"l".to_string()));
            assert!(!names.contains(&"u".to_string()));
        }

        #[test]
        fn test_events_delivered_to_subscribers() {
            let r = registry();
            let store = r.register_store("s", Scope::Global, false).unwrap();
            let mut rx = r.subscribe();
            store.put(b"k", b"v".to_vec(), 1);

            let event = rx.try_recv().unwrap();
            assert_eq!(event.store.name, "s");
            assert_eq!(event.key, b"k");
            assert_eq!(event.origin, UpdateOrigin::Local);
        }

        #[test]
        fn test_save_load_persistent() {
            let dir = tempfile::tempdir().unwrap();
            let r = registry();
            let store = r.register_store("p", Scope::Global, true).unwrap();
            store.put(b"k", b"v".to_vec(), 1);
            r.save_persistent(dir.path()).unwrap();

            let r2 = registry();
            r2.register_store("p", Scope::Global, true).unwrap();
            r2.load_persistent(dir.path()).unwrap();
            assert_eq!(r2.get_store("p").unwrap().get(b"k")[0].value, b"v");
        }
    }

    mod client {
        use super::*;

        #[test]
        fn test_typed_round_trip() {
            let r = registry();
            r.register_store("cfg", Scope::Global, false).unwrap();
            let client: StoreClient<String, u32> = r.client("cfg").unwrap();

            client.put(&"answer".to_string(), &42).unwrap();
            let versions = client.get(&"answer".to_string()).unwrap();
            assert_eq!(versions.len(), 1);
            assert_eq!(versions[0].value, 42);
        }

        #[test]
        fn test_get_value_newest_timestamp_wins() {
            let r = registry();
            let store = r.register_store("cfg", Scope::Global, false).unwrap();
            let client: StoreClient<String, String> = r.client("cfg").unwrap();

            let key = serde_json::to_vec(&"k".to_string()).unwrap();
            let mut older = VectorClock::new().incremented(2);
            older.timestamp_ms = 100;
            let mut newer = VectorClock::new().incremented(3);
            newer.timestamp_ms = 200;
            store.apply_sync_values(
                &key,
                vec![
                    VersionedValue::live(serde_json::to_vec("old").unwrap(), older),
                    VersionedValue::live(serde_json::to_vec("new").unwrap(), newer),
                ],
            );

            assert_eq!(client.get_value(&"k".to_string()).unwrap().unwrap(), "new");
        }

        #[test]
        fn test_put_versioned_retry_loop() {
            let r = registry();
            r.register_store("cfg", Scope::Global, false).unwrap();
            let client: StoreClient<String, u32> = r.client("cfg").unwrap();
            let key = "counter".to_string();
            client.put(&key, &1).unwrap();

            let read = client.read_version(&key).unwrap();
            client.put(&key, &2).unwrap(); // concurrent bump
            assert!(matches!(
                client.put_versioned(&key, &3, &read),
                Err(SyncError::ObsoleteVersion)
            ));

            // Retry with a fresh read succeeds.
            let read = client.read_version(&key).unwrap();
            client.put_versioned(&key, &3, &read).unwrap();
            assert_eq!(client.get_value(&key).unwrap().unwrap(), 3);
        }

        #[test]
        fn test_delete_hides_value() {
            let r = registry();
            r.register_store("cfg", Scope::Global, false).unwrap();
            let client: StoreClient<String, u32> = r.client("cfg").unwrap();
            client.put(&"k".to_string(), &7).unwrap();
            client.delete(&"k".to_string()).unwrap();
            assert!(client.get(&"k".to_string()).unwrap().is_empty());
        }

        #[test]
        fn test_global_put_requires_assigned_node() {
            let r = StoreRegistry::new(Arc::new(LocalNodeId::unassigned()));
            r.register_store("g", Scope::Global, false).unwrap();
            let client: StoreClient<String, u32> = r.client("g").unwrap();
            assert!(matches!(
                client.put(&"k".to_string(), &1),
                Err(SyncError::Configuration { .. })
            ));

            // Local-scope stores accept writes before the node joins.
            let local: StoreClient<String, u32> = r.client(SYSTEM_LOCAL_STORE).unwrap();
            local.put(&"k".to_string(), &1).unwrap();
        }
    }
}
