//! Cluster membership: the node registry and peer connectivity tracking.
//!
//! The authoritative node registry lives in the replicated system node
//! store, so topology changes spread to every member through the normal
//! sync path. This manager is the typed front for that store plus the
//! connectivity view fed by transport-level connect/disconnect callbacks.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::store::{
    StoreClient, StoreEvent, StoreRegistry, UpdateOrigin, AUTH_SCHEME, KEYSTORE_PASSWORD,
    KEYSTORE_PATH, LOCAL_NODE_HOSTNAME, LOCAL_NODE_IFACE, LOCAL_NODE_ID, LOCAL_NODE_PORT, SEEDS,
    SYSTEM_LOCAL_STORE, SYSTEM_NODE_STORE,
};
use crate::version::{DomainId, NodeId};

/// One member of the controller cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Unique node id, immutable for the life of the node.
    pub node_id: NodeId,
    /// Election domain this node belongs to.
    pub domain_id: DomainId,
    /// Hostname or address peers dial.
    pub hostname: String,
    /// Cluster listen port.
    pub port: u16,
}

impl ClusterNode {
    /// The dialable address of this node.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Membership changes, consumed by the election reactor and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node was added to the registry.
    NodeAdded {
        /// The added node.
        node_id: NodeId,
    },
    /// A node's registry record changed (typically via replication).
    NodeUpdated {
        /// The updated node.
        node_id: NodeId,
    },
    /// A node was removed from the registry.
    NodeRemoved {
        /// The removed node.
        node_id: NodeId,
    },
    /// A transport connection to the node was authenticated.
    NodeConnected {
        /// The connected node.
        node_id: NodeId,
    },
    /// The transport connection to the node was lost.
    NodeDisconnected {
        /// The disconnected node.
        node_id: NodeId,
    },
    /// The local node moved between election domains.
    DomainChanged {
        /// The node that moved.
        node_id: NodeId,
        /// Domain before the move.
        old_domain: DomainId,
        /// Domain after the move.
        new_domain: DomainId,
    },
}

/// Node registry and connectivity view for one service instance.
pub struct Membership {
    registry: Arc<StoreRegistry>,
    connected: DashMap<NodeId, ()>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Membership {
    /// Create the membership manager over a store registry.
    pub fn new(registry: Arc<StoreRegistry>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            registry,
            connected: DashMap::new(),
            events,
        })
    }

    fn node_client(&self) -> Result<StoreClient<NodeId, ClusterNode>> {
        self.registry.client(SYSTEM_NODE_STORE)
    }

    fn local_client(&self) -> Result<StoreClient<String, String>> {
        self.registry.client(SYSTEM_LOCAL_STORE)
    }

    /// Subscribe to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MembershipEvent) {
        let _ = self.events.send(event);
    }

    /// The local node's cluster id, if assigned.
    pub fn local_node_id(&self) -> Option<NodeId> {
        self.registry.local_node().get()
    }

    /// The local node's registry record, if present.
    pub fn local_node(&self) -> Option<ClusterNode> {
        let id = self.local_node_id()?;
        self.node(id)
    }

    /// Record the local node's identity: assigns the id, writes the
    /// registry record and the local bootstrap keys. Used by static
    /// configuration and at join completion.
    pub fn initialize_local(&self, node: ClusterNode) -> Result<()> {
        self.registry.local_node().set(node.node_id);
        let locals = self.local_client()?;
        locals.put(&LOCAL_NODE_ID.to_string(), &node.node_id.to_string())?;
        locals.put(&LOCAL_NODE_HOSTNAME.to_string(), &node.hostname)?;
        locals.put(&LOCAL_NODE_PORT.to_string(), &node.port.to_string())?;
        self.add_node(node)
    }

    /// All known cluster nodes. Concurrent registry records for the same
    /// id are resolved newest-timestamp-wins for display purposes.
    pub fn nodes(&self) -> Vec<ClusterNode> {
        let client = match self.node_client() {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let mut nodes = Vec::new();
        for key in client.store().list_keys() {
            let node_id: NodeId = match serde_json::from_slice(&key) {
                Ok(id) => id,
                Err(_) => continue,
            };
            if let Ok(Some(node)) = client.get_value(&node_id) {
                nodes.push(node);
            }
        }
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    /// Look up one node's registry record.
    pub fn node(&self, node_id: NodeId) -> Option<ClusterNode> {
        self.node_client().ok()?.get_value(&node_id).ok()?
    }

    /// Add (or update) a node in the registry.
    pub fn add_node(&self, node: ClusterNode) -> Result<()> {
        let node_id = node.node_id;
        self.node_client()?.put(&node_id, &node)?;
        debug!(node_id, domain_id = node.domain_id, "node added to cluster registry");
        self.emit(MembershipEvent::NodeAdded { node_id });
        Ok(())
    }

    /// Remove a node from the registry. Refuses to remove the local node
    /// and fails with [`SyncError::NodeNotFound`] for unknown ids.
    pub fn delete_node(&self, node_id: NodeId) -> Result<()> {
        if self.local_node_id() == Some(node_id) {
            return Err(SyncError::Configuration {
                msg: "cannot delete the local node from the cluster".to_string(),
            });
        }
        if self.node(node_id).is_none() {
            return Err(SyncError::NodeNotFound { node_id });
        }
        self.node_client()?.delete(&node_id)?;
        self.connected.remove(&node_id);
        self.emit(MembershipEvent::NodeRemoved { node_id });
        Ok(())
    }

    /// Move the local node to another election domain. Uses an optimistic
    /// read-modify-write loop against the node store so a concurrent
    /// remote update to the record is never silently overwritten.
    pub fn set_local_domain_id(&self, domain_id: DomainId) -> Result<()> {
        let node_id = self.local_node_id().ok_or_else(|| SyncError::Configuration {
            msg: "local node is not a cluster member".to_string(),
        })?;
        let client = self.node_client()?;
        loop {
            let current = client.get_value(&node_id)?.ok_or_else(|| SyncError::Configuration {
                msg: "local node not found in system node store".to_string(),
            })?;
            let old_domain = current.domain_id;
            let read = client.read_version(&node_id)?;
            let updated = ClusterNode {
                domain_id,
                ..current
            };
            match client.put_versioned(&node_id, &updated, &read) {
                Ok(_) => {
                    self.emit(MembershipEvent::DomainChanged {
                        node_id,
                        old_domain,
                        new_domain: domain_id,
                    });
                    return Ok(());
                }
                Err(SyncError::ObsoleteVersion) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Set the hostname peers should use to reach this node.
    pub fn set_local_node_host(&self, hostname: &str) -> Result<()> {
        self.local_client()?
            .put(&LOCAL_NODE_HOSTNAME.to_string(), &hostname.to_string())?;
        Ok(())
    }

    /// Set the interface name the local address is derived from.
    pub fn set_local_node_iface(&self, iface: &str) -> Result<()> {
        self.local_client()?
            .put(&LOCAL_NODE_IFACE.to_string(), &iface.to_string())?;
        Ok(())
    }

    /// Set the cluster listen port of the local node.
    pub fn set_local_node_port(&self, port: u16) -> Result<()> {
        self.local_client()?
            .put(&LOCAL_NODE_PORT.to_string(), &port.to_string())?;
        Ok(())
    }

    /// Record the peer-authentication settings alongside the other local
    /// bootstrap keys.
    pub fn set_local_auth(
        &self,
        scheme: &str,
        keystore_path: Option<&str>,
        keystore_password: Option<&str>,
    ) -> Result<()> {
        let locals = self.local_client()?;
        locals.put(&AUTH_SCHEME.to_string(), &scheme.to_string())?;
        if let Some(path) = keystore_path {
            locals.put(&KEYSTORE_PATH.to_string(), &path.to_string())?;
        }
        if let Some(password) = keystore_password {
            locals.put(&KEYSTORE_PASSWORD.to_string(), &password.to_string())?;
        }
        Ok(())
    }

    /// The configured discovery seed addresses.
    pub fn seeds(&self) -> Vec<String> {
        let client = match self.local_client() {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        match client.get_value(&SEEDS.to_string()) {
            Ok(Some(seeds)) if !seeds.is_empty() => {
                seeds.split(',').map(|s| s.trim().to_string()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Store the discovery seed addresses.
    pub fn set_seeds(&self, seeds: &[String]) -> Result<()> {
        self.local_client()?
            .put(&SEEDS.to_string(), &seeds.join(","))?;
        Ok(())
    }

    /// Replace the seed set and drop the local node's registry record so
    /// the bootstrap path re-runs against the new seeds (the node keeps
    /// its id). Connections to nodes no longer in any reachable set are
    /// left to time out naturally rather than being force-closed.
    pub fn reseed(&self, new_seeds: &[String]) -> Result<()> {
        self.set_seeds(new_seeds)?;
        if let Some(node_id) = self.local_node_id() {
            if self.node(node_id).is_some() {
                self.node_client()?.delete(&node_id)?;
                self.emit(MembershipEvent::NodeRemoved { node_id });
            }
        }
        Ok(())
    }

    /// Whether a node currently has an authenticated connection. The
    /// local node is always connected to itself.
    pub fn is_connected(&self, node_id: NodeId) -> bool {
        if self.local_node_id() == Some(node_id) {
            return true;
        }
        self.connected.contains_key(&node_id)
    }

    /// Transport callback: an authenticated connection to the peer is up.
    pub fn peer_connected(&self, node_id: NodeId) {
        if self.connected.insert(node_id, ()).is_none() {
            debug!(node_id, "peer connected");
            self.emit(MembershipEvent::NodeConnected { node_id });
        }
    }

    /// Transport callback: the connection to the peer is gone (socket
    /// error, explicit close or missed-heartbeat timeout).
    pub fn peer_disconnected(&self, node_id: NodeId) {
        if self.connected.remove(&node_id).is_some() {
            debug!(node_id, "peer disconnected");
            self.emit(MembershipEvent::NodeDisconnected { node_id });
        }
    }

    /// Connected node ids within a domain, the local node included.
    pub fn connected_in_domain(&self, domain_id: DomainId) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .filter(|n| n.domain_id == domain_id && self.is_connected(n.node_id))
            .map(|n| n.node_id)
            .collect()
    }

    /// Fold replicated node-store updates back into membership events so
    /// election and the engine react to topology changes made elsewhere in
    /// the cluster. Runs until the registry event channel closes.
    pub async fn watch_node_store(self: Arc<Self>, mut events: broadcast::Receiver<StoreEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "membership mirror lagged behind store events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if event.store.name != SYSTEM_NODE_STORE || event.origin != UpdateOrigin::Remote {
                continue;
            }
            let node_id: NodeId = match serde_json::from_slice(&event.key) {
                Ok(id) => id,
                Err(_) => continue,
            };
            if self.node(node_id).is_some() {
                self.emit(MembershipEvent::NodeUpdated { node_id });
            } else {
                self.connected.remove(&node_id);
                self.emit(MembershipEvent::NodeRemoved { node_id });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalNodeId;

    fn member(node_id: NodeId, domain_id: DomainId) -> ClusterNode {
        ClusterNode {
            node_id,
            domain_id,
            hostname: format!("node-{node_id}"),
            port: 6642,
        }
    }

    fn membership_with_local(node_id: NodeId) -> Arc<Membership> {
        let registry = Arc::new(StoreRegistry::new(Arc::new(LocalNodeId::assigned(node_id))));
        let membership = Membership::new(registry);
        membership
            .initialize_local(member(node_id, node_id))
            .unwrap();
        membership
    }

    #[test]
    fn test_initialize_local_registers_node() {
        let m = membership_with_local(1);
        assert_eq!(m.local_node_id(), Some(1));
        let nodes = m.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, 1);
    }

    #[test]
    fn test_nodes_sorted_by_id() {
        let m = membership_with_local(2);
        m.add_node(member(5, 5)).unwrap();
        m.add_node(member(1, 1)).unwrap();

        let ids: Vec<_> = m.nodes().iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![1, 2, 5]);
    }

    #[test]
    fn test_delete_unknown_node() {
        let m = membership_with_local(1);
        assert!(matches!(
            m.delete_node(42),
            Err(SyncError::NodeNotFound { node_id: 42 })
        ));
    }

    #[test]
    fn test_delete_local_node_refused() {
        let m = membership_with_local(1);
        assert!(matches!(
            m.delete_node(1),
            Err(SyncError::Configuration { .. })
        ));
    }

    #[test]
    fn test_delete_node_removes_record() {
        let m = membership_with_local(1);
        m.add_node(member(2, 2)).unwrap();
        m.delete_node(2).unwrap();
        assert!(m.node(2).is_none());
    }

    #[test]
    fn test_local_always_connected() {
        let m = membership_with_local(1);
        assert!(m.is_connected(1));
        assert!(!m.is_connected(2));
    }

    #[test]
    fn test_connectivity_transitions_emit_once() {
        let m = membership_with_local(1);
        let mut rx = m.subscribe();
        m.peer_connected(2);
        m.peer_connected(2);
        m.peer_disconnected(2);
        m.peer_disconnected(2);

        assert_eq!(
            rx.try_recv().unwrap(),
            MembershipEvent::NodeConnected { node_id: 2 }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            MembershipEvent::NodeDisconnected { node_id: 2 }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_local_domain_emits_both_domains() {
        let m = membership_with_local(1);
        let mut rx = m.subscribe();
        m.set_local_domain_id(9).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            MembershipEvent::DomainChanged {
                node_id: 1,
                old_domain: 1,
                new_domain: 9
            }
        );
        assert_eq!(m.local_node().unwrap().domain_id, 9);
    }

    #[test]
    fn test_set_local_auth_records_bootstrap_keys() {
        let m = membership_with_local(1);
        m.set_local_auth("shared-secret", Some("/etc/strand/cluster.ks"), Some("pw"))
            .unwrap();

        let locals: StoreClient<String, String> =
            m.registry.client(SYSTEM_LOCAL_STORE).unwrap();
        assert_eq!(
            locals
                .get_value(&AUTH_SCHEME.to_string())
                .unwrap()
                .as_deref(),
            Some("shared-secret")
        );
        assert_eq!(
            locals
                .get_value(&KEYSTORE_PATH.to_string())
                .unwrap()
                .as_deref(),
            Some("/etc/strand/cluster.ks")
        );
    }

    #[test]
    fn test_seeds_round_trip() {
        let m = membership_with_local(1);
        assert!(m.seeds().is_empty());
        m.set_seeds(&["10.0.0.1:6642".to_string(), "10.0.0.2:6642".to_string()])
            .unwrap();
        assert_eq!(m.seeds(), vec!["10.0.0.1:6642", "10.0.0.2:6642"]);
    }

    #[test]
    fn test_reseed_drops_local_record_keeps_id() {
        let m = membership_with_local(1);
        m.reseed(&["10.0.0.9:6642".to_string()]).unwrap();
        assert_eq!(m.local_node_id(), Some(1));
        assert!(m.node(1).is_none());
        assert_eq!(m.seeds(), vec!["10.0.0.9:6642"]);
    }

    #[test]
    fn test_connected_in_domain() {
        let m = membership_with_local(1);
        m.add_node(member(2, 1)).unwrap();
        m.add_node(member(3, 2)).unwrap();
        m.peer_connected(2);
        m.peer_connected(3);

        let mut in_domain = m.connected_in_domain(1);
        in_domain.sort();
        assert_eq!(in_domain, vec![1, 2]);
        assert_eq!(m.connected_in_domain(2), vec![3]);
    }
}
