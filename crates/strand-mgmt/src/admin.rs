//! Administrative entry points over the cluster service graph.
//!
//! Mutations arrive as a [`SettingsPatch`], are validated as a whole and
//! then applied to membership, election and security. Queries surface the
//! node status table, the local node id, domain leaders and the cluster
//! secret. These are the only calls that can fail synchronously; the sync
//! engine itself never surfaces peer failures here.

use std::sync::Arc;

use base64::Engine as _;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use strand_sync::election::DomainLeaderElection;
use strand_sync::error::SyncError;
use strand_sync::membership::Membership;
use strand_sync::security::{self, ClusterSecret, ClusterSecurityManager};
use strand_sync::version::{DomainId, NodeId};
use strand_transport::AuthScheme;

use crate::config::{AuthSettings, ConfigError, SettingsPatch, ValidatedSettings};

/// Failures of an administrative call.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The request failed field validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The validated request could not be applied.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Connectivity status of a node as reported to administrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// An authenticated connection to the node is up.
    Connected,
    /// No live connection to the node.
    Disconnected,
}

/// One row of the `status/nodes` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeStatusEntry {
    /// Hostname peers dial.
    pub hostname: String,
    /// Cluster listen port.
    pub port: u16,
    /// Node id.
    pub node_id: NodeId,
    /// Election domain.
    pub domain_id: DomainId,
    /// Connectivity as seen from this node.
    pub status: NodeStatus,
}

/// The administrative facade over one cluster service instance.
pub struct ClusterAdmin {
    membership: Arc<Membership>,
    election: Arc<DomainLeaderElection>,
    security: Arc<ClusterSecurityManager>,
}

impl ClusterAdmin {
    /// Create the facade over the service graph.
    pub fn new(
        membership: Arc<Membership>,
        election: Arc<DomainLeaderElection>,
        security: Arc<ClusterSecurityManager>,
    ) -> Self {
        Self {
            membership,
            election,
            security,
        }
    }

    /// Validate and apply one administrative mutation request.
    pub fn apply(&self, patch: SettingsPatch) -> Result<(), AdminError> {
        let settings = patch.validate()?;
        self.apply_validated(settings)?;
        Ok(())
    }

    fn apply_validated(&self, settings: ValidatedSettings) -> Result<(), SyncError> {
        if let Some(auth) = settings.auth {
            self.apply_auth(auth)?;
        }
        if let Some(port) = settings.local_node_port {
            self.membership.set_local_node_port(port)?;
        }
        if let Some(host) = &settings.local_node_host {
            self.membership.set_local_node_host(host)?;
        }
        if let Some(iface) = &settings.local_node_iface {
            self.membership.set_local_node_iface(iface)?;
        }
        match (&settings.seeds, settings.reseed) {
            (Some(seeds), true) => self.membership.reseed(seeds)?,
            (Some(seeds), false) => self.membership.set_seeds(seeds)?,
            (None, true) => {
                let seeds = self.membership.seeds();
                self.membership.reseed(&seeds)?;
            }
            (None, false) => {}
        }
        if let Some(domain_id) = settings.local_domain_id {
            self.membership.set_local_domain_id(domain_id)?;
            self.election.refresh();
        }
        if let Some(node_id) = settings.delete_node {
            self.membership.delete_node(node_id)?;
            self.election.refresh();
        }
        if let Some(rigged) = settings.new_election {
            self.election.new_election(rigged)?;
        }
        Ok(())
    }

    fn apply_auth(&self, auth: AuthSettings) -> Result<(), SyncError> {
        match auth.scheme {
            AuthScheme::SharedSecret => {
                let path = auth
                    .keystore_path
                    .ok_or_else(|| SyncError::Configuration {
                        msg: "shared-secret scheme requires a keystore path".to_string(),
                    })?;
                let password =
                    auth.keystore_password
                        .ok_or_else(|| SyncError::Configuration {
                            msg: "shared-secret scheme requires a keystore password".to_string(),
                        })?;
                let secret = auth.cluster_secret.map(ClusterSecret::from_bytes);
                security::write_shared_secret(&path, &password, secret)?;
                let path_str = path.display().to_string();
                self.membership.set_local_auth(
                    &auth.scheme.to_string(),
                    Some(path_str.as_str()),
                    Some(password.as_str()),
                )?;
                self.security
                    .set_auth_info(auth.scheme, Some(path), Some(password))?;
            }
            AuthScheme::NoAuth => {
                self.membership
                    .set_local_auth(&auth.scheme.to_string(), None, None)?;
                self.security.set_auth_info(auth.scheme, None, None)?;
            }
        }
        info!(scheme = %auth.scheme, "cluster authentication updated");
        Ok(())
    }

    /// `status/nodes`: every known node with its connectivity, sorted by
    /// node id.
    pub fn node_status(&self) -> Vec<NodeStatusEntry> {
        self.membership
            .nodes()
            .into_iter()
            .map(|node| {
                let status = if self.membership.is_connected(node.node_id) {
                    NodeStatus::Connected
                } else {
                    NodeStatus::Disconnected
                };
                NodeStatusEntry {
                    hostname: node.hostname,
                    port: node.port,
                    node_id: node.node_id,
                    domain_id: node.domain_id,
                    status,
                }
            })
            .collect()
    }

    /// `status/local-node-id`.
    pub fn local_node_id(&self) -> Option<NodeId> {
        self.membership.local_node_id()
    }

    /// `status/domain-leader`.
    pub fn domain_leader(&self, domain_id: DomainId) -> Option<NodeId> {
        self.election.domain_leader(domain_id)
    }

    /// `config/local-node-auth`: the cluster secret, base64-encoded. None
    /// when authentication is disabled.
    pub fn cluster_secret_base64(&self) -> Result<Option<String>, SyncError> {
        Ok(self
            .security
            .current_secret()?
            .map(|s| base64::engine::general_purpose::STANDARD.encode(s.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use strand_sync::membership::ClusterNode;
    use strand_sync::security::AuthInfo;
    use strand_sync::store::{LocalNodeId, StoreRegistry};

    fn admin_with_local(node_id: NodeId) -> (ClusterAdmin, Arc<Membership>) {
        let registry = Arc::new(StoreRegistry::new(Arc::new(LocalNodeId::assigned(node_id))));
        let membership = Membership::new(registry);
        membership
            .initialize_local(ClusterNode {
                node_id,
                domain_id: node_id,
                hostname: format!("node-{node_id}"),
                port: 6642,
            })
            .unwrap();
        let election = DomainLeaderElection::new(membership.clone());
        election.refresh();
        let security = Arc::new(ClusterSecurityManager::new(AuthInfo::no_auth()));
        (
            ClusterAdmin::new(membership.clone(), election, security),
            membership,
        )
    }

    fn patch() -> SettingsPatch {
        SettingsPatch::default()
    }

    #[test]
    fn test_invalid_patch_rejected_before_any_mutation() {
        let (admin, membership) = admin_with_local(1);
        let bad = SettingsPatch {
            local_node_port: Some("not-a-port".to_string()),
            seeds: Some("10.0.0.9:6642".to_string()),
            ..patch()
        };
        assert!(matches!(admin.apply(bad), Err(AdminError::Config(_))));
        // The valid seeds field must not have been applied.
        assert!(membership.seeds().is_empty());
    }

    #[test]
    fn test_apply_seeds_and_local_fields() {
        let (admin, membership) = admin_with_local(1);
        admin
            .apply(SettingsPatch {
                local_node_host: Some("ctl-1.example".to_string()),
                local_node_iface: Some("eth0".to_string()),
                seeds: Some("10.0.0.1:6642,10.0.0.2:6642".to_string()),
                ..patch()
            })
            .unwrap();
        assert_eq!(
            membership.seeds(),
            vec!["10.0.0.1:6642", "10.0.0.2:6642"]
        );
    }

    #[test]
    fn test_domain_move_reflected_in_status() {
        let (admin, _membership) = admin_with_local(1);
        admin
            .apply(SettingsPatch {
                local_domain_id: Some("5".to_string()),
                ..patch()
            })
            .unwrap();
        let status = admin.node_status();
        assert_eq!(status[0].domain_id, 5);
        assert_eq!(admin.domain_leader(5), Some(1));
    }

    #[test]
    fn test_delete_node_paths() {
        let (admin, membership) = admin_with_local(1);
        membership
            .add_node(ClusterNode {
                node_id: 2,
                domain_id: 2,
                hostname: "node-2".to_string(),
                port: 6642,
            })
            .unwrap();

        admin
            .apply(SettingsPatch {
                delete_node: Some("2".to_string()),
                ..patch()
            })
            .unwrap();
        assert!(membership.node(2).is_none());

        // Deleting an unknown node surfaces the sync-layer error.
        let err = admin
            .apply(SettingsPatch {
                delete_node: Some("2".to_string()),
                ..patch()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            AdminError::Sync(SyncError::NodeNotFound { node_id: 2 })
        ));
    }

    #[test]
    fn test_status_table_sorted_with_connectivity() {
        let (admin, membership) = admin_with_local(2);
        for id in [5u16, 1u16] {
            membership
                .add_node(ClusterNode {
                    node_id: id,
                    domain_id: id,
                    hostname: format!("node-{id}"),
                    port: 6642,
                })
                .unwrap();
        }
        membership.peer_connected(5);

        let status = admin.node_status();
        let ids: Vec<_> = status.iter().map(|e| e.node_id).collect();
        assert_eq!(ids, vec![1, 2, 5]);
        assert_eq!(status[0].status, NodeStatus::Disconnected);
        // The local node always reports connected to itself.
        assert_eq!(status[1].status, NodeStatus::Connected);
        assert_eq!(status[2].status, NodeStatus::Connected);
    }

    #[test]
    fn test_rigged_election_via_admin() {
        let (admin, membership) = admin_with_local(5);
        membership
            .add_node(ClusterNode {
                node_id: 1,
                domain_id: 5,
                hostname: "node-1".to_string(),
                port: 6642,
            })
            .unwrap();
        membership.peer_connected(1);
        admin.election.refresh();
        assert_eq!(admin.domain_leader(5), Some(1));

        admin
            .apply(SettingsPatch {
                new_election: Some(crate::config::ElectionTrigger { rigged: true }),
                ..patch()
            })
            .unwrap();
        assert_eq!(admin.domain_leader(5), Some(5));
    }

    #[test]
    fn test_auth_rotation_and_secret_readout() {
        let dir = tempfile::tempdir().unwrap();
        let ks = dir.path().join("cluster.ks");
        let (admin, _membership) = admin_with_local(1);
        assert!(admin.cluster_secret_base64().unwrap().is_none());

        admin
            .apply(SettingsPatch {
                local_node_auth: Some(crate::config::AuthPatch {
                    auth_scheme: "shared-secret".to_string(),
                    keystore_path: Some(ks.display().to_string()),
                    keystore_password: Some("pw".to_string()),
                    // Empty secret asks the service to generate one.
                    cluster_secret: Some(String::new()),
                }),
                ..patch()
            })
            .unwrap();

        let encoded = admin.cluster_secret_base64().unwrap().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .unwrap();
        assert_eq!(decoded.len(), strand_sync::security::SECRET_LEN);

        // A supplied secret round-trips through the keystore.
        admin
            .apply(SettingsPatch {
                local_node_auth: Some(crate::config::AuthPatch {
                    auth_scheme: "shared-secret".to_string(),
                    keystore_path: Some(ks.display().to_string()),
                    keystore_password: Some("pw".to_string()),
                    cluster_secret: Some(encoded.clone()),
                }),
                ..patch()
            })
            .unwrap();
        assert_eq!(admin.cluster_secret_base64().unwrap().unwrap(), encoded);
    }

    #[test]
    fn test_reseed_without_new_seeds_reuses_current() {
        let (admin, membership) = admin_with_local(1);
        membership.set_seeds(&["10.0.0.1:6642".to_string()]).unwrap();

        admin
            .apply(SettingsPatch {
                reseed: Some(true),
                ..patch()
            })
            .unwrap();
        // The local registry record is dropped so the bootstrap path
        // re-runs; the node keeps its id and seeds.
        assert_eq!(membership.local_node_id(), Some(1));
        assert!(membership.node(1).is_none());
        assert_eq!(membership.seeds(), vec!["10.0.0.1:6642"]);
    }
}
