#![warn(missing_docs)]

//! strand-syncd: the cluster synchronization daemon.
//!
//! Reads a JSON configuration file, wires up one explicit service graph
//! (store registry, membership, election, security, protocol engine) and
//! runs until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strand_sync::election::DomainLeaderElection;
use strand_sync::engine::{SyncConfig, SyncEngine};
use strand_sync::membership::{ClusterNode, Membership};
use strand_sync::security::{AuthInfo, AuthScheme, ClusterSecurityManager};
use strand_sync::store::{LocalNodeId, StoreRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SyncdConfig {
    /// Address the cluster listener binds to.
    listen_addr: String,
    /// Hostname advertised to peers.
    hostname: String,
    /// Statically assigned node id; absent means join through the seeds.
    node_id: Option<u16>,
    /// Election domain for a statically configured node.
    domain_id: Option<u16>,
    /// Discovery seed addresses (`host:port`).
    seeds: Vec<String>,
    /// Peer authentication scheme (`no-auth` or `shared-secret`).
    auth_scheme: String,
    /// Keystore holding the cluster secret (shared-secret scheme).
    keystore_path: Option<PathBuf>,
    /// Password protecting the keystore.
    keystore_password: Option<String>,
    /// Directory for persistent store snapshots; absent disables
    /// persistence.
    data_dir: Option<PathBuf>,
    /// Anti-entropy cycle interval in seconds.
    sync_interval_secs: u64,
}

impl Default for SyncdConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6642".to_string(),
            hostname: "127.0.0.1".to_string(),
            node_id: None,
            domain_id: None,
            seeds: Vec::new(),
            auth_scheme: "no-auth".to_string(),
            keystore_path: None,
            keystore_password: None,
            data_dir: None,
            sync_interval_secs: 5,
        }
    }
}

impl SyncdConfig {
    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    fn auth_info(&self) -> Result<AuthInfo> {
        let scheme: AuthScheme = self
            .auth_scheme
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(AuthInfo {
            scheme,
            keystore_path: self.keystore_path.clone(),
            keystore_password: self.keystore_password.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "strand-syncd.json".to_string());
    let config = if Path::new(&config_path).exists() {
        SyncdConfig::from_file(Path::new(&config_path))?
    } else {
        tracing::warn!(path = %config_path, "config file not found; using defaults");
        SyncdConfig::default()
    };

    let registry = Arc::new(StoreRegistry::new(Arc::new(LocalNodeId::unassigned())));
    if let Some(dir) = &config.data_dir {
        registry
            .load_persistent(dir)
            .with_context(|| format!("loading persistent stores from {}", dir.display()))?;
    }
    let membership = Membership::new(registry.clone());
    let security = Arc::new(ClusterSecurityManager::new(config.auth_info()?));
    membership.set_local_auth(
        &config.auth_scheme,
        config.keystore_path.as_deref().and_then(Path::to_str),
        config.keystore_password.as_deref(),
    )?;
    let election = DomainLeaderElection::new(membership.clone());

    tokio::spawn(membership.clone().watch_node_store(registry.subscribe()));
    tokio::spawn(election.clone().run(membership.subscribe()));

    let sync_config = SyncConfig {
        listen_addr: config.listen_addr.clone(),
        sync_interval: Duration::from_secs(config.sync_interval_secs),
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(
        sync_config,
        registry.clone(),
        membership.clone(),
        security.clone(),
    );
    let addr = engine.start().await?;

    match config.node_id {
        Some(node_id) => {
            // Static identity: the node is a cluster member from the start.
            membership.initialize_local(ClusterNode {
                node_id,
                domain_id: config.domain_id.unwrap_or(node_id),
                hostname: config.hostname.clone(),
                port: addr.port(),
            })?;
        }
        None => {
            // Dynamic identity: record how peers reach us and let the
            // bootstrap loop join through the seeds.
            membership.set_local_node_host(&config.hostname)?;
            membership.set_local_node_port(addr.port())?;
        }
    }
    if !config.seeds.is_empty() {
        membership.set_seeds(&config.seeds)?;
    }

    tracing::info!(%addr, "strand-syncd running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    engine.shutdown();
    if let Some(dir) = &config.data_dir {
        registry
            .save_persistent(dir)
            .with_context(|| format!("saving persistent stores to {}", dir.display()))?;
    }
    Ok(())
}
