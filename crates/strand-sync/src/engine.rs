//! The anti-entropy protocol engine.
//!
//! Each authenticated peer connection runs two tasks: a read loop that
//! applies incoming messages, and a cycle loop that periodically offers
//! per-key version digests for every global store. An offer is answered
//! with a request for the keys whose digests are news to the receiver,
//! and the request with the corresponding values. Local writes are
//! additionally pushed out of cycle for lower propagation latency; a
//! failed push is absorbed silently because the next cycle catches up.
//! Network failures never escape the owning task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use strand_transport::{handshake, Connection, Listener, Transport, TransportConfig, TransportError};

use crate::error::{Result, SyncError};
use crate::membership::{ClusterNode, Membership};
use crate::proto::{KeyedValues, KeyedVersions, MessageHeader, SyncMessage, WireValue};
use crate::security::ClusterSecurityManager;
use crate::store::{
    Scope, Store, StoreEvent, StoreRegistry, UpdateOrigin, LOCAL_NODE_HOSTNAME, LOCAL_NODE_ID,
    LOCAL_NODE_PORT, SYSTEM_LOCAL_STORE, SYSTEM_NODE_STORE,
};
use crate::version::NodeId;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Address the cluster listener binds to.
    pub listen_addr: String,
    /// Interval between anti-entropy cycles per peer.
    pub sync_interval: Duration,
    /// A peer producing no traffic for this long is marked disconnected.
    pub offer_timeout: Duration,
    /// How long tombstones are retained before garbage collection.
    pub tombstone_grace: Duration,
    /// Interval of the tombstone garbage-collection sweep.
    pub gc_interval: Duration,
    /// Interval between attempts to dial peers that are not connected.
    pub reconnect_interval: Duration,
    /// Interval between cluster-join attempts while the node has no
    /// registry record.
    pub bootstrap_retry: Duration,
    /// Transport settings for peer connections.
    pub transport: TransportConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6642".to_string(),
            sync_interval: Duration::from_secs(5),
            offer_timeout: Duration::from_secs(15),
            tombstone_grace: Duration::from_secs(600),
            gc_interval: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(5),
            bootstrap_retry: Duration::from_secs(5),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct SyncStatsInner {
    offers_sent: AtomicU64,
    offers_received: AtomicU64,
    requests_sent: AtomicU64,
    requests_received: AtomicU64,
    values_sent: AtomicU64,
    values_received: AtomicU64,
    pushes_sent: AtomicU64,
    keys_applied: AtomicU64,
    auth_failures: AtomicU64,
    sync_errors: AtomicU64,
    joins_served: AtomicU64,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Offer messages sent.
    pub offers_sent: u64,
    /// Offer messages received.
    pub offers_received: u64,
    /// Value requests sent.
    pub requests_sent: u64,
    /// Value requests received.
    pub requests_received: u64,
    /// Value messages sent (cycle replies).
    pub values_sent: u64,
    /// Value messages received.
    pub values_received: u64,
    /// Out-of-cycle pushes delivered.
    pub pushes_sent: u64,
    /// Keys whose local state changed from remote values.
    pub keys_applied: u64,
    /// Handshakes that failed authentication.
    pub auth_failures: u64,
    /// Messages that failed to decode or apply.
    pub sync_errors: u64,
    /// Cluster joins served to bootstrapping nodes.
    pub joins_served: u64,
}

struct Peer {
    conn: Arc<Connection>,
    auth_epoch: u64,
}

/// The peer-to-peer synchronization engine for one service instance.
pub struct SyncEngine {
    config: SyncConfig,
    transport: Transport,
    registry: Arc<StoreRegistry>,
    membership: Arc<Membership>,
    security: Arc<ClusterSecurityManager>,
    peers: DashMap<NodeId, Peer>,
    dialing: DashMap<NodeId, ()>,
    transaction_id: AtomicU64,
    stats: SyncStatsInner,
    shutdown: watch::Sender<bool>,
}

impl SyncEngine {
    /// Create the engine. Nothing runs until [`SyncEngine::start`].
    pub fn new(
        config: SyncConfig,
        registry: Arc<StoreRegistry>,
        membership: Arc<Membership>,
        security: Arc<ClusterSecurityManager>,
    ) -> Arc<Self> {
        let transport = Transport::new(config.transport.clone());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            transport,
            registry,
            membership,
            security,
            peers: DashMap::new(),
            dialing: DashMap::new(),
            transaction_id: AtomicU64::new(1),
            stats: SyncStatsInner::default(),
            shutdown,
        })
    }

    /// Current engine counters.
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            offers_sent: self.stats.offers_sent.load(Ordering::Relaxed),
            offers_received: self.stats.offers_received.load(Ordering::Relaxed),
            requests_sent: self.stats.requests_sent.load(Ordering::Relaxed),
            requests_received: self.stats.requests_received.load(Ordering::Relaxed),
            values_sent: self.stats.values_sent.load(Ordering::Relaxed),
            values_received: self.stats.values_received.load(Ordering::Relaxed),
            pushes_sent: self.stats.pushes_sent.load(Ordering::Relaxed),
            keys_applied: self.stats.keys_applied.load(Ordering::Relaxed),
            auth_failures: self.stats.auth_failures.load(Ordering::Relaxed),
            sync_errors: self.stats.sync_errors.load(Ordering::Relaxed),
            joins_served: self.stats.joins_served.load(Ordering::Relaxed),
        }
    }

    /// Node ids with a live authenticated connection.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| *p.key()).collect()
    }

    /// Bind the cluster listener and spawn the engine's background tasks.
    /// Returns the bound address (useful when listening on port 0).
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = self.transport.listen(&self.config.listen_addr).await?;
        let addr = listener.local_addr();
        info!(%addr, "cluster synchronization engine listening");

        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(self.clone().dial_loop());
        tokio::spawn(self.clone().push_loop(self.registry.subscribe()));
        tokio::spawn(self.clone().gc_loop());
        tokio::spawn(self.clone().bootstrap_loop());
        Ok(addr)
    }

    /// Stop all engine tasks and drop every peer connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.peers.clear();
    }

    fn header(&self) -> MessageHeader {
        MessageHeader {
            source_node: self.membership.local_node_id(),
            transaction_id: self.transaction_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    async fn send(&self, conn: &Connection, msg: &SyncMessage) -> Result<()> {
        conn.send_payload(msg.encode()?).await?;
        Ok(())
    }

    // Connection lifecycle ------------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        let engine = self.clone();
                        tokio::spawn(async move { engine.handle_inbound(conn).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, conn: Connection) {
        let secret = match self.security.current_secret() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cluster secret unavailable; refusing inbound connection");
                return;
            }
        };
        let outcome = handshake::respond(
            &conn,
            self.membership.local_node_id(),
            self.security.scheme(),
            secret.as_ref().map(|s| s.as_bytes()),
        )
        .await;
        match outcome {
            Ok(outcome) => match outcome.peer_node_id {
                Some(node_id) => self.install_peer(node_id, Arc::new(conn)),
                // A peer without a node id is bootstrapping; serve its join
                // conversation without registering it as a member.
                None => self.serve_bootstrap(conn).await,
            },
            Err(e) => {
                self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                debug!(peer = conn.peer_addr(), error = %e, "inbound handshake failed");
            }
        }
    }

    async fn serve_bootstrap(&self, conn: Connection) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let payload = tokio::select! {
                _ = shutdown.changed() => break,
                payload = conn.recv_payload() => payload,
            };
            let payload = match payload {
                Ok(p) => p,
                Err(_) => break,
            };
            match SyncMessage::decode(&payload) {
                Ok(msg) => {
                    if let Err(e) = self.handle_message(msg, &conn).await {
                        debug!(peer = conn.peer_addr(), error = %e, "bootstrap message failed");
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = conn.peer_addr(), error = %e, "undecodable bootstrap message");
                    break;
                }
            }
        }
    }

    fn install_peer(self: &Arc<Self>, node_id: NodeId, conn: Arc<Connection>) {
        if *self.shutdown.borrow() {
            return;
        }
        let peer = Peer {
            conn: conn.clone(),
            auth_epoch: self.security.auth_epoch(),
        };
        if self.peers.insert(node_id, peer).is_some() {
            debug!(node_id, "replacing existing connection to peer");
        }
        self.membership.peer_connected(node_id);
        tokio::spawn(self.clone().read_loop(node_id, conn.clone()));
        tokio::spawn(self.clone().cycle_loop(node_id, conn));
    }

    fn is_current(&self, node_id: NodeId, conn: &Arc<Connection>) -> bool {
        self.peers
            .get(&node_id)
            .map(|p| Arc::ptr_eq(&p.conn, conn))
            .unwrap_or(false)
    }

    fn drop_peer(&self, node_id: NodeId, conn: &Arc<Connection>) {
        let removed = self
            .peers
            .remove_if(&node_id, |_, p| Arc::ptr_eq(&p.conn, conn))
            .is_some();
        if removed {
            self.membership.peer_disconnected(node_id);
        }
    }

    async fn read_loop(self: Arc<Self>, node_id: NodeId, conn: Arc<Connection>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let payload = tokio::select! {
                _ = shutdown.changed() => break,
                payload = conn.recv_payload() => payload,
            };
            match payload {
                Ok(bytes) => match SyncMessage::decode(&bytes) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, &conn).await {
                            self.stats.sync_errors.fetch_add(1, Ordering::Relaxed);
                            debug!(node_id, error = %e, "sync message failed; will retry next cycle");
                        }
                    }
                    Err(e) => {
                        self.stats.sync_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(node_id, error = %e, "undecodable sync message dropped");
                    }
                },
                Err(e) => {
                    debug!(node_id, error = %e, "peer connection lost");
                    break;
                }
            }
        }
        self.drop_peer(node_id, &conn);
    }

    async fn cycle_loop(self: Arc<Self>, node_id: NodeId, conn: Arc<Connection>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            if !self.is_current(node_id, &conn) {
                return;
            }
            let epoch = self.peers.get(&node_id).map(|p| p.auth_epoch);
            if epoch != Some(self.security.auth_epoch()) {
                info!(node_id, "authentication reconfigured; dropping connection for re-handshake");
                self.drop_peer(node_id, &conn);
                return;
            }
            if conn.idle_for() > self.config.offer_timeout {
                warn!(node_id, "peer silent past the offer timeout; marking disconnected");
                self.drop_peer(node_id, &conn);
                return;
            }
            if conn.idle_for() > self.config.transport.heartbeat_interval {
                let _ = conn.send_ping().await;
            }
            if let Err(e) = self.send_offers(&conn).await {
                debug!(node_id, error = %e, "offer cycle failed; dropping peer");
                self.drop_peer(node_id, &conn);
                return;
            }
        }
    }

    async fn dial_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.reconnect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let local_id = match self.membership.local_node_id() {
                Some(id) => id,
                None => continue,
            };
            for node in self.membership.nodes() {
                // The higher node id dials, so exactly one side of every
                // pair initiates and a fresh joiner reaches out to the
                // members it just learned about.
                if node.node_id >= local_id || self.membership.is_connected(node.node_id) {
                    continue;
                }
                if self.dialing.insert(node.node_id, ()).is_some() {
                    continue;
                }
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.connect_peer(&node).await;
                    engine.dialing.remove(&node.node_id);
                });
            }
        }
    }

    async fn connect_peer(self: &Arc<Self>, node: &ClusterNode) {
        let secret = match self.security.current_secret() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cluster secret unavailable; cannot dial peers");
                return;
            }
        };
        let conn = match self.transport.connect(&node.addr()).await {
            Ok(c) => c,
            Err(e) => {
                trace!(node_id = node.node_id, addr = %node.addr(), error = %e, "dial failed");
                return;
            }
        };
        let outcome = handshake::initiate(
            &conn,
            self.membership.local_node_id(),
            self.security.scheme(),
            secret.as_ref().map(|s| s.as_bytes()),
        )
        .await;
        match outcome {
            Ok(outcome) if outcome.peer_node_id == Some(node.node_id) => {
                self.install_peer(node.node_id, Arc::new(conn));
            }
            Ok(outcome) => {
                warn!(
                    expected = node.node_id,
                    got = ?outcome.peer_node_id,
                    "peer identified with an unexpected node id; dropping connection"
                );
            }
            Err(e) => {
                self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                debug!(node_id = node.node_id, error = %e, "handshake with peer failed");
            }
        }
    }

    // Anti-entropy cycle --------------------------------------------------

    async fn send_offers(&self, conn: &Connection) -> Result<()> {
        for store in self.registry.global_stores() {
            let offers = build_offers(&store);
            if offers.is_empty() {
                continue;
            }
            let msg = SyncMessage::SyncOffer {
                header: self.header(),
                store: store.descriptor().clone(),
                offers,
            };
            self.send(conn, &msg).await?;
            self.stats.offers_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn lookup_store(&self, wanted: &crate::store::StoreRef) -> Option<Arc<Store>> {
        match self.registry.get_store(&wanted.name) {
            Ok(store) if store.descriptor() == wanted => Some(store),
            Ok(store) => {
                debug!(
                    store = %wanted.name,
                    wanted_scope = ?wanted.scope,
                    local_scope = ?store.scope(),
                    "peer referenced a store with a conflicting descriptor; refused"
                );
                None
            }
            Err(_) => {
                debug!(store = %wanted.name, "peer referenced a store this node does not carry");
                None
            }
        }
    }

    async fn handle_message(&self, msg: SyncMessage, conn: &Connection) -> Result<()> {
        match msg {
            SyncMessage::SyncOffer { store, offers, .. } => {
                self.stats.offers_received.fetch_add(1, Ordering::Relaxed);
                let local = match self.lookup_store(&store) {
                    Some(s) if s.scope() == Scope::Global => s,
                    _ => return Ok(()),
                };
                let keys = keys_wanted(&local, &offers);
                if keys.is_empty() {
                    return Ok(());
                }
                let reply = SyncMessage::SyncRequest {
                    header: self.header(),
                    store,
                    keys,
                };
                self.send(conn, &reply).await?;
                self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
            }
            SyncMessage::SyncRequest { store, keys, .. } => {
                self.stats.requests_received.fetch_add(1, Ordering::Relaxed);
                let local = match self.lookup_store(&store) {
                    Some(s) => s,
                    None => return Ok(()),
                };
                let values = collect_values(&local, &keys, local.scope() == Scope::Global);
                if values.is_empty() {
                    return Ok(());
                }
                let reply = SyncMessage::SyncValue {
                    header: self.header(),
                    store,
                    values,
                };
                self.send(conn, &reply).await?;
                self.stats.values_sent.fetch_add(1, Ordering::Relaxed);
            }
            SyncMessage::SyncValue { store, values, .. } => {
                self.stats.values_received.fetch_add(1, Ordering::Relaxed);
                let local = match self.lookup_store(&store) {
                    Some(s) => s,
                    None => return Ok(()),
                };
                self.apply_values(&local, values);
            }
            SyncMessage::JoinRequest {
                node_id,
                hostname,
                port,
                ..
            } => {
                self.serve_join(node_id, hostname, port, conn).await?;
            }
            SyncMessage::JoinResponse { .. } => {
                warn!("unsolicited join response dropped");
            }
        }
        Ok(())
    }

    fn apply_values(&self, store: &Store, values: Vec<KeyedValues>) {
        match store.scope() {
            Scope::Global => {
                for kv in values {
                    let retained = kv.values.into_iter().map(WireValue::into_retained).collect();
                    if store.apply_sync_values(&kv.key, retained) {
                        self.stats.keys_applied.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Scope::Unsynchronized => {
                for kv in values {
                    let value = kv.values.into_iter().next_back().and_then(|v| v.value);
                    store.apply_unsync_value(&kv.key, value);
                    self.stats.keys_applied.fetch_add(1, Ordering::Relaxed);
                }
            }
            Scope::Local => {
                debug!(store = store.name(), "peer shipped values for a local-scope store; ignored");
            }
        }
    }

    // Cluster join --------------------------------------------------------

    async fn serve_join(
        &self,
        node_id: Option<NodeId>,
        hostname: String,
        port: u16,
        conn: &Connection,
    ) -> Result<()> {
        // A rejoining node keeps its id; a fresh one gets the next free id
        // above every currently-known member. A new node starts in its own
        // single-node domain until an administrator moves it.
        let assigned = match node_id {
            Some(id) => id,
            None => self.allocate_node_id(),
        };
        let domain_id = self
            .membership
            .node(assigned)
            .map(|n| n.domain_id)
            .unwrap_or(assigned);
        self.membership.add_node(ClusterNode {
            node_id: assigned,
            domain_id,
            hostname,
            port,
        })?;

        let store = self.registry.get_store(SYSTEM_NODE_STORE)?;
        let node_store = collect_values(&store, &store.list_keys(), true);
        let reply = SyncMessage::JoinResponse {
            header: self.header(),
            assigned_node_id: assigned,
            node_store,
        };
        self.send(conn, &reply).await?;
        self.stats.joins_served.fetch_add(1, Ordering::Relaxed);
        info!(node_id = assigned, "cluster join served");
        Ok(())
    }

    fn allocate_node_id(&self) -> NodeId {
        self.membership
            .nodes()
            .into_iter()
            .map(|n| n.node_id)
            .max()
            .map(|max| max + 1)
            .unwrap_or(1)
    }

    async fn bootstrap_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.bootstrap_retry);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            // A node with a live registry record needs no bootstrap; after
            // a reseed the record is gone and the join path re-runs.
            let joined = self
                .membership
                .local_node_id()
                .map(|id| self.membership.node(id).is_some())
                .unwrap_or(false);
            if joined {
                continue;
            }
            let seeds = self.membership.seeds();
            if seeds.is_empty() {
                continue;
            }
            match self.join_cluster(&seeds).await {
                Ok(node_id) => info!(node_id, "cluster bootstrap complete"),
                Err(e) => debug!(error = %e, "cluster bootstrap attempt failed; retrying"),
            }
        }
    }

    /// Try to join the cluster through each seed in turn. Returns the
    /// node id assigned (or confirmed) by the first seed that answers.
    pub async fn join_cluster(&self, seeds: &[String]) -> Result<NodeId> {
        let mut last_err = SyncError::Configuration {
            msg: "no discovery seeds configured".to_string(),
        };
        for seed in seeds {
            match self.try_join(seed).await {
                Ok(node_id) => return Ok(node_id),
                Err(e) => {
                    debug!(seed = %seed, error = %e, "seed did not serve the join");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn try_join(&self, seed: &str) -> Result<NodeId> {
        let locals: crate::store::StoreClient<String, String> =
            self.registry.client(SYSTEM_LOCAL_STORE)?;
        let hostname = locals
            .get_value(&LOCAL_NODE_HOSTNAME.to_string())?
            .ok_or_else(|| SyncError::Configuration {
                msg: "local node hostname not configured; cannot join".to_string(),
            })?;
        let port: u16 = locals
            .get_value(&LOCAL_NODE_PORT.to_string())?
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| SyncError::Configuration {
                msg: "local node port not configured; cannot join".to_string(),
            })?;

        let secret = self.security.current_secret()?;
        let conn = self.transport.connect(seed).await?;
        handshake::initiate(
            &conn,
            self.membership.local_node_id(),
            self.security.scheme(),
            secret.as_ref().map(|s| s.as_bytes()),
        )
        .await?;

        let request = SyncMessage::JoinRequest {
            header: self.header(),
            node_id: self.membership.local_node_id(),
            hostname,
            port,
        };
        self.send(&conn, &request).await?;

        let deadline = tokio::time::Instant::now() + self.config.offer_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let reply = tokio::time::timeout(remaining, conn.recv_payload())
                .await
                .map_err(|_| {
                    SyncError::Transport(TransportError::ConnectionTimeout {
                        addr: seed.to_string(),
                        timeout_ms: self.config.offer_timeout.as_millis() as u64,
                    })
                })??;
            match SyncMessage::decode(&reply)? {
                SyncMessage::JoinResponse {
                    assigned_node_id,
                    node_store,
                    ..
                } => {
                    let store = self.registry.get_store(SYSTEM_NODE_STORE)?;
                    for kv in node_store {
                        let retained =
                            kv.values.into_iter().map(WireValue::into_retained).collect();
                        store.apply_sync_values(&kv.key, retained);
                    }
                    self.registry.local_node().set(assigned_node_id);
                    locals.put(&LOCAL_NODE_ID.to_string(), &assigned_node_id.to_string())?;
                    info!(node_id = assigned_node_id, seed, "joined cluster through seed");
                    return Ok(assigned_node_id);
                }
                // A member that kept us as a live peer across a rejoin may
                // interleave regular cycle traffic before the join answer.
                other => {
                    trace!(message = ?other, "ignoring sync traffic while awaiting join answer");
                }
            }
        }
    }

    // Out-of-cycle propagation --------------------------------------------

    async fn push_loop(self: Arc<Self>, mut events: broadcast::Receiver<StoreEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) if event.origin == UpdateOrigin::Local => {
                    self.push_update(event).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Pushes are a latency optimization; the periodic cycle
                    // covers whatever was missed.
                    debug!(skipped, "push loop lagged behind store events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn push_update(&self, event: StoreEvent) {
        let store = match self.registry.get_store(&event.store.name) {
            Ok(s) => s,
            Err(_) => return,
        };
        let versioned = match store.scope() {
            Scope::Local => return,
            Scope::Global => true,
            Scope::Unsynchronized => false,
        };
        let values = collect_values(&store, std::slice::from_ref(&event.key), versioned);
        if values.is_empty() {
            return;
        }
        let msg = SyncMessage::SyncValue {
            header: self.header(),
            store: store.descriptor().clone(),
            values,
        };
        let payload = match msg.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode push");
                return;
            }
        };
        // Snapshot the connection set so no map shard stays locked across
        // the sends.
        let conns: Vec<(NodeId, Arc<Connection>)> = self
            .peers
            .iter()
            .map(|p| (*p.key(), p.conn.clone()))
            .collect();
        for (node_id, conn) in conns {
            match conn.send_payload(payload.clone()).await {
                Ok(()) => {
                    self.stats.pushes_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    trace!(node_id, error = %e, "push failed; next cycle catches up");
                }
            }
        }
    }

    async fn gc_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.gc_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.registry.purge_tombstones(self.config.tombstone_grace);
        }
    }
}

/// Per-key version digests for one store: every retained entry's clock,
/// tombstones included so deletions gossip too.
fn build_offers(store: &Store) -> Vec<KeyedVersions> {
    store
        .list_keys()
        .into_iter()
        .filter_map(|key| {
            let versions = store.get_versions(&key);
            if versions.is_empty() {
                return None;
            }
            Some(KeyedVersions { key, versions })
        })
        .collect()
}

/// Keys from an offer worth requesting: any offered clock that is not
/// dominated by (or equal to) a locally retained sibling is news.
fn keys_wanted(store: &Store, offers: &[KeyedVersions]) -> Vec<Vec<u8>> {
    offers
        .iter()
        .filter(|offer| {
            let held = store.get_versions(&offer.key);
            offer.versions.iter().any(|v| !v.dominated_by_any(&held))
        })
        .map(|offer| offer.key.clone())
        .collect()
}

/// Wire payloads for the requested keys. Keys with nothing retained are
/// skipped; `versioned` controls whether clocks travel.
fn collect_values(store: &Store, keys: &[Vec<u8>], versioned: bool) -> Vec<KeyedValues> {
    keys.iter()
        .filter_map(|key| {
            let retained = store.get_retained(key);
            if retained.is_empty() {
                return None;
            }
            Some(KeyedValues {
                key: key.clone(),
                values: retained
                    .iter()
                    .map(|entry| WireValue::from_retained(entry, versioned))
                    .collect(),
            })
        })
        .collect()
}
