//! Per-domain leader election.
//!
//! Each election domain independently selects one leader from its
//! currently-connected members: the node with the numerically smallest id.
//! The scheme is deterministic and exchanges no messages beyond the
//! membership view every node already holds, so it reconverges
//! automatically on every membership change. It is a local-view scheme,
//! not a consensus protocol: under a network partition each side of the
//! split can elect its own leader. That is an accepted trade-off of this
//! protocol class, documented rather than defended against.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::membership::{Membership, MembershipEvent};
use crate::version::{DomainId, NodeId};

/// Election outcome for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionState {
    /// The domain this state describes.
    pub domain_id: DomainId,
    /// Current leader; None only while the domain has no connected
    /// members.
    pub leader_id: Option<NodeId>,
    /// Incremented on every leader change.
    pub epoch: u64,
}

/// Broadcast on every leader change (the notify-leader/notify-follower
/// contract for interested subsystems).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderEvent {
    /// The domain whose leader changed.
    pub domain_id: DomainId,
    /// The new leader, if any.
    pub leader_id: Option<NodeId>,
    /// Election epoch of the change.
    pub epoch: u64,
}

/// Per-domain leader election driven by membership events.
pub struct DomainLeaderElection {
    membership: Arc<Membership>,
    states: DashMap<DomainId, ElectionState>,
    pinned: DashMap<DomainId, NodeId>,
    events: broadcast::Sender<LeaderEvent>,
}

impl DomainLeaderElection {
    /// Create the election service over a membership view.
    pub fn new(membership: Arc<Membership>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            membership,
            states: DashMap::new(),
            pinned: DashMap::new(),
            events,
        })
    }

    /// Subscribe to leader-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaderEvent> {
        self.events.subscribe()
    }

    /// The current leader of a domain; None when the domain has no
    /// connected members (or no election has run for it yet).
    pub fn domain_leader(&self, domain_id: DomainId) -> Option<NodeId> {
        self.states.get(&domain_id).and_then(|s| s.leader_id)
    }

    /// The full election state of a domain.
    pub fn state(&self, domain_id: DomainId) -> Option<ElectionState> {
        self.states.get(&domain_id).map(|s| *s)
    }

    /// Start a new election for the local node's domain. A rigged
    /// election pins the local node as leader regardless of id ordering;
    /// the pin lasts until the next membership-triggered re-election.
    /// Independent rigs in the same domain resolve last-write-wins.
    pub fn new_election(&self, rigged: bool) -> Result<()> {
        let local = self
            .membership
            .local_node()
            .ok_or_else(|| SyncError::Configuration {
                msg: "local node is not a cluster member".to_string(),
            })?;
        let domain_id = local.domain_id;
        if rigged {
            warn!(
                domain_id,
                node_id = local.node_id,
                "rigged election: pinning local node as domain leader"
            );
            if let Some(previous) = self.pinned.insert(domain_id, local.node_id) {
                if previous != local.node_id {
                    warn!(
                        domain_id,
                        previous, current = local.node_id,
                        "replacing a rigged leader pin (last write wins)"
                    );
                }
            }
        } else {
            self.pinned.remove(&domain_id);
        }
        self.recompute(domain_id);
        Ok(())
    }

    /// Recompute the leader of one domain from the current membership
    /// view.
    fn recompute(&self, domain_id: DomainId) {
        let connected = self.membership.connected_in_domain(domain_id);
        let leader_id = match self.pinned.get(&domain_id) {
            Some(pinned) => Some(*pinned),
            None => connected.iter().min().copied(),
        };

        let mut state = self.states.entry(domain_id).or_insert(ElectionState {
            domain_id,
            leader_id: None,
            epoch: 0,
        });
        if state.leader_id == leader_id {
            return;
        }
        state.leader_id = leader_id;
        state.epoch += 1;
        let event = LeaderEvent {
            domain_id,
            leader_id,
            epoch: state.epoch,
        };
        drop(state);

        match leader_id {
            Some(leader_id) => {
                info!(domain_id, leader_id, epoch = event.epoch, "domain leader elected")
            }
            None => info!(domain_id, "domain has no connected members; leader cleared"),
        }
        let _ = self.events.send(event);
    }

    /// Recompute every known domain, clearing any rigged pins first.
    /// Membership changes always run through here, which is what bounds
    /// the lifetime of a rigged election.
    fn recompute_all_membership_triggered(&self) {
        self.pinned.clear();
        let mut domains: Vec<DomainId> = self
            .membership
            .nodes()
            .into_iter()
            .map(|n| n.domain_id)
            .collect();
        domains.extend(self.states.iter().map(|s| *s.key()));
        domains.sort_unstable();
        domains.dedup();
        for domain_id in domains {
            self.recompute(domain_id);
        }
    }

    /// React to membership events until the channel closes. One instance
    /// of this task runs per service.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<MembershipEvent>) {
        // Establish initial state before the first event arrives.
        self.recompute_all_membership_triggered();
        loop {
            match events.recv().await {
                Ok(MembershipEvent::DomainChanged {
                    old_domain,
                    new_domain,
                    ..
                }) => {
                    self.pinned.clear();
                    self.recompute(old_domain);
                    self.recompute(new_domain);
                }
                Ok(event) => {
                    debug!(?event, "membership change; recomputing elections");
                    self.recompute_all_membership_triggered();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "election reactor lagged; recomputing all domains");
                    self.recompute_all_membership_triggered();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Synchronous variant of the reactor step, used where the caller
    /// already knows membership changed (tests, admin paths).
    pub fn refresh(&self) {
        self.recompute_all_membership_triggered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::ClusterNode;
    use crate::store::{LocalNodeId, StoreRegistry};

    fn member(node_id: NodeId, domain_id: DomainId) -> ClusterNode {
        ClusterNode {
            node_id,
            domain_id,
            hostname: format!("node-{node_id}"),
            port: 6642,
        }
    }

    /// A membership view as seen from `local`, with the given domain
    /// members all connected.
    fn view(local: NodeId, domain: DomainId, members: &[NodeId]) -> Arc<Membership> {
        let registry = Arc::new(StoreRegistry::new(Arc::new(LocalNodeId::assigned(local))));
        let membership = Membership::new(registry);
        membership.initialize_local(member(local, domain)).unwrap();
        for &id in members {
            if id != local {
                membership.add_node(member(id, domain)).unwrap();
                membership.peer_connected(id);
            }
        }
        membership
    }

    #[test]
    fn test_smallest_connected_id_wins() {
        let membership = view(5, 1, &[1, 3, 5]);
        let election = DomainLeaderElection::new(membership);
        election.refresh();
        assert_eq!(election.domain_leader(1), Some(1));
    }

    #[test]
    fn test_reelection_after_leader_disconnect() {
        let membership = view(5, 1, &[1, 3, 5]);
        let election = DomainLeaderElection::new(membership.clone());
        election.refresh();
        assert_eq!(election.domain_leader(1), Some(1));

        membership.peer_disconnected(1);
        election.refresh();
        assert_eq!(election.domain_leader(1), Some(3));
    }

    #[test]
    fn test_rigged_election_pins_local_until_membership_change() {
        let membership = view(5, 1, &[1, 3, 5]);
        let election = DomainLeaderElection::new(membership.clone());
        election.refresh();
        assert_eq!(election.domain_leader(1), Some(1));

        election.new_election(true).unwrap();
        assert_eq!(election.domain_leader(1), Some(5));

        // Any membership-triggered re-election clears the rig.
        membership.peer_connected(9);
        election.refresh();
        assert_eq!(election.domain_leader(1), Some(1));
    }

    #[test]
    fn test_unrigged_new_election_clears_pin() {
        let membership = view(5, 1, &[1, 5]);
        let election = DomainLeaderElection::new(membership);
        election.new_election(true).unwrap();
        assert_eq!(election.domain_leader(1), Some(5));

        election.new_election(false).unwrap();
        assert_eq!(election.domain_leader(1), Some(1));
    }

    #[test]
    fn test_empty_domain_has_no_leader() {
        let membership = view(1, 1, &[1]);
        let election = DomainLeaderElection::new(membership);
        election.refresh();
        assert_eq!(election.domain_leader(42), None);
    }

    #[test]
    fn test_domains_elect_independently() {
        let membership = view(1, 1, &[1]);
        membership.add_node(member(7, 2)).unwrap();
        membership.peer_connected(7);
        let election = DomainLeaderElection::new(membership);
        election.refresh();

        assert_eq!(election.domain_leader(1), Some(1));
        assert_eq!(election.domain_leader(2), Some(7));
    }

    #[test]
    fn test_epoch_increments_on_change() {
        let membership = view(3, 1, &[1, 3]);
        let election = DomainLeaderElection::new(membership.clone());
        election.refresh();
        let first = election.state(1).unwrap();
        assert_eq!(first.leader_id, Some(1));

        membership.peer_disconnected(1);
        election.refresh();
        let second = election.state(1).unwrap();
        assert_eq!(second.leader_id, Some(3));
        assert!(second.epoch > first.epoch);
    }

    #[test]
    fn test_leader_events_emitted() {
        let membership = view(2, 1, &[1, 2]);
        let election = DomainLeaderElection::new(membership);
        let mut rx = election.subscribe();
        election.refresh();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.domain_id, 1);
        assert_eq!(event.leader_id, Some(1));
    }

    #[test]
    fn test_new_election_requires_membership() {
        let registry = Arc::new(StoreRegistry::new(Arc::new(LocalNodeId::unassigned())));
        let membership = Membership::new(registry);
        let election = DomainLeaderElection::new(membership);
        assert!(matches!(
            election.new_election(false),
            Err(SyncError::Configuration { .. })
        ));
    }
}
