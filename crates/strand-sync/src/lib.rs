#![warn(missing_docs)]

//! Strand cluster synchronization subsystem.
//!
//! A vector-clock-versioned, multi-master replicated key/value layer for
//! controller clusters: scoped stores, anti-entropy gossip between peers,
//! node membership tracking, per-domain leader election and secret-based
//! peer authentication. Convergence rests on a single merge primitive
//! (the sibling reconciliation rule in [`versioned`]) being commutative,
//! associative and idempotent, so message loss, reordering and duplicate
//! delivery are all safe.

pub mod election;
pub mod engine;
pub mod error;
pub mod membership;
pub mod proto;
pub mod security;
pub mod store;
pub mod version;
pub mod versioned;

pub use election::{DomainLeaderElection, ElectionState, LeaderEvent};
pub use engine::{SyncConfig, SyncEngine, SyncStats};
pub use error::{Result, SyncError};
pub use membership::{ClusterNode, Membership, MembershipEvent};
pub use security::{AuthInfo, AuthScheme, ClusterSecret, ClusterSecurityManager};
pub use store::{LocalNodeId, Scope, Store, StoreClient, StoreRef, StoreRegistry};
pub use version::{ClockEntry, DomainId, NodeId, Occurred, VectorClock};
pub use versioned::{Versioned, VersionedValue};
