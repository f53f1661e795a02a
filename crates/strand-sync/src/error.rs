//! Error types for the cluster synchronization subsystem.

use thiserror::Error;

use crate::version::NodeId;

/// Errors that can occur in the synchronization subsystem.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed configuration, rejected at the administrative boundary.
    #[error("configuration error: {msg}")]
    Configuration {
        /// Description of the invalid configuration.
        msg: String,
    },

    /// Peer authentication failed during connection setup.
    #[error("authentication failed: {reason}")]
    Authentication {
        /// Description of the handshake failure.
        reason: String,
    },

    /// A node id was not found in the cluster node registry.
    #[error("node {node_id} not found in cluster")]
    NodeNotFound {
        /// The missing node id.
        node_id: NodeId,
    },

    /// A store name was not registered.
    #[error("unknown store: {name}")]
    UnknownStore {
        /// The store name that was requested.
        name: String,
    },

    /// A store was re-registered with a different scope or persistence.
    #[error("store {name} already registered with a different descriptor")]
    StoreConflict {
        /// The conflicting store name.
        name: String,
    },

    /// An optimistic write carried a version that is not newer than the
    /// currently stored siblings.
    #[error("write version is obsolete for key")]
    ObsoleteVersion,

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] strand_transport::TransportError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Synchronization result alias.
pub type Result<T> = std::result::Result<T, SyncError>;
