//! Wire messages for the anti-entropy protocol.
//!
//! One tagged enum covers the whole sync conversation; payloads reference
//! a store by its name/scope/persist triple so either end can refuse a
//! store it does not carry. Messages are bincode-encoded into transport
//! payload frames.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::store::StoreRef;
use crate::version::{NodeId, VectorClock};
use crate::versioned::VersionedValue;

/// Header carried by every sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Node that produced the message; None while the sender has not yet
    /// joined the cluster.
    pub source_node: Option<NodeId>,
    /// Per-sender transaction id for log correlation.
    pub transaction_id: u64,
}

/// Per-key version digests carried by an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedVersions {
    /// The offered key.
    pub key: Vec<u8>,
    /// Clocks of every retained sibling, tombstones included.
    pub versions: Vec<VectorClock>,
}

/// One versioned payload on the wire. Global stores carry the clock;
/// unsynchronized stores carry raw values with no clock. A missing value
/// is a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireValue {
    /// Vector clock of the write; None for unsynchronized stores.
    pub version: Option<VectorClock>,
    /// The bytes, or None for a tombstone.
    pub value: Option<Vec<u8>>,
}

impl WireValue {
    /// Wire form of a retained entry. `versioned` controls whether the
    /// clock travels (Global) or is stripped (Unsynchronized).
    pub fn from_retained(entry: &VersionedValue, versioned: bool) -> Self {
        Self {
            version: versioned.then(|| entry.version.clone()),
            value: entry.value.clone(),
        }
    }

    /// Convert back into a retained entry. A value arriving without a
    /// clock lands with the empty clock, which any local write dominates.
    pub fn into_retained(self) -> VersionedValue {
        VersionedValue {
            version: self.version.unwrap_or_default(),
            value: self.value,
            tombstoned_at_ms: None,
        }
    }
}

/// A key together with all sibling payloads being shipped for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedValues {
    /// The key.
    pub key: Vec<u8>,
    /// One or more sibling payloads.
    pub values: Vec<WireValue>,
}

/// The sync conversation, one tagged variant per message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Per-key version digests for one store (the gossip opener).
    SyncOffer {
        /// Message header.
        header: MessageHeader,
        /// Store the offer describes.
        store: StoreRef,
        /// Digest per locally-known key.
        offers: Vec<KeyedVersions>,
    },
    /// Keys whose values the receiver of an offer wants shipped.
    SyncRequest {
        /// Message header.
        header: MessageHeader,
        /// Store the request is against.
        store: StoreRef,
        /// Keys to ship.
        keys: Vec<Vec<u8>>,
    },
    /// Versioned payloads for one store.
    SyncValue {
        /// Message header.
        header: MessageHeader,
        /// Store the values belong to.
        store: StoreRef,
        /// Key/value payloads.
        values: Vec<KeyedValues>,
    },
    /// A node asking to join the cluster through this peer.
    JoinRequest {
        /// Message header.
        header: MessageHeader,
        /// Node id to keep across a reseed; None to allocate a fresh one.
        node_id: Option<NodeId>,
        /// Hostname the joiner advertises.
        hostname: String,
        /// Cluster port the joiner listens on.
        port: u16,
    },
    /// Join grant: the assigned id plus a full node-store dump.
    JoinResponse {
        /// Message header.
        header: MessageHeader,
        /// Id the joiner must adopt.
        assigned_node_id: NodeId,
        /// Full dump of the system node store.
        node_store: Vec<KeyedValues>,
    },
}

impl SyncMessage {
    /// The message header.
    pub fn header(&self) -> &MessageHeader {
        match self {
            SyncMessage::SyncOffer { header, .. }
            | SyncMessage::SyncRequest { header, .. }
            | SyncMessage::SyncValue { header, .. }
            | SyncMessage::JoinRequest { header, .. }
            | SyncMessage::JoinResponse { header, .. } => header,
        }
    }

    /// Encode for a transport payload frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode from a transport payload frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}
