//! Transport control messages.
//!
//! Control frames carry the handshake and keepalive traffic that the
//! transport handles itself; everything else is an opaque payload frame
//! owned by the synchronization layer. Messages are serialized with
//! bincode for efficient wire encoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::handshake::AuthScheme;

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::Serialization(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::Serialization(e.to_string()))
}

/// Control messages exchanged on control frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Opening message from the dialing side.
    Hello(Hello),
    /// Server challenge, carrying proof for the client's challenge.
    Challenge(Challenge),
    /// Client proof for the server's challenge.
    ChallengeReply(ChallengeReply),
    /// Handshake accepted; the connection may carry sync traffic.
    Accept(Accept),
    /// Handshake rejected; the connection will be closed.
    Reject(Reject),
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
}

/// Opening handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Node id of the dialing side; None for a node that has not yet
    /// joined the cluster (bootstrap).
    pub node_id: Option<u16>,
    /// Authentication scheme the dialer expects to run.
    pub scheme: AuthScheme,
    /// Random challenge the responder must prove the secret against.
    pub challenge: [u8; 32],
}

/// Responder's proof plus its own challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// HMAC-SHA256 of the dialer's challenge keyed by the cluster secret.
    pub proof: [u8; 32],
    /// Random challenge the dialer must prove the secret against.
    pub challenge: [u8; 32],
}

/// Dialer's proof for the responder's challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeReply {
    /// HMAC-SHA256 of the responder's challenge keyed by the cluster secret.
    pub proof: [u8; 32],
}

/// Successful handshake completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    /// Node id of the accepting side; None while the responder itself is
    /// still bootstrapping.
    pub node_id: Option<u16>,
}

/// Handshake rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    /// Human-readable rejection reason.
    pub reason: String,
}
