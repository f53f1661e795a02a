//! Peer authentication handshake.
//!
//! Before a connection carries any synchronization traffic, both ends run
//! a mutual HMAC-SHA256 challenge/response keyed by the cluster's shared
//! secret (or exchange a bare hello when the cluster runs without
//! authentication). A failed handshake closes the connection; it is
//! reported to the caller as [`TransportError::HandshakeRejected`] and
//! never escalates beyond marking the peer disconnected.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::message::{Accept, Challenge, ChallengeReply, ControlMessage, Hello, Reject};

type HmacSha256 = Hmac<Sha256>;

/// Peer authentication scheme for cluster connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthScheme {
    /// No authentication; any peer may connect.
    NoAuth,
    /// Mutual challenge/response proving possession of the cluster secret.
    #[default]
    SharedSecret,
}

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthScheme::NoAuth => write!(f, "no-auth"),
            AuthScheme::SharedSecret => write!(f, "shared-secret"),
        }
    }
}

impl std::str::FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "no-auth" => Ok(AuthScheme::NoAuth),
            "shared-secret" => Ok(AuthScheme::SharedSecret),
            other => Err(format!("unknown auth scheme: {other}")),
        }
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Node id the peer identified itself with; None for a peer that has
    /// not yet joined the cluster.
    pub peer_node_id: Option<u16>,
}

/// Compute the HMAC-SHA256 proof for a challenge.
fn proof_for(secret: &[u8], challenge: &[u8; 32]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    let out = mac.finalize().into_bytes();
    let mut proof = [0u8; 32];
    proof.copy_from_slice(&out);
    proof
}

/// Verify a proof in constant time.
fn verify_proof(secret: &[u8], challenge: &[u8; 32], proof: &[u8; 32]) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.verify_slice(proof).is_ok()
}

fn fresh_challenge() -> [u8; 32] {
    let mut challenge = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut challenge);
    challenge
}

fn require_secret(secret: Option<&[u8]>) -> Result<&[u8]> {
    secret.ok_or_else(|| TransportError::HandshakeRejected {
        reason: "shared-secret scheme configured but no secret available".to_string(),
    })
}

async fn reject(conn: &Connection, reason: &str) -> Result<()> {
    conn.send_control(&ControlMessage::Reject(Reject {
        reason: reason.to_string(),
    }))
    .await
}

/// Run the dialing side of the handshake.
pub async fn initiate(
    conn: &Connection,
    local_node_id: Option<u16>,
    scheme: AuthScheme,
    secret: Option<&[u8]>,
) -> Result<HandshakeOutcome> {
    let challenge = fresh_challenge();
    conn.send_control(&ControlMessage::Hello(Hello {
        node_id: local_node_id,
        scheme,
        challenge,
    }))
    .await?;

    match scheme {
        AuthScheme::NoAuth => match conn.recv_control().await? {
            ControlMessage::Accept(Accept { node_id }) => {
                Ok(HandshakeOutcome { peer_node_id: node_id })
            }
            ControlMessage::Reject(r) => Err(TransportError::HandshakeRejected { reason: r.reason }),
            other => Err(unexpected(&other)),
        },
        AuthScheme::SharedSecret => {
            let secret = require_secret(secret)?;
            let peer_challenge = match conn.recv_control().await? {
                ControlMessage::Challenge(c) => {
                    if !verify_proof(secret, &challenge, &c.proof) {
                        reject(conn, "challenge proof mismatch").await?;
                        return Err(TransportError::HandshakeRejected {
                            reason: "peer failed our challenge".to_string(),
                        });
                    }
                    c.challenge
                }
                ControlMessage::Reject(r) => {
                    return Err(TransportError::HandshakeRejected { reason: r.reason })
                }
                other => return Err(unexpected(&other)),
            };

            conn.send_control(&ControlMessage::ChallengeReply(ChallengeReply {
                proof: proof_for(secret, &peer_challenge),
            }))
            .await?;

            match conn.recv_control().await? {
                ControlMessage::Accept(Accept { node_id }) => {
                    debug!(peer = ?node_id, "handshake complete");
                    Ok(HandshakeOutcome { peer_node_id: node_id })
                }
                ControlMessage::Reject(r) => Err(TransportError::HandshakeRejected { reason: r.reason }),
                other => Err(unexpected(&other)),
            }
        }
    }
}

/// Run the accepting side of the handshake.
pub async fn respond(
    conn: &Connection,
    local_node_id: Option<u16>,
    scheme: AuthScheme,
    secret: Option<&[u8]>,
) -> Result<HandshakeOutcome> {
    let hello = match conn.recv_control().await? {
        ControlMessage::Hello(h) => h,
        other => return Err(unexpected(&other)),
    };

    if hello.scheme != scheme {
        reject(conn, &format!("auth scheme mismatch: peer offered {}", hello.scheme)).await?;
        return Err(TransportError::HandshakeRejected {
            reason: format!("peer offered {} but local scheme is {}", hello.scheme, scheme),
        });
    }

    match scheme {
        AuthScheme::NoAuth => {
            conn.send_control(&ControlMessage::Accept(Accept {
                node_id: local_node_id,
            }))
            .await?;
            Ok(HandshakeOutcome {
                peer_node_id: hello.node_id,
            })
        }
        AuthScheme::SharedSecret => {
            let secret = require_secret(secret)?;
            let challenge = fresh_challenge();
            conn.send_control(&ControlMessage::Challenge(Challenge {
                proof: proof_for(secret, &hello.challenge),
                challenge,
            }))
            .await?;

            match conn.recv_control().await? {
                ControlMessage::ChallengeReply(reply) => {
                    if !verify_proof(secret, &challenge, &reply.proof) {
                        reject(conn, "challenge proof mismatch").await?;
                        return Err(TransportError::HandshakeRejected {
                            reason: "peer failed our challenge".to_string(),
                        });
                    }
                }
                ControlMessage::Reject(r) => {
                    return Err(TransportError::HandshakeRejected { reason: r.reason })
                }
                other => return Err(unexpected(&other)),
            }

            conn.send_control(&ControlMessage::Accept(Accept {
                node_id: local_node_id,
            }))
            .await?;
            debug!(peer = ?hello.node_id, "handshake complete");
            Ok(HandshakeOutcome {
                peer_node_id: hello.node_id,
            })
        }
    }
}

fn unexpected(msg: &ControlMessage) -> TransportError {
    TransportError::HandshakeRejected {
        reason: format!("unexpected handshake message: {msg:?}"),
    }
}
