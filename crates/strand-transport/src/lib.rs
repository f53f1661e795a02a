#![warn(missing_docs)]

//! Strand transport subsystem: framed cluster RPC over TCP with peer
//! handshake and authentication.
//!
//! The transport carries opaque payload frames between cluster nodes. A
//! connection is not released to the synchronization layer until the
//! handshake in [`handshake`] has proven that both ends hold the same
//! cluster secret (or the cluster runs with authentication disabled).

pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use connection::{Connection, Listener, Transport, TransportConfig};
pub use error::{Result, TransportError};
pub use frame::{Frame, FrameFlags, FrameHeader};
pub use handshake::{AuthScheme, HandshakeOutcome};
