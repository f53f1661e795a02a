use thiserror::Error;

/// Errors raised by the cluster transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection attempt timed out.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address that was being dialed.
        addr: String,
        /// Configured connect timeout.
        timeout_ms: u64,
    },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Frame carried an unexpected magic number.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Magic number this build speaks.
        expected: u32,
        /// Magic number found on the wire.
        got: u32,
    },

    /// Frame protocol version is not supported.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Supported protocol version.
        expected: u8,
        /// Version found on the wire.
        got: u8,
    },

    /// Frame payload checksum did not match.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// Checksum carried in the frame header.
        expected: u32,
        /// Checksum computed over the received payload.
        computed: u32,
    },

    /// Frame payload exceeds the configured maximum.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Payload length announced by the header.
        size: u32,
        /// Maximum accepted payload length.
        max_size: u32,
    },

    /// Peer failed the authentication handshake.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected {
        /// Human-readable rejection reason.
        reason: String,
    },

    /// A message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transport result alias.
pub type Result<T> = std::result::Result<T, TransportError>;
