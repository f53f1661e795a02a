//! Frame layout for the cluster RPC protocol.
//!
//! Every message travels as one frame: a fixed 14-byte header followed by
//! the payload. The header carries a magic number, the protocol version,
//! control flags, the payload length and a CRC32 of the payload.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TransportError};

/// Frame header size in bytes (magic:4 + version:1 + flags:1 + payload_length:4 + checksum:4).
pub const FRAME_HEADER_SIZE: usize = 14;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0x53545244;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum accepted payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Frame flags for protocol control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    /// Frame is a transport control message (handshake, keepalive) rather
    /// than a synchronization payload.
    pub control: bool,
}

impl FrameFlags {
    /// Flags with no bits set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Convert to raw byte representation.
    pub fn as_u8(&self) -> u8 {
        let mut b = 0u8;
        if self.control {
            b |= 0x01;
        }
        b
    }

    /// Create from raw byte representation.
    pub fn from_u8(b: u8) -> Self {
        Self {
            control: (b & 0x01) != 0,
        }
    }
}

/// Frame header containing metadata about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number.
    pub magic: u32,
    /// Protocol version.
    pub version: u8,
    /// Control flags.
    pub flags: FrameFlags,
    /// Payload length in bytes.
    pub payload_length: u32,
    /// CRC32 checksum of the payload.
    pub checksum: u32,
}

impl FrameHeader {
    /// Decode a header from exactly [`FRAME_HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let mut buf = &buf[..];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let flags = FrameFlags::from_u8(buf.get_u8());
        let payload_length = buf.get_u32();
        let checksum = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            payload_length,
            checksum,
        })
    }
}

/// A single frame in the RPC protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Payload data.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame; the checksum is computed over the payload.
    pub fn new(payload: Vec<u8>, flags: FrameFlags) -> Self {
        let checksum = crc32(&payload);
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags,
            payload_length: payload.len() as u32,
            checksum,
        };
        Self { header, payload }
    }

    /// Encode the frame (header + payload) for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.header.magic);
        buf.put_u8(self.header.version);
        buf.put_u8(self.header.flags.as_u8());
        buf.put_u32(self.header.payload_length);
        buf.put_u32(self.header.checksum);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Validate the payload against the header checksum.
    pub fn validate(&self) -> Result<()> {
        let computed = crc32(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }
}

/// CRC32 (IEEE 802.3 polynomial, reflected).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = Frame::new(b"hello cluster".to_vec(), FrameFlags::empty());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 13);

        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        header_buf.copy_from_slice(&encoded[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&header_buf).unwrap();
        assert_eq!(header, frame.header);
        assert_eq!(&encoded[FRAME_HEADER_SIZE..], &frame.payload[..]);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut frame = Frame::new(b"payload".to_vec(), FrameFlags::empty());
        frame.validate().unwrap();

        frame.payload[0] ^= 0xFF;
        assert!(matches!(
            frame.validate(),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_reject_bad_magic() {
        let frame = Frame::new(vec![], FrameFlags::empty());
        let mut encoded = frame.encode();
        encoded[0] = 0x00;

        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        header_buf.copy_from_slice(&encoded[..FRAME_HEADER_SIZE]);
        assert!(matches!(
            FrameHeader::decode(&header_buf),
            Err(TransportError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_reject_bad_version() {
        let frame = Frame::new(vec![], FrameFlags::empty());
        let mut encoded = frame.encode();
        encoded[4] = 99;

        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        header_buf.copy_from_slice(&encoded[..FRAME_HEADER_SIZE]);
        assert!(matches!(
            FrameHeader::decode(&header_buf),
            Err(TransportError::VersionMismatch { got: 99, .. })
        ));
    }

    #[test]
    fn test_control_flag_round_trip() {
        let flags = FrameFlags { control: true };
        assert_eq!(FrameFlags::from_u8(flags.as_u8()), flags);
        assert_eq!(FrameFlags::from_u8(0), FrameFlags::empty());
    }

    #[test]
    fn test_crc32_known_value() {
        // Standard check value for the IEEE polynomial.
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(vec![], FrameFlags::empty());
        assert_eq!(frame.header.payload_length, 0);
        frame.validate().unwrap();
    }
}
