//! TCP connections between cluster peers.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::frame::{Frame, FrameFlags, FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::{deserialize_message, serialize_message, ControlMessage};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
    /// Interval after which an idle connection is probed with a ping.
    pub heartbeat_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Transport factory: dials peers and accepts inbound connections.
#[derive(Debug, Clone)]
pub struct Transport {
    config: TransportConfig,
}

impl Transport {
    /// Create a transport with the given configuration.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// The transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Establish a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<Connection> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        trace!(addr, "TCP connected");
        Ok(Connection::from_stream(stream))
    }

    /// Bind to the specified address and return a listener.
    pub async fn listen(&self, addr: &str) -> Result<Listener> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Listener {
            inner: listener,
            local_addr,
            nodelay: self.config.nodelay,
        })
    }
}

/// Listening socket producing inbound peer connections.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: std::net::SocketAddr,
    nodelay: bool,
}

impl Listener {
    /// Accept one inbound connection.
    pub async fn accept(&self) -> Result<Connection> {
        let (stream, _) = self.inner.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(Connection::from_stream(stream))
    }

    /// The bound local address (useful when listening on port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

/// A single peer connection with concurrent read/write support.
pub struct Connection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    last_activity: StdMutex<Instant>,
}

impl Connection {
    fn from_stream(stream: TcpStream) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
            last_activity: StdMutex::new(Instant::now()),
        }
    }

    /// The remote peer address.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// How long since the last frame arrived from the peer.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    /// Send a raw frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await?;
        write.flush().await?;
        Ok(())
    }

    /// Receive a raw frame, validating header and checksum.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        read.read_exact(&mut header_buf).await.map_err(map_eof)?;
        let header = FrameHeader::decode(&header_buf)?;
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            read.read_exact(&mut payload).await.map_err(map_eof)?;
        }
        drop(read);
        let frame = Frame { header, payload };
        frame.validate()?;
        self.touch();
        Ok(frame)
    }

    /// Send a transport control message.
    pub async fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        let payload = serialize_message(msg)?;
        self.send_frame(&Frame::new(payload, FrameFlags { control: true }))
            .await
    }

    /// Receive a control message; payload frames are an error here.
    /// Used only during the handshake.
    pub async fn recv_control(&self) -> Result<ControlMessage> {
        let frame = self.recv_frame().await?;
        if !frame.header.flags.control {
            return Err(TransportError::HandshakeRejected {
                reason: "payload frame received before handshake completed".to_string(),
            });
        }
        deserialize_message(&frame.payload)
    }

    /// Send an opaque synchronization payload.
    pub async fn send_payload(&self, payload: Vec<u8>) -> Result<()> {
        self.send_frame(&Frame::new(payload, FrameFlags::empty())).await
    }

    /// Send a keepalive probe.
    pub async fn send_ping(&self) -> Result<()> {
        self.send_control(&ControlMessage::Ping).await
    }

    /// Receive the next synchronization payload.
    ///
    /// Keepalive traffic is absorbed here: pings are answered with pongs
    /// and pongs only refresh the idle clock.
    pub async fn recv_payload(&self) -> Result<Vec<u8>> {
        loop {
            let frame = self.recv_frame().await?;
            if !frame.header.flags.control {
                return Ok(frame.payload);
            }
            match deserialize_message::<ControlMessage>(&frame.payload)? {
                ControlMessage::Ping => self.send_control(&ControlMessage::Pong).await?,
                ControlMessage::Pong => {}
                other => {
                    return Err(TransportError::HandshakeRejected {
                        reason: format!("unexpected control message after handshake: {other:?}"),
                    })
                }
            }
        }
    }
}

fn map_eof(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::Io(e)
    }
}
