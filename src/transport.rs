//! Single-peer framed TCP transport.
//!
//! The transport owns the listening socket, accepts exactly one peer, and
//! splits the connection's byte stream into JSON frames (see
//! [`crate::protocol::FrameBuffer`]). The listening socket is closed as soon
//! as the peer connects; a new connection cannot be accepted until this
//! transport's resources are released. The write side is single-writer:
//! concurrent senders serialize on a mutex so frame bytes never interleave.

use crate::error::{VcapError, VcapResult};
use crate::protocol::{Command, FrameBuffer, WireFrame};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

const READ_CHUNK_SIZE: usize = 4096;

/// Lifecycle of the single peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Running,
    ShuttingDown,
    Closed,
}

/// Bound listening socket, waiting for the one peer.
pub struct TransportListener {
    listener: TcpListener,
}

impl TransportListener {
    /// Binds to all interfaces on the given port. Port `0` picks an
    /// ephemeral port; see [`TransportListener::local_addr`].
    pub async fn bind(port: u16) -> VcapResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("[FramedTransport] Listening on port {}", port);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> VcapResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until exactly one peer connects, then drops the listening
    /// socket and yields the connected transport.
    pub async fn accept(self) -> VcapResult<FramedTransport> {
        let (stream, peer) = self.listener.accept().await?;
        info!("[FramedTransport] Peer connected: {}", peer);
        let (read, write) = stream.into_split();
        Ok(FramedTransport {
            peer,
            reader: Mutex::new(Some(ReadSide {
                half: read,
                buffer: FrameBuffer::new(),
            })),
            writer: Mutex::new(Some(write)),
            state: RwLock::new(ConnectionState::Connected),
        })
    }
}

struct ReadSide {
    half: OwnedReadHalf,
    buffer: FrameBuffer,
}

/// One connected peer with brace-balance framing on top.
pub struct FramedTransport {
    peer: SocketAddr,
    reader: Mutex<Option<ReadSide>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: RwLock<ConnectionState>,
}

impl FramedTransport {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// Receives the next complete frame, buffering partial reads until the
    /// brace balance closes. A zero-length read means the peer has fully
    /// closed; the connection transitions to `Closed` and the call fails
    /// with [`VcapError::ConnectionLost`].
    pub async fn recv_frame(&self) -> VcapResult<WireFrame> {
        let mut guard = self.reader.lock().await;
        let side = guard.as_mut().ok_or(VcapError::NotConnected)?;
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(frame) = side.buffer.next_frame() {
                return Ok(frame);
            }
            let n = match side.half.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("[FramedTransport] Read error from {}: {}", self.peer, e);
                    self.set_state(ConnectionState::Closed);
                    return Err(VcapError::ConnectionLost);
                }
            };
            if n == 0 {
                info!("[FramedTransport] Peer {} disconnected", self.peer);
                self.set_state(ConnectionState::Closed);
                return Err(VcapError::ConnectionLost);
            }
            side.buffer.extend(&chunk[..n]);
        }
    }

    /// Writes one frame's bytes. Senders serialize on the write mutex so a
    /// frame is never interleaved with another.
    pub async fn send(&self, bytes: &[u8]) -> VcapResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(VcapError::NotConnected)?;
        writer.write_all(bytes).await.map_err(|e| {
            warn!("[FramedTransport] Write error to {}: {}", self.peer, e);
            VcapError::ConnectionLost
        })
    }

    /// Serializes and sends one command envelope.
    pub async fn send_command(&self, command: &Command) -> VcapResult<()> {
        self.send(&command.to_bytes()?).await
    }

    /// Tears the connection down: both socket halves are shut down and
    /// dropped exactly once. Repeated calls log and return without error;
    /// socket errors during shutdown are logged, never raised.
    pub async fn kill(&self) {
        if self.state() == ConnectionState::Closed {
            debug!("[FramedTransport] Already shut down");
            return;
        }
        self.set_state(ConnectionState::ShuttingDown);
        info!("[FramedTransport] Shutting down connection to {}", self.peer);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                warn!("[FramedTransport] Error while shutting down socket: {}", e);
            }
        }
        // Dropping the read half closes the receive side.
        self.reader.lock().await.take();
        self.set_state(ConnectionState::Closed);
    }
}
