//! Framed TCP connection
//!
//! A [`Connection`] owns one accepted stream and exposes `send` / `receive`
//! of whole frames. After the handshake it is split into a reader half for
//! the read loop and a writer half for the writer task; everyone else talks
//! to the connection through a cloneable [`ConnectionHandle`] that only
//! enqueues frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::FrameCodec;
use crate::error::{ConnectionError, FrameError, SendError};
use crate::frame::Frame;
use crate::types::ConnectionId;

/// How long a closing writer may spend flushing buffered frames
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Close state shared by every part of one connection
///
/// Closing is idempotent: the first caller wins, later callers are no-ops,
/// and every pending `send` / `receive` wakes up with `Closed`.
#[derive(Debug, Clone, Default)]
pub struct CloseSignal {
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the connection; returns true only for the call that closed it
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// One accepted TCP stream with framed read/write
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    /// Wrap a stream, rejecting frames whose payload exceeds `max_payload`
    pub fn new(stream: TcpStream, max_payload: usize) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let codec = FrameCodec::new(max_payload);
        let close = CloseSignal::new();
        let (read_half, write_half) = stream.into_split();

        Self {
            id: ConnectionId::new(),
            peer_addr,
            reader: ConnectionReader {
                frames: FramedRead::new(read_half, codec),
                close: close.clone(),
            },
            writer: ConnectionWriter {
                frames: FramedWrite::new(write_half, codec),
                close,
            },
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Write one frame, suspending until it is flushed to the socket
    pub async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        self.writer.send(frame).await
    }

    /// Read the next frame; `Closed` once the stream has ended
    pub async fn receive(&mut self) -> Result<Frame, ConnectionError> {
        self.reader.receive().await
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.reader.close.clone()
    }

    /// Close the connection; returns true only for the first call
    pub fn close(&self) -> bool {
        self.reader.close.close()
    }

    /// Separate the halves so reading and writing run in different tasks
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`Connection`]
pub struct ConnectionReader {
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    close: CloseSignal,
}

impl ConnectionReader {
    /// Read the next frame
    ///
    /// A bad payload inside a well-framed frame yields `Malformed` and the
    /// next call continues with the following frame.
    pub async fn receive(&mut self) -> Result<Frame, ConnectionError> {
        if self.close.is_closed() {
            return Err(ConnectionError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.close.closed() => Err(ConnectionError::Closed),
            next = self.frames.next() => match next {
                None => Err(ConnectionError::Closed),
                Some(Err(e)) => Err(e.into()),
                Some(Ok(raw)) => raw.into_frame().map_err(ConnectionError::Malformed),
            },
        }
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }
}

/// Write half of a [`Connection`]
pub struct ConnectionWriter {
    frames: FramedWrite<OwnedWriteHalf, FrameCodec>,
    close: CloseSignal,
}

impl ConnectionWriter {
    /// Write and flush one frame
    ///
    /// A frame that cannot be encoded is reported as `Malformed`; nothing of
    /// it reaches the socket, so the stream stays usable.
    pub async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if self.close.is_closed() {
            return Err(ConnectionError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.close.closed() => Err(ConnectionError::Closed),
            result = self.frames.send(frame) => result.map_err(|e| match e {
                FrameError::Io(e) => ConnectionError::Io(e),
                e => ConnectionError::Malformed(e),
            }),
        }
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }

    /// Flush what is buffered and shut down the write direction
    pub async fn shutdown(mut self) {
        match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, self.frames.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error shutting down writer: {}", e),
            Err(_) => debug!("Writer shutdown timed out"),
        }
    }
}

/// Cheap, cloneable way to reach a connection's writer task
///
/// `send` never waits: a full queue means the peer is not keeping up and
/// is reported as [`SendError::QueueFull`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    close: CloseSignal,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue
    pub fn channel(
        id: ConnectionId,
        close: CloseSignal,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(capacity);
        (Self { id, outbound, close }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue a frame for the writer task
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        if self.close.is_closed() {
            return Err(SendError::ConnectionClosed);
        }

        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ConnectionClosed,
        })
    }

    /// Close the underlying connection; returns true only for the first call
    pub fn close(&self) -> bool {
        self.close.close()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }
}
