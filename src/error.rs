//! Error types for the relay
//!
//! Defines application-level errors, wire format errors, connection
//! errors and outbound queue errors. Uses thiserror for ergonomic
//! error definitions.

use thiserror::Error;

use crate::types::TransferId;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (reported to the client as a reason frame).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame payload
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Connection failed or closed (fatal)
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Invalid startup configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Username already claimed by an active session
    #[error("Username '{0}' is already in use")]
    UsernameTaken(String),

    /// Username failed validation
    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    /// Target user has no active session
    #[error("User '{0}' is not online")]
    RecipientOffline(String),

    /// Chunk length, chunk count or total size disagree
    #[error("Size mismatch: {0}")]
    SizeMismatch(String),

    /// Frame is well-formed but not allowed here
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No in-flight transfer with this id involves the caller
    #[error("Unknown transfer {0}")]
    UnknownTransfer(TransferId),
}

/// Wire format errors
///
/// `Io` and `TooLarge` break the byte stream; the remaining
/// variants only affect the single frame being decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Length prefix exceeds the configured maximum
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("string field {0} too long")]
    StringTooLong(&'static str),

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

impl FrameError {
    /// Whether this error leaves the byte stream unusable
    pub fn corrupts_stream(&self) -> bool {
        matches!(self, FrameError::Io(_) | FrameError::TooLarge { .. })
    }
}

/// Errors surfaced by [`crate::connection::Connection`]
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Stream ended or the connection was closed locally
    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing is corrupt; nothing after this can be trusted
    #[error("framing error: {0}")]
    Framing(FrameError),

    /// One frame had a bad payload; the stream is still aligned
    #[error("malformed frame: {0}")]
    Malformed(FrameError),

    /// No inbound frame within the idle timeout
    #[error("idle timeout")]
    IdleTimeout,
}

impl ConnectionError {
    /// Whether the connection must be torn down
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionError::Malformed(_))
    }
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => ConnectionError::Io(e),
            e if e.corrupts_stream() => ConnectionError::Framing(e),
            e => ConnectionError::Malformed(e),
        }
    }
}

/// Errors turning a typed user command into a frame
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid transfer id '{0}'")]
    InvalidTransferId(String),

    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound queue errors
///
/// Occurs when enqueueing a frame for a connection's writer task.
#[derive(Debug, Error)]
pub enum SendError {
    /// The writer task has gone away
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer is not draining its queue
    #[error("Outbound queue full")]
    QueueFull,
}
