//! Server configuration
//!
//! Parsed from the command line with environment fallbacks. Every field
//! has a default so the server starts with no arguments at all.

use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::error::AppError;
use crate::frame::CHUNK_OVERHEAD;
use crate::transfer::DEFAULT_CHUNK_SIZE;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:5050";

/// Default cap on a single frame's payload (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default per-connection outbound queue length, in frames
pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;

/// Channel buffer size for server commands
pub const DEFAULT_COMMAND_BUFFER: usize = 256;

/// TCP messaging and file-transfer relay
#[derive(Parser, Debug, Clone)]
#[command(name = "tcp_relay", version, about = "TCP messaging and file-transfer relay")]
pub struct Config {
    /// Address to listen on
    #[arg(env = "RELAY_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Fixed file chunk size in bytes
    #[arg(long, env = "RELAY_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u32,

    /// Largest accepted frame payload in bytes
    #[arg(long, env = "RELAY_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Frames a connection may have queued before it is dropped as too slow
    #[arg(long, env = "RELAY_OUTBOUND_QUEUE", default_value_t = DEFAULT_OUTBOUND_QUEUE)]
    pub outbound_queue: usize,

    /// Buffer size of the server actor's command channel
    #[arg(long, env = "RELAY_COMMAND_BUFFER", default_value_t = DEFAULT_COMMAND_BUFFER)]
    pub command_buffer: usize,

    /// Close connections that send nothing for this many seconds
    #[arg(long, env = "RELAY_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Tell other users when someone joins or leaves
    #[arg(long, env = "RELAY_ANNOUNCE_PRESENCE", default_value_t = true, action = ArgAction::Set)]
    pub announce_presence: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            idle_timeout_secs: None,
            announce_presence: true,
        }
    }
}

impl Config {
    /// Check that the values can work together
    pub fn validate(&self) -> Result<(), AppError> {
        if self.chunk_size == 0 {
            return Err(AppError::Config("chunk size must be positive".to_string()));
        }
        if self.max_frame_bytes > u32::MAX as usize {
            return Err(AppError::Config(format!(
                "max frame size {} does not fit the 4-byte length prefix",
                self.max_frame_bytes
            )));
        }
        if self.chunk_size as usize + CHUNK_OVERHEAD > self.max_frame_bytes {
            return Err(AppError::Config(format!(
                "chunk size {} does not fit in a {} byte frame",
                self.chunk_size, self.max_frame_bytes
            )));
        }
        if self.outbound_queue == 0 || self.command_buffer == 0 {
            return Err(AppError::Config("queue sizes must be positive".to_string()));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(AppError::Config("idle timeout must be positive".to_string()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
