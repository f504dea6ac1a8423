//! TCP Messaging and File-Transfer Relay Library
//!
//! A multi-client relay over plain TCP built with tokio, using the Actor
//! pattern for state management.
//!
//! # Features
//! - Length-prefixed binary framing
//! - Unique usernames claimed with a JOIN handshake
//! - Direct and broadcast text messages with per-sender sequence numbers
//! - Chunked file transfer with accept/reject, acknowledgements and abort
//! - Disconnect handling that aborts in-flight transfers
//! - Pluggable activity log
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `RelayServer` is the central actor owning sessions, routing and transfers
//! - Each connection has a read task and a writer task
//! - The actor only enqueues frames; it never waits on a socket
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tcp_relay::{run, Config, TracingActivityLog};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     run(config, Arc::new(TracingActivityLog)).await.unwrap();
//! }
//! ```

pub mod activity;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod listener;
pub mod router;
pub mod server;
pub mod session;
pub mod transfer;
pub mod types;

// Re-export main types for convenience
pub use activity::{ActivityEvent, ActivityLog, EventKind, MemoryActivityLog, TracingActivityLog};
pub use client::RelayClient;
pub use command::Command;
pub use config::Config;
pub use connection::{Connection, ConnectionHandle};
pub use error::{AppError, CommandError, ConnectionError, FrameError, SendError};
pub use frame::{ErrorCode, Frame, FrameType, Reason};
pub use handler::handle_connection;
pub use listener::{run, serve};
pub use router::{Message, RoutingOutcome, Router};
pub use server::{RelayServer, ServerCommand};
pub use session::SessionRegistry;
pub use transfer::{Chunk, TransferCoordinator, TransferState};
pub use types::{ConnectionId, Recipient, TransferId};
