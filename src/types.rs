//! Basic type definitions for the relay
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based identifier of one accepted TCP connection
//! - `TransferId`: UUID-based token naming one file transfer
//! - `Recipient`: a specific username or every active session

use uuid::Uuid;

use crate::error::AppError;

/// Longest username accepted at handshake time
pub const MAX_USERNAME_LEN: usize = 32;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4 so a session can be matched against the exact
/// connection that owns it. Implements Hash and Eq for use as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque transfer token, carried on the wire as 16 raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub Uuid);

impl TransferId {
    /// Generate a fresh transfer token
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Destination of a text message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// One named session
    User(String),
    /// Every active session except the sender
    Broadcast,
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::User(name) => f.write_str(name),
            Recipient::Broadcast => f.write_str("*"),
        }
    }
}

/// Normalize and validate a username claimed during the handshake
///
/// Surrounding whitespace is trimmed; the rest must be non-empty,
/// at most [`MAX_USERNAME_LEN`] characters and free of whitespace
/// and control characters.
pub fn validate_username(raw: &str) -> Result<String, AppError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::InvalidUsername("username cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_USERNAME_LEN {
        return Err(AppError::InvalidUsername(format!(
            "username longer than {} characters",
            MAX_USERNAME_LEN
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AppError::InvalidUsername(format!(
            "username '{}' contains whitespace or control characters",
            name.escape_debug()
        )));
    }
    Ok(name.to_string())
}
