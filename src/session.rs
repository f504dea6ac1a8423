//! Session registry
//!
//! The live mapping from username to the connection that claimed it.
//! Owned by the server actor, so every mutation is already serialized;
//! the map itself never leaves this module.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::connection::ConnectionHandle;
use crate::error::{AppError, SendError};
use crate::frame::Frame;
use crate::types::ConnectionId;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reachable by lookups, routing and transfers
    Active,
    /// Connection is going away; the username stays reserved until the
    /// read loop reports the disconnect
    Closing,
}

/// Server-side record of one connected username
#[derive(Debug)]
pub struct Session {
    pub username: String,
    pub connection: ConnectionHandle,
    pub joined_at: DateTime<Utc>,
    pub state: SessionState,
    next_seq: u64,
}

impl Session {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            username: self.username.clone(),
            connection: self.connection.clone(),
            joined_at: self.joined_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

/// Borrowed view of a session handed to the router and coordinator
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub username: String,
    pub connection: ConnectionHandle,
    pub joined_at: DateTime<Utc>,
}

impl SessionHandle {
    /// Enqueue a frame on this session's connection
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.connection.send(frame)
    }
}

/// Username → session map with uniqueness enforcement
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `username` for `connection`
    ///
    /// Fails with `UsernameTaken` while any session, active or closing,
    /// holds the name.
    pub fn admit(
        &mut self,
        username: String,
        connection: ConnectionHandle,
    ) -> Result<SessionHandle, AppError> {
        if self.sessions.contains_key(&username) {
            return Err(AppError::UsernameTaken(username));
        }

        let session = Session {
            username: username.clone(),
            connection,
            joined_at: Utc::now(),
            state: SessionState::Active,
            next_seq: 0,
        };
        let handle = session.handle();
        self.sessions.insert(username, session);
        Ok(handle)
    }

    /// Active session for `username`, if any
    pub fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.sessions
            .get(username)
            .filter(|s| s.is_active())
            .map(Session::handle)
    }

    /// Drop the session; removing an absent username is a no-op
    pub fn remove(&mut self, username: &str) -> Option<Session> {
        self.sessions.remove(username)
    }

    /// Stop routing to `username` and close its connection
    ///
    /// Returns true if an active session was moved to closing.
    pub fn mark_closing(&mut self, username: &str) -> bool {
        match self.sessions.get_mut(username) {
            Some(session) if session.is_active() => {
                session.state = SessionState::Closing;
                session.connection.close();
                true
            }
            _ => false,
        }
    }

    /// Connection currently owning `username`, in any state
    pub fn owner(&self, username: &str) -> Option<ConnectionId> {
        self.sessions.get(username).map(|s| s.connection.id())
    }

    /// Next per-sender sequence number for an active session
    pub fn next_seq(&mut self, username: &str) -> Option<u64> {
        let session = self.sessions.get_mut(username).filter(|s| s.is_active())?;
        session.next_seq += 1;
        Some(session.next_seq)
    }

    /// Snapshot of active usernames
    pub fn list_active(&self) -> BTreeSet<String> {
        self.sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.username.clone())
            .collect()
    }

    /// Snapshot of active sessions, in username order
    pub fn active_sessions(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.is_active())
            .map(Session::handle)
            .collect();
        handles.sort_by(|a, b| a.username.cmp(&b.username));
        handles
    }

    /// Number of sessions in any state
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
