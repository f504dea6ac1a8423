//! Activity logger sink
//!
//! Session, routing and transfer components report what happened as
//! [`ActivityEvent`]s. How events are formatted or stored is up to the
//! [`ActivityLog`] implementation plugged into the server.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Kind of activity being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionJoined,
    SessionLeft,
    MessageRouted,
    MessageDropped,
    TransferStarted,
    TransferCompleted,
    TransferAborted,
}

/// One recorded event
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

impl ActivityEvent {
    /// Create an event stamped with the current time
    pub fn now(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
        }
    }
}

/// Receiver of activity events
///
/// Called from the server actor, so implementations must not block.
pub trait ActivityLog: Send + Sync {
    fn record(&self, event: ActivityEvent);
}

/// Forwards events to `tracing` under the `activity` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn record(&self, event: ActivityEvent) {
        info!(
            target: "activity",
            kind = ?event.kind,
            timestamp = %event.timestamp.to_rfc3339(),
            "{}",
            event.detail
        );
    }
}

/// Keeps events in memory, mostly for tests and diagnostics
#[derive(Debug, Default, Clone)]
pub struct MemoryActivityLog {
    events: Arc<Mutex<Vec<ActivityEvent>>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of recorded events of one kind
    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl ActivityLog for MemoryActivityLog {
    fn record(&self, event: ActivityEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
