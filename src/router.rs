//! Message router
//!
//! Resolves a message's destination against the session registry and
//! hands the serialized frame to the target connections. Delivery is best
//! effort: offline recipients are reported, never queued.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::activity::{ActivityEvent, ActivityLog, EventKind};
use crate::frame::Frame;
use crate::session::{SessionHandle, SessionRegistry};
use crate::types::Recipient;

/// Whether a message came from a user or from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    System,
}

/// A message in flight; exists only while being routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub recipient: Recipient,
    pub payload: Bytes,
    pub seq: u64,
    pub kind: MessageKind,
}

impl Message {
    /// Server notice about `subject`, sent to everyone else
    pub fn system(subject: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: subject.into(),
            recipient: Recipient::Broadcast,
            payload: Bytes::from(text.into()),
            seq: 0,
            kind: MessageKind::System,
        }
    }

    fn to_frame(&self) -> Frame {
        match self.kind {
            MessageKind::Text => Frame::Text {
                from: self.sender.clone(),
                to: self.recipient.clone(),
                seq: self.seq,
                body: self.payload.clone(),
            },
            MessageKind::System => Frame::System {
                text: String::from_utf8_lossy(&self.payload).into_owned(),
            },
        }
    }
}

/// Result of routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Handed to the recipient's connection
    Delivered,
    /// No active session for the recipient; message dropped
    RecipientOffline,
    /// Fan-out to every other active session
    Broadcast { attempted: usize, delivered: usize },
}

/// Dispatches messages to sessions
pub struct Router {
    log: Arc<dyn ActivityLog>,
}

impl Router {
    pub fn new(log: Arc<dyn ActivityLog>) -> Self {
        Self { log }
    }

    /// Route one message
    ///
    /// A recipient whose connection refuses the frame is moved to closing
    /// and counts as offline.
    pub fn route(&self, sessions: &mut SessionRegistry, message: Message) -> RoutingOutcome {
        match &message.recipient {
            Recipient::User(name) => {
                let Some(target) = sessions.lookup(name) else {
                    self.record(
                        &message,
                        EventKind::MessageDropped,
                        format!("{} -> {}: recipient offline", message.sender, name),
                    );
                    return RoutingOutcome::RecipientOffline;
                };

                if deliver(sessions, &target, message.to_frame()) {
                    self.record(
                        &message,
                        EventKind::MessageRouted,
                        format!("{} -> {} (seq {})", message.sender, name, message.seq),
                    );
                    RoutingOutcome::Delivered
                } else {
                    self.record(
                        &message,
                        EventKind::MessageDropped,
                        format!("{} -> {}: connection failed", message.sender, name),
                    );
                    RoutingOutcome::RecipientOffline
                }
            }
            Recipient::Broadcast => {
                let frame = message.to_frame();
                let targets: Vec<_> = sessions
                    .active_sessions()
                    .into_iter()
                    .filter(|s| s.username != message.sender)
                    .collect();

                let attempted = targets.len();
                let delivered = targets
                    .iter()
                    .filter(|target| deliver(sessions, target, frame.clone()))
                    .count();

                self.record(
                    &message,
                    EventKind::MessageRouted,
                    format!(
                        "{} -> * (seq {}, {} of {} delivered)",
                        message.sender, message.seq, delivered, attempted
                    ),
                );
                RoutingOutcome::Broadcast {
                    attempted,
                    delivered,
                }
            }
        }
    }

    fn record(&self, message: &Message, kind: EventKind, detail: String) {
        match message.kind {
            MessageKind::Text => self.log.record(ActivityEvent::now(kind, detail)),
            MessageKind::System => debug!("System notice: {}", detail),
        }
    }
}

fn deliver(sessions: &mut SessionRegistry, target: &SessionHandle, frame: Frame) -> bool {
    match target.send(frame) {
        Ok(()) => true,
        Err(e) => {
            warn!("Dropping session {}: {}", target.username, e);
            sessions.mark_closing(&target.username);
            false
        }
    }
}
