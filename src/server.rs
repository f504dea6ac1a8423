//! RelayServer Actor implementation
//!
//! The central actor that owns all shared state: the session registry, the
//! message router and the file transfer coordinator. Connection handlers
//! talk to it only through [`ServerCommand`]s, so every mutation is
//! serialized without locks. The actor never awaits network I/O: frames are
//! handed to per-connection outbound queues and written by writer tasks.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::activity::{ActivityEvent, ActivityLog, EventKind};
use crate::config::Config;
use crate::connection::ConnectionHandle;
use crate::error::AppError;
use crate::frame::Frame;
use crate::router::{Message, MessageKind, Router, RoutingOutcome};
use crate::session::SessionRegistry;
use crate::transfer::{Chunk, TransferCoordinator, TransferState};
use crate::types::{ConnectionId, Recipient, TransferId};

/// Commands sent from handlers to the RelayServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// Claim a username for a freshly handshaken connection
    Join {
        username: String,
        connection: ConnectionHandle,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    /// Connection ended; only honoured if it still owns the username
    Leave {
        username: String,
        connection_id: ConnectionId,
    },
    /// Route a text message
    ///
    /// Session commands below carry the issuing connection so a command
    /// left over from a closed connection cannot act on a newer session
    /// with the same name.
    Text {
        username: String,
        connection_id: ConnectionId,
        recipient: Recipient,
        body: Bytes,
    },
    /// Reply with the active usernames
    ListUsers {
        username: String,
        connection_id: ConnectionId,
    },
    FileRequest {
        username: String,
        connection_id: ConnectionId,
        receiver: String,
        filename: String,
        total_size: u64,
    },
    FileAccept {
        username: String,
        connection_id: ConnectionId,
        transfer_id: TransferId,
    },
    FileReject {
        username: String,
        connection_id: ConnectionId,
        transfer_id: TransferId,
        reason: String,
    },
    FileChunk {
        username: String,
        connection_id: ConnectionId,
        chunk: Chunk,
    },
    FileAck {
        username: String,
        connection_id: ConnectionId,
        transfer_id: TransferId,
        index: u32,
    },
    FileAbort {
        username: String,
        connection_id: ConnectionId,
        transfer_id: TransferId,
        reason: String,
    },
    /// Snapshot of active usernames for code outside the actor
    Snapshot {
        reply: oneshot::Sender<BTreeSet<String>>,
    },
}

impl ServerCommand {
    /// Session and connection that issued this command, if any
    fn issuer(&self) -> Option<(&str, ConnectionId)> {
        match self {
            ServerCommand::Join { .. }
            | ServerCommand::Leave { .. }
            | ServerCommand::Snapshot { .. } => None,
            ServerCommand::Text {
                username,
                connection_id,
                ..
            }
            | ServerCommand::ListUsers {
                username,
                connection_id,
            }
            | ServerCommand::FileRequest {
                username,
                connection_id,
                ..
            }
            | ServerCommand::FileAccept {
                username,
                connection_id,
                ..
            }
            | ServerCommand::FileReject {
                username,
                connection_id,
                ..
            }
            | ServerCommand::FileChunk {
                username,
                connection_id,
                ..
            }
            | ServerCommand::FileAck {
                username,
                connection_id,
                ..
            }
            | ServerCommand::FileAbort {
                username,
                connection_id,
                ..
            } => Some((username.as_str(), *connection_id)),
        }
    }
}

/// Ask the actor for a snapshot of active usernames
pub async fn list_active(
    cmd_tx: &mpsc::Sender<ServerCommand>,
) -> Result<BTreeSet<String>, AppError> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(ServerCommand::Snapshot { reply })
        .await
        .map_err(|_| AppError::ChannelSend)?;
    rx.await.map_err(|_| AppError::ChannelSend)
}

/// The main RelayServer actor
pub struct RelayServer {
    sessions: SessionRegistry,
    router: Router,
    transfers: TransferCoordinator,
    log: Arc<dyn ActivityLog>,
    announce_presence: bool,
    receiver: mpsc::Receiver<ServerCommand>,
}

impl RelayServer {
    /// Create a new RelayServer with the given command receiver
    pub fn new(
        receiver: mpsc::Receiver<ServerCommand>,
        config: &Config,
        log: Arc<dyn ActivityLog>,
    ) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            router: Router::new(log.clone()),
            transfers: TransferCoordinator::new(config.chunk_size, log.clone()),
            log,
            announce_presence: config.announce_presence,
            receiver,
        }
    }

    /// Run the RelayServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("RelayServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("RelayServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        if let Some((username, connection_id)) = cmd.issuer() {
            if self.sessions.lookup(username).is_none() {
                debug!("Ignoring command from inactive session {}", username);
                return;
            }
            if self.sessions.owner(username) != Some(connection_id) {
                debug!("Ignoring command for {} from stale connection {}", username, connection_id);
                return;
            }
        }

        match cmd {
            ServerCommand::Join {
                username,
                connection,
                reply,
            } => {
                self.handle_join(username, connection, reply);
            }
            ServerCommand::Leave {
                username,
                connection_id,
            } => {
                self.handle_leave(&username, connection_id);
            }
            ServerCommand::Text {
                username,
                recipient,
                body,
                ..
            } => {
                self.handle_text(username, recipient, body);
            }
            ServerCommand::ListUsers { username, .. } => {
                let usernames = self.sessions.list_active().into_iter().collect();
                self.reply(&username, Frame::UserList { usernames });
            }
            ServerCommand::FileRequest {
                username,
                receiver,
                filename,
                total_size,
                ..
            } => {
                self.transfers.request(
                    &mut self.sessions,
                    &username,
                    &receiver,
                    &filename,
                    total_size,
                );
            }
            ServerCommand::FileAccept {
                username,
                transfer_id,
                ..
            } => {
                let result = self.transfers.accept(&mut self.sessions, &username, transfer_id);
                self.report(&username, result);
            }
            ServerCommand::FileReject {
                username,
                transfer_id,
                reason,
                ..
            } => {
                let result =
                    self.transfers
                        .reject(&mut self.sessions, &username, transfer_id, &reason);
                self.report(&username, result);
            }
            ServerCommand::FileChunk { username, chunk, .. } => {
                let result = self.transfers.chunk(&mut self.sessions, &username, chunk);
                self.report(&username, result);
            }
            ServerCommand::FileAck {
                username,
                transfer_id,
                index,
                ..
            } => {
                let result = self
                    .transfers
                    .ack(&mut self.sessions, &username, transfer_id, index);
                self.report(&username, result);
            }
            ServerCommand::FileAbort {
                username,
                transfer_id,
                reason,
                ..
            } => {
                let result =
                    self.transfers
                        .cancel(&mut self.sessions, &username, transfer_id, &reason);
                self.report(&username, result);
            }
            ServerCommand::Snapshot { reply } => {
                let _ = reply.send(self.sessions.list_active());
            }
        }
    }

    /// Handle username claim
    fn handle_join(
        &mut self,
        username: String,
        connection: ConnectionHandle,
        reply: oneshot::Sender<Result<(), AppError>>,
    ) {
        let session = match self.sessions.admit(username.clone(), connection) {
            Ok(session) => session,
            Err(e) => {
                info!("Rejected join: {}", e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        // JOIN_OK must be the first frame in the new session's queue
        if let Err(e) = session.send(Frame::JoinOk) {
            warn!("Could not confirm join for {}: {}", username, e);
            self.sessions.mark_closing(&username);
        }

        info!("Session {} joined", username);
        self.log.record(ActivityEvent::now(
            EventKind::SessionJoined,
            username.clone(),
        ));
        debug!(
            "Active sessions: {}, transfers in flight: {}",
            self.sessions.len(),
            self.transfers.len()
        );
        let _ = reply.send(Ok(()));

        if self.announce_presence {
            let notice = Message::system(username.clone(), format!("{} joined", username));
            self.router.route(&mut self.sessions, notice);
        }
    }

    /// Handle connection end
    fn handle_leave(&mut self, username: &str, connection_id: ConnectionId) {
        if self.sessions.owner(username) != Some(connection_id) {
            debug!("Leave for {} ignored, not the owning connection", username);
            return;
        }
        let Some(session) = self.sessions.remove(username) else {
            return;
        };

        self.log.record(ActivityEvent::now(
            EventKind::SessionLeft,
            username.to_string(),
        ));
        let aborted = self.transfers.abort_for_session(&mut self.sessions, username);
        let online = chrono::Utc::now() - session.joined_at;
        info!(
            "Session {} left after {}s, {} transfers aborted",
            username,
            online.num_seconds(),
            aborted.len()
        );

        if self.announce_presence {
            let notice = Message::system(username, format!("{} left", username));
            self.router.route(&mut self.sessions, notice);
        }
    }

    /// Handle text message routing
    fn handle_text(&mut self, username: String, recipient: Recipient, body: Bytes) {
        if recipient == Recipient::User(username.clone()) {
            self.reply(
                &username,
                Frame::error(&AppError::ProtocolViolation(
                    "You cannot message yourself".to_string(),
                )),
            );
            return;
        }

        let Some(seq) = self.sessions.next_seq(&username) else {
            return;
        };
        let message = Message {
            sender: username.clone(),
            recipient: recipient.clone(),
            payload: body,
            seq,
            kind: MessageKind::Text,
        };

        let outcome = self.router.route(&mut self.sessions, message);
        let receipt = match (outcome, recipient) {
            (RoutingOutcome::Delivered, recipient) => Frame::System {
                text: format!("delivered to {}", recipient),
            },
            (RoutingOutcome::RecipientOffline, recipient) => {
                Frame::error(&AppError::RecipientOffline(recipient.to_string()))
            }
            (
                RoutingOutcome::Broadcast {
                    attempted,
                    delivered,
                },
                _,
            ) => Frame::System {
                text: format!("broadcast delivered to {} of {}", delivered, attempted),
            },
        };
        self.reply(&username, receipt);
    }

    /// Tell the issuer why a transfer command was refused
    fn report(&mut self, username: &str, result: Result<TransferState, AppError>) {
        match result {
            Ok(state) => debug!("Transfer command from {} -> {:?}", username, state),
            Err(e) => {
                warn!("Transfer command from {} refused: {}", username, e);
                self.reply(username, Frame::error(&e));
            }
        }
    }

    /// Helper: Send a frame back to one session
    fn reply(&mut self, username: &str, frame: Frame) {
        let Some(session) = self.sessions.lookup(username) else {
            return;
        };
        if let Err(e) = session.send(frame) {
            warn!("Dropping session {}: {}", username, e);
            self.sessions.mark_closing(username);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::MemoryActivityLog;
    use crate::connection::CloseSignal;
    use crate::frame::ErrorCode;

    struct Harness {
        cmd_tx: mpsc::Sender<ServerCommand>,
        log: MemoryActivityLog,
    }

    impl Harness {
        fn start(announce_presence: bool) -> Self {
            let log = MemoryActivityLog::new();
            let config = Config {
                chunk_size: 4096,
                announce_presence,
                ..Config::default()
            };
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            tokio::spawn(RelayServer::new(cmd_rx, &config, Arc::new(log.clone())).run());
            Self { cmd_tx, log }
        }

        async fn join(
            &self,
            username: &str,
        ) -> (Result<(), AppError>, ConnectionId, mpsc::Receiver<Frame>) {
            let id = ConnectionId::new();
            let (connection, rx) = ConnectionHandle::channel(id, CloseSignal::new(), 64);
            let (reply, reply_rx) = oneshot::channel();
            self.cmd_tx
                .send(ServerCommand::Join {
                    username: username.to_string(),
                    connection,
                    reply,
                })
                .await
                .unwrap();
            (reply_rx.await.unwrap(), id, rx)
        }

        async fn send(&self, cmd: ServerCommand) {
            self.cmd_tx.send(cmd).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_join_ok_first() {
        let server = Harness::start(true);
        let (result, _, mut rx) = server.join("alice").await;

        assert!(result.is_ok());
        assert_eq!(rx.recv().await.unwrap(), Frame::JoinOk);
        assert_eq!(server.log.count(EventKind::SessionJoined), 1);
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let server = Harness::start(false);
        let (first, _, _alice) = server.join("alice").await;
        let (second, _, _other) = server.join("alice").await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(AppError::UsernameTaken(_))));
        assert_eq!(
            list_active(&server.cmd_tx).await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["alice"]
        );
    }

    #[tokio::test]
    async fn test_text_to_offline_user() {
        let server = Harness::start(false);
        let (_, alice_id, mut alice) = server.join("alice").await;
        alice.recv().await.unwrap();

        server
            .send(ServerCommand::Text {
                username: "alice".to_string(),
                connection_id: alice_id,
                recipient: Recipient::User("bob".to_string()),
                body: Bytes::from_static(b"hi"),
            })
            .await;

        match alice.recv().await.unwrap() {
            Frame::Error { reason } => assert_eq!(reason.code, ErrorCode::RecipientOffline),
            other => panic!("Wrong frame: {:?}", other),
        }
        assert_eq!(server.log.count(EventKind::MessageDropped), 1);
    }

    #[tokio::test]
    async fn test_text_delivered_with_receipt() {
        let server = Harness::start(false);
        let (_, alice_id, mut alice) = server.join("alice").await;
        let (_, _, mut bob) = server.join("bob").await;
        alice.recv().await.unwrap();
        bob.recv().await.unwrap();

        server
            .send(ServerCommand::Text {
                username: "alice".to_string(),
                connection_id: alice_id,
                recipient: Recipient::User("bob".to_string()),
                body: Bytes::from_static(b"hi"),
            })
            .await;

        assert_eq!(
            bob.recv().await.unwrap(),
            Frame::Text {
                from: "alice".to_string(),
                to: Recipient::User("bob".to_string()),
                seq: 1,
                body: Bytes::from_static(b"hi"),
            }
        );
        assert_eq!(
            alice.recv().await.unwrap(),
            Frame::System {
                text: "delivered to bob".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_presence_announced() {
        let server = Harness::start(true);
        let (_, _, mut alice) = server.join("alice").await;
        alice.recv().await.unwrap();
        let (_, bob_id, _bob) = server.join("bob").await;

        assert_eq!(
            alice.recv().await.unwrap(),
            Frame::System {
                text: "bob joined".to_string()
            }
        );

        server
            .send(ServerCommand::Leave {
                username: "bob".to_string(),
                connection_id: bob_id,
            })
            .await;
        assert_eq!(
            alice.recv().await.unwrap(),
            Frame::System {
                text: "bob left".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_leave_idempotent() {
        let server = Harness::start(false);
        let (_, alice_id, _alice) = server.join("alice").await;

        for _ in 0..2 {
            server
                .send(ServerCommand::Leave {
                    username: "alice".to_string(),
                    connection_id: alice_id,
                })
                .await;
        }

        assert!(list_active(&server.cmd_tx).await.unwrap().is_empty());
        assert_eq!(server.log.count(EventKind::SessionLeft), 1);
    }

    #[tokio::test]
    async fn test_leave_from_stale_connection_ignored() {
        let server = Harness::start(false);
        let (_, _, _alice) = server.join("alice").await;

        server
            .send(ServerCommand::Leave {
                username: "alice".to_string(),
                connection_id: ConnectionId::new(),
            })
            .await;

        assert_eq!(list_active(&server.cmd_tx).await.unwrap().len(), 1);
        assert_eq!(server.log.count(EventKind::SessionLeft), 0);
    }

    #[tokio::test]
    async fn test_leave_aborts_transfer() {
        let server = Harness::start(false);
        let (_, alice_id, mut alice) = server.join("alice").await;
        let (_, bob_id, mut bob) = server.join("bob").await;
        alice.recv().await.unwrap();
        bob.recv().await.unwrap();

        server
            .send(ServerCommand::FileRequest {
                username: "alice".to_string(),
                connection_id: alice_id,
                receiver: "bob".to_string(),
                filename: "notes.txt".to_string(),
                total_size: 10,
            })
            .await;
        let transfer_id = match alice.recv().await.unwrap() {
            Frame::FilePending { transfer_id, .. } => transfer_id,
            other => panic!("Wrong frame: {:?}", other),
        };
        assert!(matches!(bob.recv().await.unwrap(), Frame::FileOffer { .. }));

        server
            .send(ServerCommand::Leave {
                username: "bob".to_string(),
                connection_id: bob_id,
            })
            .await;

        match alice.recv().await.unwrap() {
            Frame::FileAbort {
                transfer_id: id,
                reason,
            } => {
                assert_eq!(id, transfer_id);
                assert_eq!(reason.code, ErrorCode::PeerDisconnected);
            }
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_transfer_reported() {
        let server = Harness::start(false);
        let (_, alice_id, mut alice) = server.join("alice").await;
        alice.recv().await.unwrap();

        server
            .send(ServerCommand::FileAccept {
                username: "alice".to_string(),
                connection_id: alice_id,
                transfer_id: TransferId::generate(),
            })
            .await;

        match alice.recv().await.unwrap() {
            Frame::Error { reason } => assert_eq!(reason.code, ErrorCode::UnknownTransfer),
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_self_message_rejected() {
        let server = Harness::start(false);
        let (_, alice_id, mut alice) = server.join("alice").await;
        alice.recv().await.unwrap();

        server
            .send(ServerCommand::Text {
                username: "alice".to_string(),
                connection_id: alice_id,
                recipient: Recipient::User("alice".to_string()),
                body: Bytes::from_static(b"me"),
            })
            .await;

        match alice.recv().await.unwrap() {
            Frame::Error { reason } => assert_eq!(reason.code, ErrorCode::ProtocolViolation),
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_from_replaced_connection_ignored() {
        let server = Harness::start(false);
        let (_, old_id, _old) = server.join("alice").await;
        server
            .send(ServerCommand::Leave {
                username: "alice".to_string(),
                connection_id: old_id,
            })
            .await;
        let (result, new_id, mut alice) = server.join("alice").await;
        assert!(result.is_ok());
        assert_eq!(alice.recv().await.unwrap(), Frame::JoinOk);

        server
            .send(ServerCommand::Text {
                username: "alice".to_string(),
                connection_id: old_id,
                recipient: Recipient::User("bob".to_string()),
                body: Bytes::from_static(b"late"),
            })
            .await;
        server
            .send(ServerCommand::ListUsers {
                username: "alice".to_string(),
                connection_id: new_id,
            })
            .await;

        assert_eq!(
            alice.recv().await.unwrap(),
            Frame::UserList {
                usernames: vec!["alice".to_string()]
            }
        );
        assert_eq!(server.log.count(EventKind::MessageDropped), 0);
    }
}
