//! TCP connection handler
//!
//! Handles individual client connections: JOIN handshake, frame
//! translation, and bidirectional communication with the RelayServer.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionHandle, ConnectionReader, ConnectionWriter};
use crate::error::{AppError, ConnectionError};
use crate::frame::{Frame, Reason, TEXT_OVERHEAD};
use crate::server::ServerCommand;
use crate::types::{validate_username, ConnectionId, Recipient, MAX_USERNAME_LEN};

/// Handle a new TCP connection
///
/// Performs the JOIN handshake, sets up the writer and read tasks,
/// and reports the disconnect to the server when either side ends.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
    config: Arc<Config>,
) -> Result<(), AppError> {
    let mut conn = Connection::new(stream, config.max_frame_bytes);
    let peer_addr = conn
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    debug!("New TCP connection {} from {}", conn.id(), peer_addr);

    let Some(username) = handshake(&mut conn, config.idle_timeout()).await? else {
        conn.close();
        return Ok(());
    };

    // Outbound queue drained by the writer task
    let (handle, outbound) =
        ConnectionHandle::channel(conn.id(), conn.close_signal(), config.outbound_queue);

    let (reply, joined) = oneshot::channel();
    if cmd_tx
        .send(ServerCommand::Join {
            username: username.clone(),
            connection: handle.clone(),
            reply,
        })
        .await
        .is_err()
    {
        error!("Failed to register {} - server closed", username);
        return Err(AppError::ChannelSend);
    }

    match joined.await.map_err(|_| AppError::ChannelSend)? {
        Ok(()) => {}
        Err(e) => {
            let _ = conn
                .send(Frame::JoinReject {
                    reason: Reason::from(&e),
                })
                .await;
            conn.close();
            return Ok(());
        }
    }

    info!("{} joined from {}", username, peer_addr);

    let connection_id = conn.id();
    let (reader, writer) = conn.split();

    let write_task = tokio::spawn(write_loop(writer, outbound));
    let read_task = tokio::spawn(read_loop(
        reader,
        handle.clone(),
        cmd_tx.clone(),
        username.clone(),
        config.clone(),
    ));

    // Wait for either task to complete
    tokio::select! {
        _ = read_task => {
            debug!("Read task completed for {}", username);
        }
        _ = write_task => {
            debug!("Write task completed for {}", username);
        }
    }

    handle.close();

    // Send leave command
    let _ = cmd_tx
        .send(ServerCommand::Leave {
            username: username.clone(),
            connection_id,
        })
        .await;

    info!("{} disconnected", username);

    Ok(())
}

/// Read the JOIN frame and validate the requested username
///
/// Returns `None` after answering a bad handshake with JOIN_REJECT or
/// when the peer went away first.
async fn handshake(
    conn: &mut Connection,
    timeout: Option<Duration>,
) -> Result<Option<String>, AppError> {
    let first = match timeout {
        Some(limit) => tokio::time::timeout(limit, conn.receive())
            .await
            .unwrap_or(Err(ConnectionError::IdleTimeout)),
        None => conn.receive().await,
    };

    let rejection = match first {
        Ok(Frame::Join { username }) => match validate_username(&username) {
            Ok(username) => return Ok(Some(username)),
            Err(e) => e,
        },
        Ok(other) => AppError::ProtocolViolation(format!(
            "expected JOIN, got {:?}",
            other.frame_type()
        )),
        Err(ConnectionError::Malformed(e)) => AppError::ProtocolViolation(e.to_string()),
        Err(e) => {
            debug!("Connection {} ended before JOIN: {}", conn.id(), e);
            return Ok(None);
        }
    };

    info!("Rejected handshake from {}: {}", conn.id(), rejection);
    conn.send(Frame::JoinReject {
        reason: Reason::from(&rejection),
    })
    .await?;
    Ok(None)
}

/// Write task: outbound queue -> socket
async fn write_loop(mut writer: ConnectionWriter, mut outbound: mpsc::Receiver<Frame>) {
    let close = writer.close_signal();
    loop {
        let frame = tokio::select! {
            biased;
            _ = close.closed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match writer.send(frame).await {
            Ok(()) => {}
            Err(e) if !e.is_fatal() => {
                warn!("Dropping unencodable frame: {}", e);
            }
            Err(e) => {
                debug!("Writer stopped: {}", e);
                break;
            }
        }
    }
    writer.shutdown().await;
}

/// Read task: socket -> ServerCommand
async fn read_loop(
    mut reader: ConnectionReader,
    handle: ConnectionHandle,
    cmd_tx: mpsc::Sender<ServerCommand>,
    username: String,
    config: Arc<Config>,
) {
    let idle_timeout = config.idle_timeout();
    let max_text_body = config.max_frame_bytes.saturating_sub(TEXT_OVERHEAD);

    loop {
        let next = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.receive())
                .await
                .unwrap_or(Err(ConnectionError::IdleTimeout)),
            None => reader.receive().await,
        };

        let refusal = match next {
            Ok(frame) => match frame_to_command(&username, handle.id(), frame, max_text_body) {
                Ok(cmd) => {
                    if cmd_tx.send(cmd).await.is_err() {
                        debug!("Server closed, ending read task for {}", username);
                        break;
                    }
                    continue;
                }
                Err(e) => e,
            },
            Err(ConnectionError::Malformed(e)) => {
                warn!("Malformed frame from {}: {}", username, e);
                AppError::Frame(e)
            }
            Err(ConnectionError::Closed) => {
                debug!("{} closed the connection", username);
                break;
            }
            Err(e) => {
                warn!("Connection error for {}: {}", username, e);
                break;
            }
        };

        if let Err(e) = handle.send(Frame::error(&refusal)) {
            warn!("Could not report error to {}: {}", username, e);
            break;
        }
    }
    debug!("Read task ended for {}", username);
}

/// Convert an inbound frame into a ServerCommand
///
/// Frames only the server may send are refused as protocol violations.
pub fn frame_to_command(
    username: &str,
    connection_id: ConnectionId,
    frame: Frame,
    max_text_body: usize,
) -> Result<ServerCommand, AppError> {
    let username = username.to_string();
    let cmd = match frame {
        Frame::Text { to, body, .. } => {
            if let Recipient::User(name) = &to {
                check_target(name)?;
            }
            if body.len() > max_text_body {
                return Err(AppError::ProtocolViolation(format!(
                    "message body of {} bytes exceeds {}",
                    body.len(),
                    max_text_body
                )));
            }
            ServerCommand::Text {
                username,
                connection_id,
                recipient: to,
                body,
            }
        }
        Frame::ListUsers => ServerCommand::ListUsers {
            username,
            connection_id,
        },
        Frame::FileRequest {
            receiver,
            filename,
            total_size,
        } => {
            check_target(&receiver)?;
            ServerCommand::FileRequest {
                username,
                connection_id,
                receiver,
                filename,
                total_size,
            }
        }
        Frame::FileAccept { transfer_id } => ServerCommand::FileAccept {
            username,
            connection_id,
            transfer_id,
        },
        Frame::FileReject {
            transfer_id,
            reason,
        } => ServerCommand::FileReject {
            username,
            connection_id,
            transfer_id,
            reason: reason.detail,
        },
        Frame::FileChunk(chunk) => ServerCommand::FileChunk {
            username,
            connection_id,
            chunk,
        },
        Frame::FileAck { transfer_id, index } => ServerCommand::FileAck {
            username,
            connection_id,
            transfer_id,
            index,
        },
        Frame::FileAbort {
            transfer_id,
            reason,
        } => ServerCommand::FileAbort {
            username,
            connection_id,
            transfer_id,
            reason: reason.detail,
        },
        Frame::Join { .. } => {
            return Err(AppError::ProtocolViolation(
                "already joined".to_string(),
            ))
        }
        other => {
            return Err(AppError::ProtocolViolation(format!(
                "{:?} is sent by the server only",
                other.frame_type()
            )))
        }
    };
    Ok(cmd)
}

/// No session can hold a name longer than a valid username
fn check_target(name: &str) -> Result<(), AppError> {
    if name.chars().count() > MAX_USERNAME_LEN {
        return Err(AppError::ProtocolViolation(format!(
            "target name longer than {} characters",
            MAX_USERNAME_LEN
        )));
    }
    Ok(())
}
