//! RelayClient definition
//!
//! A thin client over [`Connection`] used by tools and tests: performs the
//! JOIN handshake, then sends and receives whole frames.

use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::connection::Connection;
use crate::error::AppError;
use crate::frame::{ErrorCode, Frame, Reason};
use crate::transfer::split_chunks;
use crate::types::{Recipient, TransferId};

/// Joined client connection
pub struct RelayClient {
    username: String,
    conn: Connection,
}

impl RelayClient {
    /// Connect to `addr` and claim `username`
    ///
    /// A JOIN_REJECT is returned as the matching error.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: &str,
        max_payload: usize,
    ) -> Result<Self, AppError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut conn = Connection::new(stream, max_payload);

        conn.send(Frame::Join {
            username: username.to_string(),
        })
        .await?;

        match conn.receive().await? {
            Frame::JoinOk => {
                debug!("Joined as {}", username);
                Ok(Self {
                    username: username.to_string(),
                    conn,
                })
            }
            Frame::JoinReject { reason } => Err(rejection(username, reason)),
            other => Err(AppError::ProtocolViolation(format!(
                "expected JOIN_OK, got {:?}",
                other.frame_type()
            ))),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), AppError> {
        Ok(self.conn.send(frame).await?)
    }

    pub async fn receive(&mut self) -> Result<Frame, AppError> {
        Ok(self.conn.receive().await?)
    }

    /// Send a text message; the server fills in sender and sequence number
    pub async fn send_text(
        &mut self,
        to: Recipient,
        body: impl Into<Bytes>,
    ) -> Result<(), AppError> {
        self.send(Frame::Text {
            from: String::new(),
            to,
            seq: 0,
            body: body.into(),
        })
        .await
    }

    pub async fn request_file(
        &mut self,
        receiver: &str,
        filename: &str,
        total_size: u64,
    ) -> Result<(), AppError> {
        self.send(Frame::FileRequest {
            receiver: receiver.to_string(),
            filename: filename.to_string(),
            total_size,
        })
        .await
    }

    /// Stream `data` as FILE_CHUNK frames of `chunk_size` bytes
    ///
    /// Returns the number of chunks written.
    pub async fn send_file_data(
        &mut self,
        transfer_id: TransferId,
        data: Bytes,
        chunk_size: u32,
    ) -> Result<u32, AppError> {
        let mut sent = 0;
        for chunk in split_chunks(transfer_id, data, chunk_size) {
            self.send(Frame::FileChunk(chunk)).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Close the connection
    pub fn close(&self) -> bool {
        self.conn.close()
    }
}

fn rejection(username: &str, reason: Reason) -> AppError {
    match reason.code {
        ErrorCode::UsernameTaken => AppError::UsernameTaken(username.to_string()),
        ErrorCode::InvalidUsername => AppError::InvalidUsername(reason.detail),
        _ => AppError::ProtocolViolation(reason.detail),
    }
}
