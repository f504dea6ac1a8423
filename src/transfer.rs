//! File transfer coordinator
//!
//! Tracks every in-flight transfer and relays its chunks between sender and
//! receiver. Each transfer moves through
//!
//! ```text
//! INIT --accept--> IN_PROGRESS --last chunk acked--> COMPLETE
//!   \                  |
//!    +-----------------+--> ABORTED (reject, cancel, mismatch, disconnect)
//! ```
//!
//! Terminal transfers are removed from the table immediately; the returned
//! [`TransferState`] tells the caller how an operation ended.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::activity::{ActivityEvent, ActivityLog, EventKind};
use crate::error::AppError;
use crate::frame::{ErrorCode, Frame, Reason};
use crate::session::SessionRegistry;
use crate::types::TransferId;

/// Default chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// One bounded slice of a file in transit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub transfer_id: TransferId,
    pub index: u32,
    pub is_last: bool,
    pub data: Bytes,
}

/// Number of chunks needed for `total_size` bytes, if it fits in a `u32`
pub fn chunk_count(total_size: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(total_size.div_ceil(u64::from(chunk_size))).ok()
}

/// Split `data` into the chunks a sender streams for `transfer_id`
pub fn split_chunks(
    transfer_id: TransferId,
    data: Bytes,
    chunk_size: u32,
) -> impl Iterator<Item = Chunk> {
    let chunk_size = chunk_size.max(1) as usize;
    let total = data.len().div_ceil(chunk_size);
    (0..total).map(move |i| {
        let start = i * chunk_size;
        let end = (start + chunk_size).min(data.len());
        Chunk {
            transfer_id,
            index: i as u32,
            is_last: i + 1 == total,
            data: data.slice(start..end),
        }
    })
}

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Offered to the receiver, not yet accepted
    Init,
    /// Accepted; chunks are flowing
    InProgress,
    /// Last chunk delivered and acknowledged
    Complete,
    /// Cancelled, rejected, inconsistent or a participant left
    Aborted,
}

/// Bookkeeping for one transfer
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub id: TransferId,
    pub sender: String,
    pub receiver: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub chunks_sent: u32,
    pub chunks_acked: u32,
    pub state: TransferState,
    pub created_at: DateTime<Utc>,
}

impl FileTransfer {
    pub fn involves(&self, username: &str) -> bool {
        self.sender == username || self.receiver == username
    }

    /// The other participant
    pub fn peer_of(&self, username: &str) -> Option<&str> {
        if self.sender == username {
            Some(&self.receiver)
        } else if self.receiver == username {
            Some(&self.sender)
        } else {
            None
        }
    }

    /// Exact data length required for chunk `index`
    pub fn expected_len(&self, index: u32) -> usize {
        let chunk_size = u64::from(self.chunk_size);
        if index.saturating_add(1) < self.total_chunks {
            return self.chunk_size as usize;
        }
        match self.total_size % chunk_size {
            0 => self.chunk_size as usize,
            rem => rem as usize,
        }
    }

    /// Validate the next chunk from the sender
    fn check_chunk(&self, chunk: &Chunk) -> Result<(), Reason> {
        if chunk.index >= self.total_chunks {
            return Err(Reason::new(
                ErrorCode::SizeMismatch,
                format!(
                    "chunk {} beyond the {} chunks of this file",
                    chunk.index, self.total_chunks
                ),
            ));
        }
        if chunk.index != self.chunks_sent {
            return Err(Reason::new(
                ErrorCode::ProtocolViolation,
                format!("expected chunk {}, got {}", self.chunks_sent, chunk.index),
            ));
        }
        let expected = self.expected_len(chunk.index);
        if chunk.data.len() != expected {
            return Err(Reason::new(
                ErrorCode::SizeMismatch,
                format!(
                    "chunk {} has {} bytes, expected {}",
                    chunk.index,
                    chunk.data.len(),
                    expected
                ),
            ));
        }
        if chunk.is_last != (chunk.index + 1 == self.total_chunks) {
            return Err(Reason::new(
                ErrorCode::ProtocolViolation,
                format!("chunk {} has wrong last flag", chunk.index),
            ));
        }
        Ok(())
    }
}

/// Owner of all in-flight transfers
pub struct TransferCoordinator {
    transfers: HashMap<TransferId, FileTransfer>,
    chunk_size: u32,
    log: Arc<dyn ActivityLog>,
}

impl TransferCoordinator {
    pub fn new(chunk_size: u32, log: Arc<dyn ActivityLog>) -> Self {
        Self {
            transfers: HashMap::new(),
            chunk_size,
            log,
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn get(&self, id: TransferId) -> Option<&FileTransfer> {
        self.transfers.get(&id)
    }

    /// Number of transfers still in flight
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Handle FILE_REQUEST from `sender`
    ///
    /// The sender always hears back: FILE_PENDING when the offer reached the
    /// receiver, FILE_ABORT otherwise.
    pub fn request(
        &mut self,
        sessions: &mut SessionRegistry,
        sender: &str,
        receiver: &str,
        filename: &str,
        total_size: u64,
    ) -> (TransferId, TransferState) {
        let id = TransferId::generate();

        if let Err(reason) = self.check_request(sessions, sender, receiver, filename, total_size) {
            info!("Transfer {} from {} refused: {}", id, sender, reason);
            notify(
                sessions,
                sender,
                Frame::FileAbort {
                    transfer_id: id,
                    reason: reason.clone(),
                },
            );
            self.log.record(ActivityEvent::now(
                EventKind::TransferAborted,
                format!("{} {} -> {} '{}': {}", id, sender, receiver, filename, reason),
            ));
            return (id, TransferState::Aborted);
        }

        let total_chunks = chunk_count(total_size, self.chunk_size).unwrap_or_default();
        let transfer = FileTransfer {
            id,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            filename: filename.to_string(),
            total_size,
            chunk_size: self.chunk_size,
            total_chunks,
            chunks_sent: 0,
            chunks_acked: 0,
            state: TransferState::Init,
            created_at: Utc::now(),
        };

        let offer = Frame::FileOffer {
            transfer_id: id,
            sender: transfer.sender.clone(),
            filename: transfer.filename.clone(),
            total_size,
            chunk_size: self.chunk_size,
        };
        let pending = Frame::FilePending {
            transfer_id: id,
            receiver: transfer.receiver.clone(),
            filename: transfer.filename.clone(),
            total_size,
            chunk_size: self.chunk_size,
        };

        self.log.record(ActivityEvent::now(
            EventKind::TransferStarted,
            format!(
                "{} {} -> {} '{}' ({} bytes, {} chunks)",
                id, sender, receiver, filename, total_size, total_chunks
            ),
        ));
        self.transfers.insert(id, transfer);

        if !notify(sessions, receiver, offer) {
            let reason = Reason::new(
                ErrorCode::RecipientOffline,
                format!("User '{}' is not online", receiver),
            );
            return (id, self.abort(sessions, id, reason, Some(receiver)));
        }
        if !notify(sessions, sender, pending) {
            let reason = Reason::new(ErrorCode::PeerDisconnected, "sender went away");
            return (id, self.abort(sessions, id, reason, Some(sender)));
        }

        (id, TransferState::Init)
    }

    fn check_request(
        &self,
        sessions: &SessionRegistry,
        sender: &str,
        receiver: &str,
        filename: &str,
        total_size: u64,
    ) -> Result<(), Reason> {
        if filename.trim().is_empty() {
            return Err(Reason::new(ErrorCode::ProtocolViolation, "filename is empty"));
        }
        if receiver == sender {
            return Err(Reason::new(
                ErrorCode::ProtocolViolation,
                "You cannot send a file to yourself",
            ));
        }
        if total_size == 0 {
            return Err(Reason::new(ErrorCode::SizeMismatch, "file is empty"));
        }
        if chunk_count(total_size, self.chunk_size).is_none() {
            return Err(Reason::new(
                ErrorCode::SizeMismatch,
                format!("{} bytes is too large to transfer", total_size),
            ));
        }
        if sessions.lookup(receiver).is_none() {
            return Err(Reason::new(
                ErrorCode::RecipientOffline,
                format!("User '{}' is not online", receiver),
            ));
        }
        Ok(())
    }

    /// Handle FILE_ACCEPT from the receiver
    pub fn accept(
        &mut self,
        sessions: &mut SessionRegistry,
        from: &str,
        id: TransferId,
    ) -> Result<TransferState, AppError> {
        let transfer = self.participant(id, from)?;
        if transfer.receiver != from {
            return Err(AppError::ProtocolViolation(
                "only the receiver can accept a transfer".to_string(),
            ));
        }
        if transfer.state != TransferState::Init {
            return Err(AppError::ProtocolViolation(format!(
                "transfer {} already accepted",
                id
            )));
        }

        transfer.state = TransferState::InProgress;
        let sender = transfer.sender.clone();
        debug!("Transfer {} accepted by {}", id, from);

        if !notify(sessions, &sender, Frame::FileAccept { transfer_id: id }) {
            let reason = Reason::new(ErrorCode::PeerDisconnected, "sender went away");
            return Ok(self.abort(sessions, id, reason, Some(&sender)));
        }
        Ok(TransferState::InProgress)
    }

    /// Handle FILE_REJECT from the receiver
    pub fn reject(
        &mut self,
        sessions: &mut SessionRegistry,
        from: &str,
        id: TransferId,
        detail: &str,
    ) -> Result<TransferState, AppError> {
        let transfer = self.participant(id, from)?;
        if transfer.receiver != from || transfer.state != TransferState::Init {
            return Err(AppError::ProtocolViolation(
                "only a pending offer can be rejected by its receiver".to_string(),
            ));
        }

        let transfer = self.remove(id);
        let reason = Reason::new(ErrorCode::Rejected, detail);
        if let Some(transfer) = transfer {
            self.record_abort(&transfer, &reason);
            notify(
                sessions,
                &transfer.sender,
                Frame::FileReject {
                    transfer_id: id,
                    reason: reason.clone(),
                },
            );
        }
        Ok(TransferState::Aborted)
    }

    /// Handle FILE_CHUNK from the sender
    ///
    /// Any inconsistency aborts the transfer and both participants are told.
    pub fn chunk(
        &mut self,
        sessions: &mut SessionRegistry,
        from: &str,
        chunk: Chunk,
    ) -> Result<TransferState, AppError> {
        let id = chunk.transfer_id;
        let transfer = self.participant(id, from)?;
        if transfer.sender != from {
            return Err(AppError::ProtocolViolation(
                "only the sender can send chunks".to_string(),
            ));
        }

        let checked = if transfer.state != TransferState::InProgress {
            Err(Reason::new(
                ErrorCode::ProtocolViolation,
                "chunk sent before the receiver accepted",
            ))
        } else {
            transfer.check_chunk(&chunk)
        };
        if let Err(reason) = checked {
            warn!("Transfer {} chunk rejected: {}", id, reason);
            return Ok(self.abort(sessions, id, reason, None));
        }

        let receiver = transfer.receiver.clone();
        let index = chunk.index;
        if !notify(sessions, &receiver, Frame::FileChunk(chunk)) {
            let reason = Reason::new(ErrorCode::PeerDisconnected, "receiver went away");
            return Ok(self.abort(sessions, id, reason, Some(&receiver)));
        }

        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.chunks_sent = index + 1;
        }
        Ok(TransferState::InProgress)
    }

    /// Handle FILE_ACK from the receiver
    ///
    /// Acks are cumulative; an ack below the acknowledged count is ignored.
    pub fn ack(
        &mut self,
        sessions: &mut SessionRegistry,
        from: &str,
        id: TransferId,
        index: u32,
    ) -> Result<TransferState, AppError> {
        let transfer = self.participant(id, from)?;
        if transfer.receiver != from || transfer.state != TransferState::InProgress {
            return Err(AppError::ProtocolViolation(
                "only the receiver of an accepted transfer can acknowledge".to_string(),
            ));
        }

        if index >= transfer.chunks_sent {
            let reason = Reason::new(
                ErrorCode::ProtocolViolation,
                format!(
                    "ack for chunk {} but only {} sent",
                    index, transfer.chunks_sent
                ),
            );
            return Ok(self.abort(sessions, id, reason, None));
        }
        if index < transfer.chunks_acked {
            debug!("Transfer {} stale ack {}", id, index);
            return Ok(TransferState::InProgress);
        }

        transfer.chunks_acked = index + 1;
        let complete = transfer.chunks_acked == transfer.total_chunks;
        let sender = transfer.sender.clone();

        if !notify(sessions, &sender, Frame::FileAck { transfer_id: id, index }) {
            let reason = Reason::new(ErrorCode::PeerDisconnected, "sender went away");
            return Ok(self.abort(sessions, id, reason, Some(&sender)));
        }

        if !complete {
            return Ok(TransferState::InProgress);
        }

        if let Some(mut transfer) = self.remove(id) {
            transfer.state = TransferState::Complete;
            info!("Transfer {} complete", id);
            self.log.record(ActivityEvent::now(
                EventKind::TransferCompleted,
                format!(
                    "{} {} -> {} '{}' ({} bytes)",
                    id, transfer.sender, transfer.receiver, transfer.filename, transfer.total_size
                ),
            ));
            notify(sessions, &transfer.sender, Frame::FileDone { transfer_id: id });
            notify(sessions, &transfer.receiver, Frame::FileDone { transfer_id: id });
        }
        Ok(TransferState::Complete)
    }

    /// Handle FILE_ABORT from either participant
    ///
    /// Both participants get FILE_ABORT(Cancelled), the canceller as confirmation.
    pub fn cancel(
        &mut self,
        sessions: &mut SessionRegistry,
        from: &str,
        id: TransferId,
        detail: &str,
    ) -> Result<TransferState, AppError> {
        self.participant(id, from)?;
        let reason = Reason::new(ErrorCode::Cancelled, format!("cancelled by {}: {}", from, detail));
        Ok(self.abort(sessions, id, reason, None))
    }

    /// Abort every transfer `username` takes part in
    pub fn abort_for_session(
        &mut self,
        sessions: &mut SessionRegistry,
        username: &str,
    ) -> Vec<TransferId> {
        let ids: Vec<TransferId> = self
            .transfers
            .values()
            .filter(|t| t.involves(username))
            .map(|t| t.id)
            .collect();

        for id in &ids {
            let reason = Reason::new(
                ErrorCode::PeerDisconnected,
                format!("{} disconnected", username),
            );
            self.abort(sessions, *id, reason, Some(username));
        }
        ids
    }

    fn participant(&mut self, id: TransferId, username: &str) -> Result<&mut FileTransfer, AppError> {
        self.transfers
            .get_mut(&id)
            .filter(|t| t.involves(username))
            .ok_or(AppError::UnknownTransfer(id))
    }

    fn remove(&mut self, id: TransferId) -> Option<FileTransfer> {
        self.transfers.remove(&id)
    }

    /// Drop the transfer and send FILE_ABORT to each participant but `skip`
    fn abort(
        &mut self,
        sessions: &mut SessionRegistry,
        id: TransferId,
        reason: Reason,
        skip: Option<&str>,
    ) -> TransferState {
        let Some(mut transfer) = self.remove(id) else {
            return TransferState::Aborted;
        };
        transfer.state = TransferState::Aborted;
        info!("Transfer {} aborted: {}", id, reason);
        self.record_abort(&transfer, &reason);

        for party in [&transfer.sender, &transfer.receiver] {
            if skip == Some(party.as_str()) {
                continue;
            }
            notify(
                sessions,
                party,
                Frame::FileAbort {
                    transfer_id: id,
                    reason: reason.clone(),
                },
            );
        }

        TransferState::Aborted
    }

    fn record_abort(&self, transfer: &FileTransfer, reason: &Reason) {
        self.log.record(ActivityEvent::now(
            EventKind::TransferAborted,
            format!(
                "{} {} -> {} '{}' after {}/{} chunks: {}",
                transfer.id,
                transfer.sender,
                transfer.receiver,
                transfer.filename,
                transfer.chunks_acked,
                transfer.total_chunks,
                reason
            ),
        ));
    }
}

/// Send to an active session; a failed send evicts it
fn notify(sessions: &mut SessionRegistry, username: &str, frame: Frame) -> bool {
    let Some(session) = sessions.lookup(username) else {
        return false;
    };
    match session.send(frame) {
        Ok(()) => true,
        Err(e) => {
            warn!("Dropping session {}: {}", username, e);
            sessions.mark_closing(username);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::activity::MemoryActivityLog;
    use crate::connection::{CloseSignal, ConnectionHandle};
    use crate::types::ConnectionId;

    struct Fixture {
        sessions: SessionRegistry,
        coordinator: TransferCoordinator,
        log: MemoryActivityLog,
        alice: mpsc::Receiver<Frame>,
        bob: mpsc::Receiver<Frame>,
    }

    impl Fixture {
        fn new(chunk_size: u32) -> Self {
            let log = MemoryActivityLog::new();
            let mut sessions = SessionRegistry::new();
            let alice = join(&mut sessions, "alice");
            let bob = join(&mut sessions, "bob");
            Self {
                sessions,
                coordinator: TransferCoordinator::new(chunk_size, Arc::new(log.clone())),
                log,
                alice,
                bob,
            }
        }

        fn request(&mut self, total_size: u64) -> (TransferId, TransferState) {
            self.coordinator
                .request(&mut self.sessions, "alice", "bob", "photo.jpg", total_size)
        }

        /// Request and accept, draining the handshake frames
        fn started(&mut self, total_size: u64) -> TransferId {
            let (id, state) = self.request(total_size);
            assert_eq!(state, TransferState::Init);
            assert!(matches!(self.bob.try_recv().unwrap(), Frame::FileOffer { .. }));
            assert!(matches!(self.alice.try_recv().unwrap(), Frame::FilePending { .. }));

            let state = self.coordinator.accept(&mut self.sessions, "bob", id).unwrap();
            assert_eq!(state, TransferState::InProgress);
            assert_eq!(self.alice.try_recv().unwrap(), Frame::FileAccept { transfer_id: id });
            id
        }
    }

    fn join(sessions: &mut SessionRegistry, name: &str) -> mpsc::Receiver<Frame> {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::new(), CloseSignal::new(), 64);
        sessions.admit(name.to_string(), handle).unwrap();
        rx
    }

    fn abort_code(frame: Frame) -> ErrorCode {
        match frame {
            Frame::FileAbort { reason, .. } => reason.code,
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(10_000, 4096), Some(3));
        assert_eq!(chunk_count(8192, 4096), Some(2));
        assert_eq!(chunk_count(1, 4096), Some(1));
        assert_eq!(chunk_count(u64::MAX, 1), None);
        assert_eq!(chunk_count(10, 0), None);
    }

    #[test]
    fn test_split_chunks_sizes() {
        let id = TransferId::generate();
        let chunks: Vec<_> = split_chunks(id, Bytes::from(vec![7u8; 10_000]), 4096).collect();

        let sizes: Vec<_> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
        assert!(chunks[2].is_last);
        assert_eq!(chunks[2].index, 2);
    }

    #[test]
    fn test_full_transfer_completes_after_last_ack() {
        let mut fx = Fixture::new(4096);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let id = fx.started(data.len() as u64);

        for chunk in split_chunks(id, Bytes::from(data.clone()), 4096) {
            let state = fx.coordinator.chunk(&mut fx.sessions, "alice", chunk).unwrap();
            assert_eq!(state, TransferState::InProgress);
        }
        assert_eq!(fx.coordinator.get(id).unwrap().chunks_sent, 3);

        let mut received = Vec::new();
        while let Ok(Frame::FileChunk(chunk)) = fx.bob.try_recv() {
            received.extend_from_slice(&chunk.data);
        }
        assert_eq!(received, data);

        for index in 0..2 {
            let state = fx.coordinator.ack(&mut fx.sessions, "bob", id, index).unwrap();
            assert_eq!(state, TransferState::InProgress);
        }
        assert_eq!(fx.coordinator.get(id).unwrap().state, TransferState::InProgress);

        let state = fx.coordinator.ack(&mut fx.sessions, "bob", id, 2).unwrap();
        assert_eq!(state, TransferState::Complete);
        assert!(fx.coordinator.get(id).is_none());

        for index in 0..3 {
            assert_eq!(fx.alice.try_recv().unwrap(), Frame::FileAck { transfer_id: id, index });
        }
        assert_eq!(fx.alice.try_recv().unwrap(), Frame::FileDone { transfer_id: id });
        assert_eq!(fx.bob.try_recv().unwrap(), Frame::FileDone { transfer_id: id });
        assert_eq!(fx.log.count(EventKind::TransferStarted), 1);
        assert_eq!(fx.log.count(EventKind::TransferCompleted), 1);
    }

    #[test]
    fn test_cumulative_ack() {
        let mut fx = Fixture::new(4);
        let id = fx.started(10);
        for chunk in split_chunks(id, Bytes::from_static(b"0123456789"), 4) {
            fx.coordinator.chunk(&mut fx.sessions, "alice", chunk).unwrap();
        }

        let state = fx.coordinator.ack(&mut fx.sessions, "bob", id, 1).unwrap();
        assert_eq!(state, TransferState::InProgress);
        assert_eq!(fx.coordinator.get(id).unwrap().chunks_acked, 2);

        // stale ack is ignored
        let state = fx.coordinator.ack(&mut fx.sessions, "bob", id, 0).unwrap();
        assert_eq!(state, TransferState::InProgress);

        let state = fx.coordinator.ack(&mut fx.sessions, "bob", id, 2).unwrap();
        assert_eq!(state, TransferState::Complete);
    }

    #[test]
    fn test_offline_receiver_aborts_immediately() {
        let mut fx = Fixture::new(4096);
        let (id, state) =
            fx.coordinator
                .request(&mut fx.sessions, "alice", "carol", "a.txt", 10);

        assert_eq!(state, TransferState::Aborted);
        assert!(fx.coordinator.get(id).is_none());
        match fx.alice.try_recv().unwrap() {
            Frame::FileAbort { transfer_id, reason } => {
                assert_eq!(transfer_id, id);
                assert_eq!(reason.code, ErrorCode::RecipientOffline);
            }
            other => panic!("Wrong frame: {:?}", other),
        }
        assert_eq!(fx.log.count(EventKind::TransferAborted), 1);
    }

    #[test]
    fn test_invalid_requests() {
        let mut fx = Fixture::new(4096);

        let (_, state) = fx.request(0);
        assert_eq!(state, TransferState::Aborted);
        assert_eq!(abort_code(fx.alice.try_recv().unwrap()), ErrorCode::SizeMismatch);

        let (_, state) = fx
            .coordinator
            .request(&mut fx.sessions, "alice", "alice", "a.txt", 10);
        assert_eq!(state, TransferState::Aborted);
        assert_eq!(abort_code(fx.alice.try_recv().unwrap()), ErrorCode::ProtocolViolation);

        let (_, state) = fx
            .coordinator
            .request(&mut fx.sessions, "alice", "bob", " ", 10);
        assert_eq!(state, TransferState::Aborted);
        assert_eq!(abort_code(fx.alice.try_recv().unwrap()), ErrorCode::ProtocolViolation);

        assert!(fx.bob.try_recv().is_err());
        assert!(fx.coordinator.is_empty());
    }

    #[test]
    fn test_receiver_rejects() {
        let mut fx = Fixture::new(4096);
        let (id, _) = fx.request(100);
        fx.bob.try_recv().unwrap();
        fx.alice.try_recv().unwrap();

        let state = fx
            .coordinator
            .reject(&mut fx.sessions, "bob", id, "no thanks")
            .unwrap();
        assert_eq!(state, TransferState::Aborted);
        match fx.alice.try_recv().unwrap() {
            Frame::FileReject { transfer_id, reason } => {
                assert_eq!(transfer_id, id);
                assert_eq!(reason.code, ErrorCode::Rejected);
                assert_eq!(reason.detail, "no thanks");
            }
            other => panic!("Wrong frame: {:?}", other),
        }
        assert!(fx.coordinator.is_empty());
    }

    #[test]
    fn test_only_receiver_accepts() {
        let mut fx = Fixture::new(4096);
        let (id, _) = fx.request(100);

        let err = fx.coordinator.accept(&mut fx.sessions, "alice", id).unwrap_err();
        assert!(matches!(err, AppError::ProtocolViolation(_)));

        let err = fx.coordinator.accept(&mut fx.sessions, "carol", id).unwrap_err();
        assert!(matches!(err, AppError::UnknownTransfer(_)));

        assert_eq!(fx.coordinator.get(id).unwrap().state, TransferState::Init);
    }

    #[test]
    fn test_chunk_size_mismatch_aborts_both() {
        let mut fx = Fixture::new(4096);
        let id = fx.started(10_000);

        let short = Chunk {
            transfer_id: id,
            index: 0,
            is_last: false,
            data: Bytes::from(vec![0u8; 100]),
        };
        let state = fx.coordinator.chunk(&mut fx.sessions, "alice", short).unwrap();

        assert_eq!(state, TransferState::Aborted);
        assert_eq!(abort_code(fx.alice.try_recv().unwrap()), ErrorCode::SizeMismatch);
        assert_eq!(abort_code(fx.bob.try_recv().unwrap()), ErrorCode::SizeMismatch);
        assert!(fx.coordinator.is_empty());
    }

    #[test]
    fn test_out_of_order_chunk_aborts() {
        let mut fx = Fixture::new(4);
        let id = fx.started(10);

        let skipped = Chunk {
            transfer_id: id,
            index: 1,
            is_last: false,
            data: Bytes::from_static(b"4567"),
        };
        let state = fx.coordinator.chunk(&mut fx.sessions, "alice", skipped).unwrap();

        assert_eq!(state, TransferState::Aborted);
        assert_eq!(abort_code(fx.bob.try_recv().unwrap()), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_wrong_last_flag_aborts() {
        let mut fx = Fixture::new(4);
        let id = fx.started(8);

        let early_last = Chunk {
            transfer_id: id,
            index: 0,
            is_last: true,
            data: Bytes::from_static(b"0123"),
        };
        let state = fx.coordinator.chunk(&mut fx.sessions, "alice", early_last).unwrap();
        assert_eq!(state, TransferState::Aborted);
    }

    #[test]
    fn test_chunk_before_accept_aborts() {
        let mut fx = Fixture::new(4);
        let (id, _) = fx.request(4);

        let chunk = Chunk {
            transfer_id: id,
            index: 0,
            is_last: true,
            data: Bytes::from_static(b"0123"),
        };
        let state = fx.coordinator.chunk(&mut fx.sessions, "alice", chunk).unwrap();
        assert_eq!(state, TransferState::Aborted);
    }

    #[test]
    fn test_ack_beyond_sent_aborts() {
        let mut fx = Fixture::new(4);
        let id = fx.started(10);

        let state = fx.coordinator.ack(&mut fx.sessions, "bob", id, 0).unwrap();
        assert_eq!(state, TransferState::Aborted);
    }

    #[test]
    fn test_receiver_disconnect_mid_transfer() {
        let mut fx = Fixture::new(4096);
        let id = fx.started(10_000);
        let mut chunks = split_chunks(id, Bytes::from(vec![1u8; 10_000]), 4096);

        fx.coordinator
            .chunk(&mut fx.sessions, "alice", chunks.next().unwrap())
            .unwrap();
        fx.coordinator.ack(&mut fx.sessions, "bob", id, 0).unwrap();
        assert_eq!(fx.alice.try_recv().unwrap(), Frame::FileAck { transfer_id: id, index: 0 });

        fx.sessions.remove("bob");
        let aborted = fx.coordinator.abort_for_session(&mut fx.sessions, "bob");
        assert_eq!(aborted, vec![id]);

        match fx.alice.try_recv().unwrap() {
            Frame::FileAbort { transfer_id, reason } => {
                assert_eq!(transfer_id, id);
                assert_eq!(reason.code, ErrorCode::PeerDisconnected);
            }
            other => panic!("Wrong frame: {:?}", other),
        }

        let err = fx
            .coordinator
            .chunk(&mut fx.sessions, "alice", chunks.next().unwrap())
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownTransfer(_)));
        assert_eq!(fx.log.count(EventKind::TransferAborted), 1);
    }

    #[test]
    fn test_receiver_gone_before_cleanup() {
        let mut fx = Fixture::new(4);
        let id = fx.started(8);

        fx.sessions.mark_closing("bob");
        let chunk = Chunk {
            transfer_id: id,
            index: 0,
            is_last: false,
            data: Bytes::from_static(b"0123"),
        };
        let state = fx.coordinator.chunk(&mut fx.sessions, "alice", chunk).unwrap();

        assert_eq!(state, TransferState::Aborted);
        assert_eq!(abort_code(fx.alice.try_recv().unwrap()), ErrorCode::PeerDisconnected);
        assert!(fx.bob.try_recv().is_err());
    }

    #[test]
    fn test_cancel_notifies_both() {
        let mut fx = Fixture::new(4096);
        let id = fx.started(100);

        let state = fx
            .coordinator
            .cancel(&mut fx.sessions, "alice", id, "changed my mind")
            .unwrap();

        assert_eq!(state, TransferState::Aborted);
        assert_eq!(abort_code(fx.alice.try_recv().unwrap()), ErrorCode::Cancelled);
        assert_eq!(abort_code(fx.bob.try_recv().unwrap()), ErrorCode::Cancelled);
        assert!(fx.coordinator.is_empty());
    }

    #[test]
    fn test_chunk_past_last_aborts() {
        let mut fx = Fixture::new(4096);
        let id = fx.started(10_000);

        for chunk in split_chunks(id, Bytes::from(vec![3u8; 10_000]), 4096) {
            fx.coordinator.chunk(&mut fx.sessions, "alice", chunk).unwrap();
        }
        assert_eq!(fx.coordinator.get(id).unwrap().chunks_sent, 3);
        while fx.bob.try_recv().is_ok() {}

        let extra = Chunk {
            transfer_id: id,
            index: 3,
            is_last: true,
            data: Bytes::from(vec![3u8; 10]),
        };
        let state = fx.coordinator.chunk(&mut fx.sessions, "alice", extra).unwrap();

        assert_eq!(state, TransferState::Aborted);
        assert_eq!(abort_code(fx.alice.try_recv().unwrap()), ErrorCode::SizeMismatch);
        assert_eq!(abort_code(fx.bob.try_recv().unwrap()), ErrorCode::SizeMismatch);
        assert!(fx.coordinator.get(id).is_none());
        assert_eq!(fx.log.count(EventKind::TransferAborted), 1);
    }
}
