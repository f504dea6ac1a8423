//! Frame protocol definitions
//!
//! Binary, typed frames exchanged in both directions. Every frame on the
//! wire is `[u32 payload length][u8 type][payload]`; this module owns the
//! type codes and payload layouts, `codec` owns the outer framing.
//!
//! Payload fields are big-endian. Strings are a `u16` byte length followed
//! by UTF-8, transfer ids are 16 raw bytes and a reason is a `u8` code
//! followed by a detail string. Trailing opaque data (message bodies,
//! chunk data) runs to the end of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{AppError, FrameError};
use crate::transfer::Chunk;
use crate::types::{Recipient, TransferId, MAX_USERNAME_LEN};

/// Length prefix plus type byte
pub const HEADER_LEN: usize = 5;

/// Payload bytes a FILE_CHUNK spends before its data (id, index, flag)
pub const CHUNK_OVERHEAD: usize = 16 + 4 + 1;

/// Upper bound on the TEXT bytes around the body once the server has
/// stamped sender and sequence number
pub const TEXT_OVERHEAD: usize = 2 * (2 + MAX_USERNAME_LEN * 4) + 1 + 8;

/// Reason details longer than this are cut when encoded
pub const MAX_REASON_DETAIL: usize = 1024;

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Join = 0x01,
    JoinOk = 0x02,
    JoinReject = 0x03,
    Text = 0x10,
    System = 0x11,
    ListUsers = 0x12,
    UserList = 0x13,
    FileRequest = 0x20,
    FileOffer = 0x21,
    FilePending = 0x22,
    FileAccept = 0x23,
    FileReject = 0x24,
    FileChunk = 0x25,
    FileAck = 0x26,
    FileAbort = 0x27,
    FileDone = 0x28,
    Error = 0x7f,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x01 => FrameType::Join,
            0x02 => FrameType::JoinOk,
            0x03 => FrameType::JoinReject,
            0x10 => FrameType::Text,
            0x11 => FrameType::System,
            0x12 => FrameType::ListUsers,
            0x13 => FrameType::UserList,
            0x20 => FrameType::FileRequest,
            0x21 => FrameType::FileOffer,
            0x22 => FrameType::FilePending,
            0x23 => FrameType::FileAccept,
            0x24 => FrameType::FileReject,
            0x25 => FrameType::FileChunk,
            0x26 => FrameType::FileAck,
            0x27 => FrameType::FileAbort,
            0x28 => FrameType::FileDone,
            0x7f => FrameType::Error,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

/// Reason codes carried by JOIN_REJECT, FILE_REJECT, FILE_ABORT and ERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Username already claimed
    UsernameTaken = 1,
    /// Username failed validation
    InvalidUsername = 2,
    /// Target has no active session
    RecipientOffline = 3,
    /// Receiver declined a transfer
    Rejected = 4,
    /// A participant cancelled a transfer
    Cancelled = 5,
    /// Chunk or total size inconsistency
    SizeMismatch = 6,
    /// Frame not allowed in the current state
    ProtocolViolation = 7,
    /// The other participant went away
    PeerDisconnected = 8,
    /// Transfer id not known for this session
    UnknownTransfer = 9,
}

impl TryFrom<u8> for ErrorCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            1 => ErrorCode::UsernameTaken,
            2 => ErrorCode::InvalidUsername,
            3 => ErrorCode::RecipientOffline,
            4 => ErrorCode::Rejected,
            5 => ErrorCode::Cancelled,
            6 => ErrorCode::SizeMismatch,
            7 => ErrorCode::ProtocolViolation,
            8 => ErrorCode::PeerDisconnected,
            9 => ErrorCode::UnknownTransfer,
            value => {
                return Err(FrameError::InvalidValue {
                    field: "reason code",
                    value,
                })
            }
        })
    }
}

/// Machine-readable code plus a human-readable detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub code: ErrorCode,
    pub detail: String,
}

impl Reason {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.detail)
    }
}

/// Convert AppError to a wire reason for client notification
impl From<&AppError> for Reason {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::UsernameTaken(_) => ErrorCode::UsernameTaken,
            AppError::InvalidUsername(_) => ErrorCode::InvalidUsername,
            AppError::RecipientOffline(_) => ErrorCode::RecipientOffline,
            AppError::SizeMismatch(_) => ErrorCode::SizeMismatch,
            AppError::UnknownTransfer(_) => ErrorCode::UnknownTransfer,
            // Fatal errors are not typically converted (connection closes)
            _ => ErrorCode::ProtocolViolation,
        };
        Reason::new(code, err.to_string())
    }
}

/// One typed unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client → server: claim a username
    Join { username: String },
    /// Server → client: username accepted
    JoinOk,
    /// Server → client: username refused, connection closes
    JoinReject { reason: Reason },
    /// Text message; clients leave `from` empty and `seq` zero
    Text {
        from: String,
        to: Recipient,
        seq: u64,
        body: Bytes,
    },
    /// Server → client notice
    System { text: String },
    /// Client → server: ask for the active usernames
    ListUsers,
    /// Server → client: active usernames
    UserList { usernames: Vec<String> },
    /// Sender → server: start a transfer
    FileRequest {
        receiver: String,
        filename: String,
        total_size: u64,
    },
    /// Server → receiver: incoming transfer
    FileOffer {
        transfer_id: TransferId,
        sender: String,
        filename: String,
        total_size: u64,
        chunk_size: u32,
    },
    /// Server → sender: transfer created, waiting for the receiver
    FilePending {
        transfer_id: TransferId,
        receiver: String,
        filename: String,
        total_size: u64,
        chunk_size: u32,
    },
    FileAccept { transfer_id: TransferId },
    FileReject { transfer_id: TransferId, reason: Reason },
    FileChunk(Chunk),
    FileAck { transfer_id: TransferId, index: u32 },
    FileAbort { transfer_id: TransferId, reason: Reason },
    /// Server → both participants: last chunk acknowledged
    FileDone { transfer_id: TransferId },
    /// Server → client: the last operation was refused
    Error { reason: Reason },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Join { .. } => FrameType::Join,
            Frame::JoinOk => FrameType::JoinOk,
            Frame::JoinReject { .. } => FrameType::JoinReject,
            Frame::Text { .. } => FrameType::Text,
            Frame::System { .. } => FrameType::System,
            Frame::ListUsers => FrameType::ListUsers,
            Frame::UserList { .. } => FrameType::UserList,
            Frame::FileRequest { .. } => FrameType::FileRequest,
            Frame::FileOffer { .. } => FrameType::FileOffer,
            Frame::FilePending { .. } => FrameType::FilePending,
            Frame::FileAccept { .. } => FrameType::FileAccept,
            Frame::FileReject { .. } => FrameType::FileReject,
            Frame::FileChunk(_) => FrameType::FileChunk,
            Frame::FileAck { .. } => FrameType::FileAck,
            Frame::FileAbort { .. } => FrameType::FileAbort,
            Frame::FileDone { .. } => FrameType::FileDone,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Shorthand for an ERROR frame built from an application error
    pub fn error(err: &AppError) -> Self {
        Frame::Error { reason: err.into() }
    }

    /// Append this frame's payload (without header) to `buf`
    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        match self {
            Frame::Join { username } => put_str(buf, "username", username)?,
            Frame::JoinOk | Frame::ListUsers => {}
            Frame::JoinReject { reason } | Frame::Error { reason } => put_reason(buf, reason)?,
            Frame::Text {
                from,
                to,
                seq,
                body,
            } => {
                put_str(buf, "from", from)?;
                match to {
                    Recipient::User(name) => {
                        buf.put_u8(0);
                        put_str(buf, "recipient", name)?;
                    }
                    Recipient::Broadcast => buf.put_u8(1),
                }
                buf.put_u64(*seq);
                buf.put_slice(body);
            }
            Frame::System { text } => buf.put_slice(text.as_bytes()),
            Frame::UserList { usernames } => {
                let count = u16::try_from(usernames.len())
                    .map_err(|_| FrameError::StringTooLong("usernames"))?;
                buf.put_u16(count);
                for name in usernames {
                    put_str(buf, "username", name)?;
                }
            }
            Frame::FileRequest {
                receiver,
                filename,
                total_size,
            } => {
                put_str(buf, "receiver", receiver)?;
                put_str(buf, "filename", filename)?;
                buf.put_u64(*total_size);
            }
            Frame::FileOffer {
                transfer_id,
                sender: peer,
                filename,
                total_size,
                chunk_size,
            }
            | Frame::FilePending {
                transfer_id,
                receiver: peer,
                filename,
                total_size,
                chunk_size,
            } => {
                buf.put_slice(transfer_id.as_bytes());
                put_str(buf, "peer", peer)?;
                put_str(buf, "filename", filename)?;
                buf.put_u64(*total_size);
                buf.put_u32(*chunk_size);
            }
            Frame::FileAccept { transfer_id } | Frame::FileDone { transfer_id } => {
                buf.put_slice(transfer_id.as_bytes());
            }
            Frame::FileReject {
                transfer_id,
                reason,
            }
            | Frame::FileAbort {
                transfer_id,
                reason,
            } => {
                buf.put_slice(transfer_id.as_bytes());
                put_reason(buf, reason)?;
            }
            Frame::FileChunk(chunk) => {
                buf.put_slice(chunk.transfer_id.as_bytes());
                buf.put_u32(chunk.index);
                buf.put_u8(u8::from(chunk.is_last));
                buf.put_slice(&chunk.data);
            }
            Frame::FileAck { transfer_id, index } => {
                buf.put_slice(transfer_id.as_bytes());
                buf.put_u32(*index);
            }
        }
        Ok(())
    }

    /// Decode a payload of the given type byte
    pub fn decode(kind: u8, payload: Bytes) -> Result<Frame, FrameError> {
        let mut r = PayloadReader { buf: payload };
        let frame = match FrameType::try_from(kind)? {
            FrameType::Join => Frame::Join {
                username: r.string("username")?,
            },
            FrameType::JoinOk => Frame::JoinOk,
            FrameType::JoinReject => Frame::JoinReject {
                reason: r.reason()?,
            },
            FrameType::Text => {
                let from = r.string("from")?;
                let to = match r.u8("recipient tag")? {
                    0 => Recipient::User(r.string("recipient")?),
                    1 => Recipient::Broadcast,
                    value => {
                        return Err(FrameError::InvalidValue {
                            field: "recipient tag",
                            value,
                        })
                    }
                };
                let seq = r.u64("seq")?;
                Frame::Text {
                    from,
                    to,
                    seq,
                    body: r.rest(),
                }
            }
            FrameType::System => Frame::System {
                text: r.rest_string("system text")?,
            },
            FrameType::ListUsers => Frame::ListUsers,
            FrameType::UserList => {
                let count = r.u16("user count")?;
                let usernames = (0..count)
                    .map(|_| r.string("username"))
                    .collect::<Result<Vec<_>, _>>()?;
                Frame::UserList { usernames }
            }
            FrameType::FileRequest => Frame::FileRequest {
                receiver: r.string("receiver")?,
                filename: r.string("filename")?,
                total_size: r.u64("total size")?,
            },
            FrameType::FileOffer => Frame::FileOffer {
                transfer_id: r.transfer_id()?,
                sender: r.string("sender")?,
                filename: r.string("filename")?,
                total_size: r.u64("total size")?,
                chunk_size: r.u32("chunk size")?,
            },
            FrameType::FilePending => Frame::FilePending {
                transfer_id: r.transfer_id()?,
                receiver: r.string("receiver")?,
                filename: r.string("filename")?,
                total_size: r.u64("total size")?,
                chunk_size: r.u32("chunk size")?,
            },
            FrameType::FileAccept => Frame::FileAccept {
                transfer_id: r.transfer_id()?,
            },
            FrameType::FileReject => Frame::FileReject {
                transfer_id: r.transfer_id()?,
                reason: r.reason()?,
            },
            FrameType::FileChunk => {
                let transfer_id = r.transfer_id()?;
                let index = r.u32("chunk index")?;
                let is_last = match r.u8("last flag")? {
                    0 => false,
                    1 => true,
                    value => {
                        return Err(FrameError::InvalidValue {
                            field: "last flag",
                            value,
                        })
                    }
                };
                Frame::FileChunk(Chunk {
                    transfer_id,
                    index,
                    is_last,
                    data: r.rest(),
                })
            }
            FrameType::FileAck => Frame::FileAck {
                transfer_id: r.transfer_id()?,
                index: r.u32("ack index")?,
            },
            FrameType::FileAbort => Frame::FileAbort {
                transfer_id: r.transfer_id()?,
                reason: r.reason()?,
            },
            FrameType::FileDone => Frame::FileDone {
                transfer_id: r.transfer_id()?,
            },
            FrameType::Error => Frame::Error {
                reason: r.reason()?,
            },
        };
        r.finish()?;
        Ok(frame)
    }
}

fn put_str(buf: &mut BytesMut, field: &'static str, s: &str) -> Result<(), FrameError> {
    let len = u16::try_from(s.len()).map_err(|_| FrameError::StringTooLong(field))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_reason(buf: &mut BytesMut, reason: &Reason) -> Result<(), FrameError> {
    buf.put_u8(reason.code as u8);
    put_str(buf, "reason detail", truncate(&reason.detail, MAX_REASON_DETAIL))
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Bounds-checked cursor over one payload
struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    fn need(&self, n: usize, field: &'static str) -> Result<(), FrameError> {
        if self.buf.remaining() < n {
            Err(FrameError::Truncated(field))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, FrameError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, FrameError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, FrameError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, FrameError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn transfer_id(&mut self) -> Result<TransferId, FrameError> {
        self.need(16, "transfer id")?;
        let mut bytes = [0u8; 16];
        self.buf.copy_to_slice(&mut bytes);
        Ok(TransferId::from_bytes(bytes))
    }

    fn string(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len = self.u16(field)? as usize;
        self.need(len, field)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
    }

    fn reason(&mut self) -> Result<Reason, FrameError> {
        let code = ErrorCode::try_from(self.u8("reason code")?)?;
        let detail = self.string("reason detail")?;
        Ok(Reason { code, detail })
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }

    fn rest_string(&mut self, field: &'static str) -> Result<String, FrameError> {
        let raw = self.rest();
        String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
    }

    fn finish(self) -> Result<(), FrameError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(FrameError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::new();
        frame.encode_payload(&mut buf).unwrap();
        buf.freeze()
    }

    #[test]
    fn test_text_broadcast_layout() {
        let frame = Frame::Text {
            from: "al".to_string(),
            to: Recipient::Broadcast,
            seq: 7,
            body: Bytes::from_static(b"hi"),
        };
        let bytes = payload(&frame);
        assert_eq!(
            &bytes[..],
            &[0, 2, b'a', b'l', 1, 0, 0, 0, 0, 0, 0, 0, 7, b'h', b'i']
        );
        assert_eq!(Frame::decode(FrameType::Text as u8, bytes).unwrap(), frame);
    }

    #[test]
    fn test_chunk_decode() {
        let id = TransferId::generate();
        let frame = Frame::FileChunk(Chunk {
            transfer_id: id,
            index: 2,
            is_last: true,
            data: Bytes::from(vec![9u8; 1808]),
        });
        let bytes = payload(&frame);
        assert_eq!(bytes.len(), CHUNK_OVERHEAD + 1808);
        match Frame::decode(0x25, bytes).unwrap() {
            Frame::FileChunk(chunk) => {
                assert_eq!(chunk.transfer_id, id);
                assert_eq!(chunk.index, 2);
                assert!(chunk.is_last);
                assert_eq!(chunk.data.len(), 1808);
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type() {
        let err = Frame::decode(0x55, Bytes::new()).unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(0x55)));
    }

    #[test]
    fn test_truncated_payload() {
        let err = Frame::decode(FrameType::FileAck as u8, Bytes::from_static(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, FrameError::Truncated("transfer id")));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let err = Frame::decode(FrameType::JoinOk as u8, Bytes::from_static(&[0])).unwrap_err();
        assert!(matches!(err, FrameError::TrailingBytes(1)));
    }

    #[test]
    fn test_bad_last_flag() {
        let mut buf = BytesMut::new();
        buf.put_slice(TransferId::generate().as_bytes());
        buf.put_u32(0);
        buf.put_u8(2);
        let err = Frame::decode(FrameType::FileChunk as u8, buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::InvalidValue { field: "last flag", value: 2 }));
    }

    #[test]
    fn test_reason_from_app_error() {
        let reason = Reason::from(&AppError::UsernameTaken("alice".to_string()));
        assert_eq!(reason.code, ErrorCode::UsernameTaken);
        assert!(reason.detail.contains("alice"));

        let reason = Reason::from(&AppError::ProtocolViolation("nope".to_string()));
        assert_eq!(reason.code, ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_long_reason_detail_is_cut() {
        let name = "é".repeat(40_000);
        let frame = Frame::error(&AppError::RecipientOffline(name));

        let mut buf = BytesMut::new();
        frame.encode_payload(&mut buf).unwrap();

        match Frame::decode(FrameType::Error as u8, buf.freeze()).unwrap() {
            Frame::Error { reason } => {
                assert_eq!(reason.code, ErrorCode::RecipientOffline);
                assert!(reason.detail.len() <= MAX_REASON_DETAIL);
                assert!(reason.detail.starts_with("User 'é"));
            }
            other => panic!("Wrong frame: {:?}", other),
        }
    }
}
