//! User commands typed at a client prompt
//!
//! Each line maps to exactly one outbound frame:
//!
//! ```text
//! /dm <user> <text>         direct message
//! /all <text>               broadcast (plain text without a slash too)
//! /users                    list active users
//! /sendfile <user> <path>   offer a file; quote the path if it has spaces
//! /accept <id>              accept an offered transfer
//! /reject <id> [reason]     decline an offered transfer
//! /cancel <id> [reason]     abort a transfer in flight
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::CommandError;
use crate::frame::{ErrorCode, Frame, FrameType, Reason};
use crate::types::{Recipient, TransferId};

/// One parsed prompt line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Direct { to: String, text: String },
    Broadcast { text: String },
    ListUsers,
    SendFile { to: String, path: PathBuf },
    Accept { transfer_id: TransferId },
    Reject { transfer_id: TransferId, reason: String },
    Cancel { transfer_id: TransferId, reason: String },
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }
        if !line.starts_with('/') {
            return Ok(Command::Broadcast {
                text: line.to_string(),
            });
        }

        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        match name {
            "/dm" => {
                let (to, text) = split_word(rest).ok_or(CommandError::Usage("/dm <user> <text>"))?;
                if text.is_empty() {
                    return Err(CommandError::Usage("/dm <user> <text>"));
                }
                Ok(Command::Direct {
                    to: to.to_string(),
                    text: text.to_string(),
                })
            }
            "/all" => {
                if rest.is_empty() {
                    return Err(CommandError::Usage("/all <text>"));
                }
                Ok(Command::Broadcast {
                    text: rest.to_string(),
                })
            }
            "/users" => Ok(Command::ListUsers),
            "/sendfile" => {
                let (to, path) =
                    split_word(rest).ok_or(CommandError::Usage("/sendfile <user> <path>"))?;
                let path = path.trim_matches('"');
                if path.is_empty() {
                    return Err(CommandError::Usage("/sendfile <user> <path>"));
                }
                Ok(Command::SendFile {
                    to: to.to_string(),
                    path: PathBuf::from(path),
                })
            }
            "/accept" => Ok(Command::Accept {
                transfer_id: parse_id(rest, "/accept <id>")?,
            }),
            "/reject" => {
                let (id, reason) = split_word(rest).unwrap_or((rest, ""));
                Ok(Command::Reject {
                    transfer_id: parse_id(id, "/reject <id> [reason]")?,
                    reason: or_default(reason, "declined"),
                })
            }
            "/cancel" => {
                let (id, reason) = split_word(rest).unwrap_or((rest, ""));
                Ok(Command::Cancel {
                    transfer_id: parse_id(id, "/cancel <id> [reason]")?,
                    reason: or_default(reason, "cancelled"),
                })
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl Command {
    /// Type of the frame this command produces
    pub fn frame_type(&self) -> FrameType {
        match self {
            Command::Direct { .. } | Command::Broadcast { .. } => FrameType::Text,
            Command::ListUsers => FrameType::ListUsers,
            Command::SendFile { .. } => FrameType::FileRequest,
            Command::Accept { .. } => FrameType::FileAccept,
            Command::Reject { .. } => FrameType::FileReject,
            Command::Cancel { .. } => FrameType::FileAbort,
        }
    }

    /// Build the outbound frame
    ///
    /// `/sendfile` reads the file's metadata to fill in name and size; the
    /// data itself is streamed once the receiver accepts.
    pub async fn into_frame(self) -> Result<Frame, CommandError> {
        let frame = match self {
            Command::Direct { to, text } => Frame::Text {
                from: String::new(),
                to: Recipient::User(to),
                seq: 0,
                body: Bytes::from(text),
            },
            Command::Broadcast { text } => Frame::Text {
                from: String::new(),
                to: Recipient::Broadcast,
                seq: 0,
                body: Bytes::from(text),
            },
            Command::ListUsers => Frame::ListUsers,
            Command::SendFile { to, path } => {
                let meta = tokio::fs::metadata(&path).await?;
                if !meta.is_file() {
                    return Err(CommandError::Usage("/sendfile <user> <path to a regular file>"));
                }
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or(CommandError::Usage("/sendfile <user> <path>"))?;
                Frame::FileRequest {
                    receiver: to,
                    filename,
                    total_size: meta.len(),
                }
            }
            Command::Accept { transfer_id } => Frame::FileAccept { transfer_id },
            Command::Reject {
                transfer_id,
                reason,
            } => Frame::FileReject {
                transfer_id,
                reason: Reason::new(ErrorCode::Rejected, reason),
            },
            Command::Cancel {
                transfer_id,
                reason,
            } => Frame::FileAbort {
                transfer_id,
                reason: Reason::new(ErrorCode::Cancelled, reason),
            },
        };
        Ok(frame)
    }
}

/// First word and the trimmed remainder
fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest.trim())),
        None => Some((s, "")),
    }
}

fn parse_id(raw: &str, usage: &'static str) -> Result<TransferId, CommandError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CommandError::Usage(usage));
    }
    raw.parse()
        .map_err(|_| CommandError::InvalidTransferId(raw.to_string()))
}

fn or_default(s: &str, default: &str) -> String {
    if s.is_empty() {
        default.to_string()
    } else {
        s.to_string()
    }
}
