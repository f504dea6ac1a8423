//! Length-prefixed framing
//!
//! `[u32 payload length][u8 type][payload]` over a TCP byte stream,
//! implemented as a tokio-util codec so both halves of a connection can
//! be wrapped in `FramedRead` / `FramedWrite`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::frame::{Frame, HEADER_LEN};

/// Type byte and undecoded payload of one frame
///
/// Decoding the payload is left to [`Frame::decode`] so a bad payload
/// costs one frame, not the whole stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: u8,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn into_frame(self) -> Result<Frame, FrameError> {
        Frame::decode(self.kind, self.payload)
    }
}

/// Codec enforcing a maximum payload length in both directions
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_payload {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_payload,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(4);
        let kind = src.get_u8();
        let payload = src.split_to(len).freeze();
        Ok(Some(RawFrame { kind, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let start = dst.len();
        dst.put_u32(0);
        dst.put_u8(frame.frame_type() as u8);

        if let Err(e) = frame.encode_payload(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let len = dst.len() - start - HEADER_LEN;
        if len > self.max_payload {
            dst.truncate(start);
            return Err(FrameError::TooLarge {
                len,
                max: self.max_payload,
            });
        }

        dst[start..start + 4].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }
}
