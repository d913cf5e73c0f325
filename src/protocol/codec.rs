//! Length-prefixed frame codec for peer connections.
//!
//! Wire layout of one frame:
//!
//! ```text
//! total_len:u32  class_id:[u8;16]  version:u16
//! metadata_len:u32  payload_len:u32  metadata  payload
//! ```
//!
//! `total_len` counts everything after itself. Integers are little-endian.
//! Inbound frames larger than [`MAX_FRAME_BYTES`] fail decoding with
//! `NodeError::Protocol` rather than allocating.
//!
//! Use [`FrameCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use super::envelope::Envelope;
use crate::{NodeError, Result};

/// Fixed header bytes following the length prefix.
const HEADER_BYTES: usize = 16 + 2 + 4 + 4;

/// Maximum accepted frame size: 1 GiB.
///
/// Application payloads (frame buffers, scene deltas) are large; anything
/// beyond this is a protocol violation, not data.
pub const MAX_FRAME_BYTES: usize = 1 << 30;

/// Length-prefixed envelope codec for bidirectional peer streams.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = NodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let total_len = {
            let mut peek = &src[..4];
            peek.get_u32_le() as usize
        };
        if total_len < HEADER_BYTES || total_len > MAX_FRAME_BYTES {
            return Err(NodeError::Protocol(format!(
                "invalid frame length {total_len}"
            )));
        }
        if src.len() < 4 + total_len {
            src.reserve(4 + total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(total_len);

        let mut id = [0u8; 16];
        frame.copy_to_slice(&mut id);
        let class_id = Uuid::from_bytes(id);
        let version = frame.get_u16_le();
        let metadata_len = frame.get_u32_le() as usize;
        let payload_len = frame.get_u32_le() as usize;
        if metadata_len + payload_len != frame.len() {
            return Err(NodeError::Protocol(format!(
                "frame length mismatch: header says {} + {}, body has {}",
                metadata_len,
                payload_len,
                frame.len()
            )));
        }

        let metadata_raw = frame.split_to(metadata_len);
        let metadata = Envelope::metadata_from_bytes(&metadata_raw)?;
        let payload: Bytes = frame.freeze();

        Ok(Some(Envelope::opaque(class_id, version, metadata, payload)))
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = NodeError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        let metadata = envelope.metadata_bytes()?;
        let payload = envelope.payload_bytes()?;

        let total_len = HEADER_BYTES + metadata.len() + payload.len();
        if total_len > MAX_FRAME_BYTES {
            return Err(NodeError::Protocol(format!(
                "outbound frame too large: {total_len} bytes"
            )));
        }

        dst.reserve(4 + total_len);
        dst.put_u32_le(total_len as u32);
        dst.put_slice(envelope.class_id.as_bytes());
        dst.put_u16_le(envelope.version);
        dst.put_u32_le(metadata.len() as u32);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&metadata);
        dst.put_slice(&payload);
        Ok(())
    }
}
