//! Length-prefixed framing used by TCP and UDP.
//!
//! ```text
//! | MessageId: u16 LE | PayloadLength: u32 LE | Payload |
//! ```

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::core::binary::MessageWriter;
use crate::core::message::AnyMessage;
use crate::error::{ProtocolError, Result};
use crate::protocol::registry::Registry;
use crate::protocol::{MessageParsingOutput, WireProtocol};

/// Bytes in front of every payload: id (2) + length (4).
pub const HEADER_LEN: usize = 6;

/// Append `[id][len][payload]` for `message` to `dst`.
///
/// On error `dst` is left as it was.
pub fn encode_message(message: &dyn AnyMessage, dst: &mut BytesMut) -> Result<()> {
    let start = dst.len();
    let mut writer = MessageWriter::from_buffer(std::mem::take(dst));
    writer.write_u16(message.message_id());
    writer.write_u32(0);
    let written = message.write_payload(&mut writer);

    let mut buf = writer.into_inner();
    let patched = written.and_then(|()| {
        let payload_len = buf.len() - start - HEADER_LEN;
        let len = u32::try_from(payload_len)
            .map_err(|_| ProtocolError::SerializeError(format!("payload of {payload_len} bytes")))?;
        buf[start + 2..start + HEADER_LEN].copy_from_slice(&len.to_le_bytes());
        Ok(())
    });
    if patched.is_err() {
        buf.truncate(start);
    }
    *dst = buf;
    patched
}

/// Decoder for length-prefixed frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    registry: Arc<Registry>,
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(registry: Arc<Registry>, max_payload_size: usize) -> Self {
        Self {
            registry,
            max_payload_size,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Box<dyn AnyMessage>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let id = u16::from_le_bytes([src[0], src[1]]);
        let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;

        if !self.registry.messages().contains(id) {
            return Err(ProtocolError::UnknownMessage(id));
        }
        if len > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(len));
        }

        let frame_len = HEADER_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        trace!(message_id = id, len, "Decoded frame");
        self.registry
            .messages()
            .decode(id, &frame[HEADER_LEN..])
            .map(Some)
    }
}

impl WireProtocol for FrameCodec {
    fn try_parse(&mut self, src: &mut BytesMut, out: &mut MessageParsingOutput) -> Result<()> {
        while let Some(message) = self.decode(src)? {
            out.messages.push(message);
        }
        Ok(())
    }
}

/// Write a raw frame header; for tests and tools that craft frames by hand.
pub fn put_header(dst: &mut BytesMut, id: u16, len: u32) {
    dst.put_u16_le(id);
    dst.put_u32_le(len);
}
