//! # WebSocket Frame Codec
//!
//! A subset of RFC6455 sufficient for binary message exchange:
//! - 7/16/64-bit payload lengths (minimal form on output)
//! - masking with a 4-byte key (clients mask, servers don't)
//! - ping/pong/close handled inline
//!
//! FIN is not tracked: every frame is treated as complete. Data frames
//! (binary, text, continuation) carry `[MessageId: u16 LE][Payload]`.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::core::binary::MessageWriter;
use crate::core::message::AnyMessage;
use crate::error::{ProtocolError, Result};
use crate::protocol::registry::Registry;
use crate::protocol::{MessageParsingOutput, WireProtocol};

const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::InvalidFrame(format!(
                "reserved opcode {other:#x}"
            ))),
        }
    }
}

/// One decoded frame with its payload already unmasked.
#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: BytesMut,
}

/// XOR `buf` with the repeating 4-byte `key`. Applying it twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Append one FIN frame to `dst`, masking the payload when `mask` is set.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>, dst: &mut BytesMut) {
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let len = payload.len();

    dst.reserve(len + 14);
    dst.put_u8(FIN | opcode as u8);
    if len <= 125 {
        dst.put_u8(mask_bit | len as u8);
    } else if let Ok(len) = u16::try_from(len) {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(payload),
    }
}

/// Append a binary frame carrying `[id][payload]` for `message`.
pub fn encode_message(
    message: &dyn AnyMessage,
    mask: Option<[u8; 4]>,
    dst: &mut BytesMut,
) -> Result<()> {
    let mut writer = MessageWriter::new();
    writer.write_u16(message.message_id());
    message.write_payload(&mut writer)?;
    encode_frame(Opcode::Binary, writer.as_slice(), mask, dst);
    Ok(())
}

/// Frame decoder plus message parsing for one WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketCodec {
    registry: Arc<Registry>,
    max_payload_size: usize,
    mask_outbound: bool,
}

impl WebSocketCodec {
    /// Codec for the accepting side; replies are unmasked.
    pub fn server(registry: Arc<Registry>, max_payload_size: usize) -> Self {
        Self {
            registry,
            max_payload_size,
            mask_outbound: false,
        }
    }

    /// Codec for the connecting side; replies are masked.
    pub fn client(registry: Arc<Registry>, max_payload_size: usize) -> Self {
        Self {
            registry,
            max_payload_size,
            mask_outbound: true,
        }
    }

    fn reply_mask(&self) -> Option<[u8; 4]> {
        self.mask_outbound.then(rand::random::<[u8; 4]>)
    }

    fn reply(&self, opcode: Opcode, payload: &[u8]) -> bytes::Bytes {
        let mut buf = BytesMut::new();
        encode_frame(opcode, payload, self.reply_mask(), &mut buf);
        buf.freeze()
    }
}

impl Decoder for WebSocketCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let fin = src[0] & FIN != 0;
        if src[0] & 0x70 != 0 {
            return Err(ProtocolError::InvalidFrame("reserved bits set".into()));
        }
        let opcode = Opcode::try_from(src[0] & 0x0F)?;
        let masked = src[1] & MASK_BIT != 0;

        let (declared, mut header_len) = match src[1] & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            short => (u64::from(short), 2),
        };

        // The id prefix is part of the frame payload but not of the message payload.
        let limit = self.max_payload_size.saturating_add(2);
        let len = usize::try_from(declared)
            .ok()
            .filter(|len| *len <= limit)
            .ok_or(ProtocolError::OversizedPacket(
                usize::try_from(declared).unwrap_or(usize::MAX),
            ))?;
        if opcode.is_control() && len > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::InvalidFrame(format!(
                "control frame of {len} bytes"
            )));
        }

        let mask_key_at = header_len;
        if masked {
            header_len += 4;
        }
        let frame_len = header_len + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let key = masked.then(|| [
            src[mask_key_at],
            src[mask_key_at + 1],
            src[mask_key_at + 2],
            src[mask_key_at + 3],
        ]);
        let mut payload = src.split_to(frame_len);
        payload.advance(header_len);
        if let Some(key) = key {
            apply_mask(&mut payload, key);
        }

        trace!(?opcode, len, masked, "Decoded websocket frame");
        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

impl WireProtocol for WebSocketCodec {
    fn try_parse(&mut self, src: &mut BytesMut, out: &mut MessageParsingOutput) -> Result<()> {
        while let Some(frame) = self.decode(src)? {
            match frame.opcode {
                Opcode::Binary | Opcode::Text | Opcode::Continuation => {
                    let payload = &frame.payload;
                    if payload.len() < 2 {
                        return Err(ProtocolError::InvalidFrame(
                            "data frame shorter than a message id".into(),
                        ));
                    }
                    let id = u16::from_le_bytes([payload[0], payload[1]]);
                    out.messages
                        .push(self.registry.messages().decode(id, &payload[2..])?);
                }
                Opcode::Ping => {
                    out.replies.push(self.reply(Opcode::Pong, &frame.payload));
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    debug!(len = frame.payload.len(), "Peer sent close frame");
                    out.replies.push(self.reply(Opcode::Close, &frame.payload));
                    out.close_requested = true;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn codec() -> WebSocketCodec {
        let registry = Registry::builder().build().unwrap();
        WebSocketCodec::server(registry, 1 << 20)
    }

    #[test]
    fn test_minimal_length_forms() {
        for (len, header) in [(125usize, 2usize), (126, 4), (65_535, 4), (70_000, 10)] {
            let mut buf = BytesMut::new();
            encode_frame(Opcode::Binary, &vec![0u8; len], None, &mut buf);
            assert_eq!(buf.len(), header + len, "payload of {len} bytes");
        }

        let mut buf = BytesMut::new();
        encode_frame(Opcode::Binary, &[0u8; 126], None, &mut buf);
        assert_eq!(&buf[..4], &[0x82, 126, 0x00, 126]);

        let mut buf = BytesMut::new();
        encode_frame(Opcode::Binary, &vec![0u8; 70_000], None, &mut buf);
        assert_eq!(buf[1], 127);
        assert_eq!(&buf[2..10], &70_000u64.to_be_bytes());
    }

    #[test]
    fn test_masked_frame_decodes_to_original() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut buf = BytesMut::new();
        encode_frame(Opcode::Binary, &payload, Some([1, 2, 3, 4]), &mut buf);
        assert_eq!(buf[1] & MASK_BIT, MASK_BIT);
        assert_ne!(&buf[buf.len() - payload.len()..], &payload[..]);

        let frame = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert!(frame.fin);
        assert_eq!(&frame.payload[..], &payload[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ping_gets_pong_with_same_payload() {
        let mut codec = codec();
        let mut src = BytesMut::new();
        encode_frame(Opcode::Ping, b"abc", Some([9, 9, 9, 9]), &mut src);

        let mut out = MessageParsingOutput::default();
        codec.try_parse(&mut src, &mut out).unwrap();
        assert_eq!(out.replies.len(), 1);
        assert_eq!(&out.replies[0][..], &[0x8A, 3, b'a', b'b', b'c']);
        assert!(!out.close_requested);
    }

    #[test]
    fn test_close_is_echoed_and_requested() {
        let mut codec = codec();
        let mut src = BytesMut::new();
        encode_frame(Opcode::Close, &1000u16.to_be_bytes(), None, &mut src);

        let mut out = MessageParsingOutput::default();
        codec.try_parse(&mut src, &mut out).unwrap();
        assert!(out.close_requested);
        assert_eq!(out.replies[0][0], 0x88);
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        let mut src = BytesMut::new();
        encode_frame(Opcode::Ping, &[0u8; 126], None, &mut src);
        assert!(matches!(
            codec().decode(&mut src),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_reserved_opcode_rejected() {
        let mut src = BytesMut::from(&[0x83u8, 0x00][..]);
        assert!(codec().decode(&mut src).is_err());
    }

    #[test]
    fn test_partial_header_waits() {
        let mut src = BytesMut::from(&[0x82u8, 126, 0x01][..]);
        assert!(codec().decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 3);
    }
}
