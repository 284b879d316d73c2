//! # Protocol Layer
//!
//! Wire formats, message registry and dispatch.
//!
//! ## Components
//! - **Wire**: length-prefixed framing for TCP and UDP
//! - **WebSocket**: RFC6455 frame codec and the HTTP upgrade handshake
//! - **Registry**: message id → decoder, entity kind → handler
//! - **Dispatcher**: per-connection serial queues and the client worker pool
//!
//! ## Wire Format
//! ```text
//! | MessageId: u16 LE | PayloadLength: u32 LE | Payload |
//! ```
//! WebSocket data frames carry `| MessageId: u16 LE | Payload |` with the frame
//! header providing the length.
//!
//! ## Security
//! - Declared lengths are checked against `max_payload_size` before buffering
//! - Unknown message ids are fatal for the connection

pub mod dispatcher;
pub mod handshake;
pub mod registry;
pub mod websocket;
pub mod wire;

use bytes::{Bytes, BytesMut};

use crate::core::message::AnyMessage;
use crate::error::Result;

/// Everything one receive event produced.
#[derive(Debug, Default)]
pub struct MessageParsingOutput {
    /// Complete messages, in arrival order.
    pub messages: Vec<Box<dyn AnyMessage>>,
    /// Already-framed control replies to write back (WebSocket pong/close).
    pub replies: Vec<Bytes>,
    /// The peer asked to close the connection.
    pub close_requested: bool,
}

impl MessageParsingOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.replies.is_empty() && !self.close_requested
    }
}

/// Incremental parser over a connection's pending bytes.
///
/// Implementations consume every complete frame from the front of `src` and
/// leave a trailing partial frame in place for the next receive.
pub trait WireProtocol: Send + 'static {
    fn try_parse(&mut self, src: &mut BytesMut, out: &mut MessageParsingOutput) -> Result<()>;
}

/// Outbound framing of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `[id][len][payload]` frames.
    LengthPrefixed,
    /// RFC6455 binary frames; clients mask, servers don't.
    WebSocket { masked: bool },
}

impl Framing {
    /// Frame `message` and append it to `dst`.
    pub fn encode(&self, message: &dyn AnyMessage, dst: &mut BytesMut) -> Result<()> {
        match self {
            Framing::LengthPrefixed => wire::encode_message(message, dst),
            Framing::WebSocket { masked } => {
                let mask = masked.then(rand::random::<[u8; 4]>);
                websocket::encode_message(message, mask, dst)
            }
        }
    }
}
