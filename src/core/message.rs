//! # Network Messages
//!
//! A message is a [`Serializable`] payload with a stable numeric id. The id is
//! written on the wire in front of the payload and selects the decoder on the
//! receiving side.
//!
//! Parsed messages travel through the engine type-erased as
//! `Box<dyn AnyMessage>` and are downcast back to their concrete type right
//! before the handler runs.
//!
//! ## Usage
//! ```rust
//! use network_engine::core::binary::{MessageReader, MessageWriter, Serializable};
//! use network_engine::core::message::NetworkMessage;
//! use network_engine::error::Result;
//!
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Serializable for Chat {
//!     fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
//!         writer.write_string(&self.text)
//!     }
//!
//!     fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
//!         Ok(Self { text: reader.read_string()? })
//!     }
//! }
//!
//! impl NetworkMessage for Chat {
//!     const MESSAGE_ID: u16 = 10;
//! }
//! ```

use std::any::Any;

use crate::core::binary::{MessageWriter, Serializable};
use crate::error::Result;

/// Numeric message identifier, unique within a registry.
pub type MessageId = u16;

/// A typed payload with a stable id.
pub trait NetworkMessage: Serializable + Send + Sync + 'static {
    const MESSAGE_ID: MessageId;

    /// Human-readable name used in logs and registry errors.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Object-safe view of a [`NetworkMessage`].
pub trait AnyMessage: Send + Sync + 'static {
    fn message_id(&self) -> MessageId;

    fn message_name(&self) -> &'static str;

    /// Write the payload (without id or length).
    fn write_payload(&self, writer: &mut MessageWriter) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<M: NetworkMessage> AnyMessage for M {
    fn message_id(&self) -> MessageId {
        M::MESSAGE_ID
    }

    fn message_name(&self) -> &'static str {
        M::type_name()
    }

    fn write_payload(&self, writer: &mut MessageWriter) -> Result<()> {
        self.write_to(writer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn AnyMessage {
    /// Borrow the concrete message if it is an `M`.
    pub fn downcast_ref<M: NetworkMessage>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    /// Take the concrete message out of the box if it is an `M`.
    pub fn downcast<M: NetworkMessage>(self: Box<Self>) -> Option<M> {
        self.into_any().downcast::<M>().ok().map(|boxed| *boxed)
    }
}

impl std::fmt::Debug for dyn AnyMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyMessage")
            .field("id", &self.message_id())
            .field("type", &self.message_name())
            .finish()
    }
}
