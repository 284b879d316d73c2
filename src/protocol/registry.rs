//! # Message & Handler Registry
//!
//! Startup-built lookup tables:
//! - message id → decoder, used by the wire protocol while parsing;
//! - entity kind → (message id → handler), used by the dispatcher.
//!
//! The registry is assembled once with [`RegistryBuilder`] and is immutable
//! afterwards; it is shared through `Arc` and read without locks.
//!
//! Handlers are registered against an [`EntityType`]. A generic view
//! (`AllClients`, `AllConnections`) merges into the table of every exact kind
//! it covers, so a TCP connection resolves both its own handlers and the ones
//! registered for all connections.
//!
//! ```rust
//! # use network_engine::core::binary::{MessageReader, MessageWriter, Serializable};
//! # use network_engine::core::message::NetworkMessage;
//! # use network_engine::error::Result;
//! use network_engine::protocol::registry::{EntityType, Registry};
//! # struct Ping;
//! # impl Serializable for Ping {
//! #     fn write_to(&self, _: &mut MessageWriter) -> Result<()> { Ok(()) }
//! #     fn read_from(_: &mut MessageReader<'_>) -> Result<Self> { Ok(Ping) }
//! # }
//! # impl NetworkMessage for Ping { const MESSAGE_ID: u16 = 1; }
//!
//! let registry = Registry::builder()
//!     .message::<Ping>()
//!     .handler(EntityType::AllConnections, |entity, _ping: Ping| entity.send(&Ping))
//!     .build()
//!     .expect("registry is valid");
//! assert!(registry.messages().contains(1));
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::binary::MessageReader;
use crate::core::message::{AnyMessage, MessageId, NetworkMessage};
use crate::error::{ProtocolError, Result};
use crate::transport::entity::{Entity, EntityKind, Role};
use crate::utils::metrics::global_metrics;

type DecodeFn = fn(&mut MessageReader<'_>) -> Result<Box<dyn AnyMessage>>;

/// Type-erased handler stored in the tables.
pub type HandlerFn = dyn Fn(&Arc<Entity>, Box<dyn AnyMessage>) -> Result<()> + Send + Sync;

fn decode_as<M: NetworkMessage>(reader: &mut MessageReader<'_>) -> Result<Box<dyn AnyMessage>> {
    let message = M::read_from(reader)?;
    Ok(Box::new(message))
}

/// Registered message type.
#[derive(Clone)]
pub struct MessageType {
    id: MessageId,
    name: &'static str,
    decode: DecodeFn,
}

impl MessageType {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Message id → decoder table.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    by_id: HashMap<MessageId, MessageType>,
    by_type: HashMap<TypeId, MessageId>,
}

impl MessageRegistry {
    pub fn contains(&self, id: MessageId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&MessageType> {
        self.by_id.get(&id)
    }

    /// Id registered for the concrete type `M`, if any.
    pub fn id_of<M: NetworkMessage>(&self) -> Option<MessageId> {
        self.by_type.get(&TypeId::of::<M>()).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageType> {
        self.by_id.values()
    }

    /// Decode a payload for `id`.
    ///
    /// Unknown ids are an error: unknown traffic means a mismatched protocol
    /// or a hostile peer, and the caller tears the connection down.
    pub fn decode(&self, id: MessageId, payload: &[u8]) -> Result<Box<dyn AnyMessage>> {
        let message_type = self.by_id.get(&id).ok_or(ProtocolError::UnknownMessage(id))?;
        let mut reader = MessageReader::new(payload);
        (message_type.decode)(&mut reader)
    }
}

/// Which entities a handler applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    /// Exactly one transport + role combination.
    Exact(EntityKind),
    /// Every client, whatever its transport.
    AllClients,
    /// Every server-side connection, whatever its transport.
    AllConnections,
}

impl EntityType {
    /// Whether a handler registered for `self` applies to `kind`.
    pub fn covers(self, kind: EntityKind) -> bool {
        match self {
            EntityType::Exact(exact) => exact == kind,
            EntityType::AllClients => kind.role == Role::Client,
            EntityType::AllConnections => kind.role == Role::Connection,
        }
    }
}

impl From<EntityKind> for EntityType {
    fn from(kind: EntityKind) -> Self {
        EntityType::Exact(kind)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Exact(kind) => write!(f, "{kind}"),
            EntityType::AllClients => f.write_str("all clients"),
            EntityType::AllConnections => f.write_str("all connections"),
        }
    }
}

/// Immutable registry shared by servers, clients and their parsers.
pub struct Registry {
    messages: MessageRegistry,
    handlers: HashMap<EntityKind, HashMap<MessageId, Arc<HandlerFn>>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn messages(&self) -> &MessageRegistry {
        &self.messages
    }

    pub fn has_handler(&self, kind: EntityKind, id: MessageId) -> bool {
        self.handlers
            .get(&kind)
            .is_some_and(|table| table.contains_key(&id))
    }

    /// Run the handler for `message` on `entity`.
    ///
    /// Called from a dispatch worker, never from an I/O task. Handler errors
    /// are logged and swallowed.
    pub(crate) fn dispatch(&self, entity: &Arc<Entity>, message: Box<dyn AnyMessage>) {
        let id = message.message_id();
        let Some(handler) = self
            .handlers
            .get(&entity.kind())
            .and_then(|table| table.get(&id))
        else {
            debug!(
                entity_id = entity.id(),
                kind = %entity.kind(),
                message_id = id,
                message = message.message_name(),
                "No handler registered, dropping message"
            );
            return;
        };

        if let Err(e) = handler(entity, message) {
            global_metrics().handler_failed();
            warn!(
                entity_id = entity.id(),
                kind = %entity.kind(),
                message_id = id,
                error = %e,
                "Message handler failed"
            );
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handler_count: usize = self.handlers.values().map(HashMap::len).sum();
        f.debug_struct("Registry")
            .field("messages", &self.messages.len())
            .field("handlers", &handler_count)
            .finish()
    }
}

struct PendingHandler {
    message_id: MessageId,
    message_name: &'static str,
    entity_type: EntityType,
    handler: Arc<HandlerFn>,
}

/// Collects registrations; all validation happens in [`RegistryBuilder::build`].
#[derive(Default)]
pub struct RegistryBuilder {
    messages: Vec<MessageType>,
    type_ids: Vec<TypeId>,
    handlers: Vec<PendingHandler>,
}

impl RegistryBuilder {
    /// Register the message type `M` under `M::MESSAGE_ID`.
    pub fn message<M: NetworkMessage>(mut self) -> Self {
        self.messages.push(MessageType {
            id: M::MESSAGE_ID,
            name: M::type_name(),
            decode: decode_as::<M>,
        });
        self.type_ids.push(TypeId::of::<M>());
        self
    }

    /// Register a handler for `M` on every entity covered by `entity_type`.
    pub fn handler<M, F>(mut self, entity_type: impl Into<EntityType>, handler: F) -> Self
    where
        M: NetworkMessage,
        F: Fn(&Arc<Entity>, M) -> Result<()> + Send + Sync + 'static,
    {
        let erased = move |entity: &Arc<Entity>, message: Box<dyn AnyMessage>| {
            let message = message
                .downcast::<M>()
                .ok_or(ProtocolError::UnexpectedMessage)?;
            handler(entity, message)
        };
        self.handlers.push(PendingHandler {
            message_id: M::MESSAGE_ID,
            message_name: M::type_name(),
            entity_type: entity_type.into(),
            handler: Arc::new(erased),
        });
        self
    }

    /// Validate the registrations and freeze them.
    ///
    /// Fails on duplicate message ids, handlers for unregistered messages and
    /// two handlers resolving to the same (entity kind, message) pair. These
    /// are programming errors and should abort startup.
    pub fn build(self) -> Result<Arc<Registry>> {
        let mut messages = MessageRegistry::default();
        for (message_type, type_id) in self.messages.into_iter().zip(self.type_ids) {
            if let Some(existing) = messages.by_id.get(&message_type.id) {
                return Err(ProtocolError::DuplicateMessageId {
                    id: message_type.id,
                    existing: existing.name,
                    duplicate: message_type.name,
                });
            }
            messages.by_type.insert(type_id, message_type.id);
            messages.by_id.insert(message_type.id, message_type);
        }

        let mut handlers: HashMap<EntityKind, HashMap<MessageId, Arc<HandlerFn>>> =
            HashMap::new();
        for pending in self.handlers {
            if !messages.contains(pending.message_id) {
                return Err(ProtocolError::UnregisteredMessage(pending.message_name));
            }

            for kind in EntityKind::ALL {
                if !pending.entity_type.covers(kind) {
                    continue;
                }
                let table = handlers.entry(kind).or_default();
                if table.contains_key(&pending.message_id) {
                    return Err(ProtocolError::DuplicateHandler {
                        message: pending.message_name,
                        entity: kind.to_string(),
                    });
                }
                table.insert(pending.message_id, Arc::clone(&pending.handler));
            }
        }

        let registry = Registry { messages, handlers };
        info!(?registry, "Message registry built");
        Ok(Arc::new(registry))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::binary::{MessageWriter, Serializable};
    use crate::transport::entity::Transport;

    struct Alpha(u8);
    struct Beta;
    struct AlphaTwin;

    impl Serializable for Alpha {
        fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
            writer.write_u8(self.0);
            Ok(())
        }
        fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
            Ok(Alpha(reader.read_u8()?))
        }
    }
    impl NetworkMessage for Alpha {
        const MESSAGE_ID: MessageId = 1;
    }

    impl Serializable for Beta {
        fn write_to(&self, _writer: &mut MessageWriter) -> Result<()> {
            Ok(())
        }
        fn read_from(_reader: &mut MessageReader<'_>) -> Result<Self> {
            Ok(Beta)
        }
    }
    impl NetworkMessage for Beta {
        const MESSAGE_ID: MessageId = 2;
    }

    impl Serializable for AlphaTwin {
        fn write_to(&self, _writer: &mut MessageWriter) -> Result<()> {
            Ok(())
        }
        fn read_from(_reader: &mut MessageReader<'_>) -> Result<Self> {
            Ok(AlphaTwin)
        }
    }
    impl NetworkMessage for AlphaTwin {
        const MESSAGE_ID: MessageId = 1;
    }

    fn noop<M>(_: &Arc<Entity>, _: M) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_decode_known_message() {
        let registry = Registry::builder().message::<Alpha>().build().unwrap();
        let decoded = registry.messages().decode(1, &[42]).unwrap();
        assert_eq!(decoded.message_id(), 1);
        assert_eq!(decoded.downcast_ref::<Alpha>().unwrap().0, 42);
        assert_eq!(registry.messages().id_of::<Alpha>(), Some(1));
    }

    #[test]
    fn test_decode_unknown_message_fails() {
        let registry = Registry::builder().message::<Alpha>().build().unwrap();
        let err = registry.messages().decode(99, &[]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(99)));
    }

    #[test]
    fn test_duplicate_message_id_is_fatal() {
        let err = Registry::builder()
            .message::<Alpha>()
            .message::<AlphaTwin>()
            .build()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateMessageId { id: 1, .. }));
    }

    #[test]
    fn test_handler_for_unregistered_message_is_fatal() {
        let err = Registry::builder()
            .message::<Alpha>()
            .handler(EntityType::AllConnections, noop::<Beta>)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnregisteredMessage(_)));
    }

    #[test]
    fn test_generic_view_merges_into_every_exact_kind() {
        let registry = Registry::builder()
            .message::<Alpha>()
            .message::<Beta>()
            .handler(EntityType::AllConnections, noop::<Alpha>)
            .handler(
                EntityKind::connection(Transport::WebSocket),
                noop::<Beta>,
            )
            .build()
            .unwrap();

        for transport in [Transport::Tcp, Transport::Udp, Transport::WebSocket] {
            assert!(registry.has_handler(EntityKind::connection(transport), 1));
            assert!(!registry.has_handler(EntityKind::client(transport), 1));
        }
        assert!(registry.has_handler(EntityKind::connection(Transport::WebSocket), 2));
        assert!(!registry.has_handler(EntityKind::connection(Transport::Tcp), 2));
    }

    #[test]
    fn test_overlapping_handlers_are_fatal() {
        let err = Registry::builder()
            .message::<Alpha>()
            .handler(EntityType::AllClients, noop::<Alpha>)
            .handler(EntityKind::client(Transport::Udp), noop::<Alpha>)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateHandler { .. }));
    }
}
