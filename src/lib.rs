//! # Network Engine
//!
//! Transport-agnostic client/server messaging over TCP, UDP and WebSocket.
//!
//! Applications define message types ([`NetworkMessage`]), register them and
//! their handlers in a [`Registry`], then run [`Server`]s and [`Client`]s on
//! any of the three transports. Every connection reports its lifecycle
//! through observers and ends with exactly one [`DisconnectReason`].
//!
//! ## Layout
//! - [`core`]: binary payload codec and the message contract
//! - [`protocol`]: framing, WebSocket codec and handshake, registry, dispatch
//! - [`transport`]: entities, servers, clients, groups, flood monitor
//! - [`config`]: TOML and environment configuration
//! - [`utils`]: logging setup and process-wide metrics
//!
//! ## Example
//! ```rust
//! use network_engine::{MessageReader, MessageWriter, NetworkMessage, Registry, Serializable};
//! use network_engine::{EntityType, Result, Transport};
//! use network_engine::transport::entity::EntityKind;
//!
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Serializable for Chat {
//!     fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
//!         writer.write_string(&self.text)
//!     }
//!     fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
//!         Ok(Chat { text: reader.read_string()? })
//!     }
//! }
//!
//! impl NetworkMessage for Chat {
//!     const MESSAGE_ID: u16 = 1;
//! }
//!
//! let registry = Registry::builder()
//!     .message::<Chat>()
//!     .handler(EntityType::AllConnections, |conn, chat: Chat| {
//!         println!("{}: {}", conn.id(), chat.text);
//!         Ok(())
//!     })
//!     .build()
//!     .unwrap();
//! assert!(registry.has_handler(EntityKind::connection(Transport::Tcp), 1));
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::binary::{MessageReader, MessageWriter, Serializable};
pub use crate::core::message::{AnyMessage, MessageId, NetworkMessage};
pub use crate::error::{DisconnectReason, ProtocolError, Result};
pub use crate::protocol::dispatcher::{MessageQueue, WorkerPool};
pub use crate::protocol::registry::{EntityType, Registry, RegistryBuilder};
pub use crate::transport::client::Client;
pub use crate::transport::entity::{ConnectionState, Entity, EntityKind, Role, Transport};
pub use crate::transport::group::ConnectionGroup;
pub use crate::transport::server::Server;
