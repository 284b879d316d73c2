//! # Error Types
//!
//! Error handling for the network engine.
//!
//! Two types live here:
//! - [`ProtocolError`]: the crate-wide error returned by fallible operations
//!   (codec reads, registry builds, sends, connects, configuration).
//! - [`DisconnectReason`]: the reason carried by the single disconnect
//!   notification of an entity. Transport failures reach the application only
//!   through this value.
//!
//! ## Error Categories
//! - **I/O Errors**: socket failures, refused connections
//! - **Protocol Errors**: malformed frames, unknown message ids, failed handshakes
//! - **Lifecycle Errors**: operations on disposed or not-yet-connected entities
//! - **Registry Errors**: duplicate ids or handlers detected at startup
//!
//! ## Example Usage
//! ```rust
//! use network_engine::error::{DisconnectReason, ProtocolError};
//!
//! let err = ProtocolError::UnknownMessage(0x7F7F);
//! assert_eq!(err.disconnect_reason(), DisconnectReason::InvalidDataReceived);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec errors
    pub const ERR_UNEXPECTED_EOF: &str = "Unexpected end of message payload";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";

    /// Lifecycle errors
    pub const ERR_ALREADY_CONNECTING: &str = "Entity is already connecting or connected";
    pub const ERR_SERVER_RUNNING: &str = "Server is already listening";

    /// Send errors
    pub const ERR_OUTBOUND_FULL: &str = "Outbound queue is full";

    /// Handshake errors
    pub const ERR_HANDSHAKE_TOO_LARGE: &str = "Handshake request exceeds maximum size";
    pub const ERR_HANDSHAKE_CLOSED: &str = "Peer closed the socket during the handshake";
    pub const ERR_MISSING_KEY: &str = "Missing Sec-WebSocket-Key header";
    pub const ERR_MISSING_UPGRADE: &str = "Missing 'Upgrade: websocket' header";
    pub const ERR_BAD_METHOD: &str = "Upgrade request must use GET";
    pub const ERR_BAD_STATUS: &str = "Server did not switch protocols";
    pub const ERR_BAD_ACCEPT: &str = "Sec-WebSocket-Accept does not match the request key";
}

/// Reason attached to the exactly-once disconnect notification of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The outbound connection could not be established.
    ConnectionFailed,
    /// The peer closed the socket or the socket faulted.
    ConnectionLost,
    /// The peer sent bytes that violate the wire protocol.
    InvalidDataReceived,
    /// A message could not be serialized or written.
    InvalidMessageSent,
    /// The peer exceeded its receive-rate ceiling.
    Spam,
    /// Local code asked for the disconnect.
    Manual,
}

impl DisconnectReason {
    /// All reasons, in declaration order.
    pub const ALL: [DisconnectReason; 6] = [
        DisconnectReason::ConnectionFailed,
        DisconnectReason::ConnectionLost,
        DisconnectReason::InvalidDataReceived,
        DisconnectReason::InvalidMessageSent,
        DisconnectReason::Spam,
        DisconnectReason::Manual,
    ];

    /// Stable lowercase name, used as a structured log field.
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::ConnectionFailed => "connection_failed",
            DisconnectReason::ConnectionLost => "connection_lost",
            DisconnectReason::InvalidDataReceived => "invalid_data_received",
            DisconnectReason::InvalidMessageSent => "invalid_message_sent",
            DisconnectReason::Spam => "spam",
            DisconnectReason::Manual => "manual",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Unknown message id: {0}")]
    UnknownMessage(u16),

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Entity has been disposed")]
    Disposed,

    #[error("Entity is not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Connection limit reached ({0} connections)")]
    ConnectionLimitReached(usize),

    #[error("Duplicate message id {id}: {existing} and {duplicate}")]
    DuplicateMessageId {
        id: u16,
        existing: &'static str,
        duplicate: &'static str,
    },

    #[error("Message {0} has a handler but was never registered")]
    UnregisteredMessage(&'static str),

    #[error("Duplicate handler for message {message} on {entity}")]
    DuplicateHandler {
        message: &'static str,
        entity: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Reason a receive-path failure maps to when it tears down a connection.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            ProtocolError::Io(_) | ProtocolError::ConnectionClosed => {
                DisconnectReason::ConnectionLost
            }
            ProtocolError::SerializeError(_) => DisconnectReason::InvalidMessageSent,
            ProtocolError::Disposed | ProtocolError::NotConnected => DisconnectReason::Manual,
            _ => DisconnectReason::InvalidDataReceived,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
