//! # Core Message Components
//!
//! Payload encoding and the message contract shared by every transport.
//!
//! ## Components
//! - **Binary**: little-endian reader/writer primitives and the
//!   [`Serializable`](binary::Serializable) composite-object contract
//! - **Message**: [`NetworkMessage`](message::NetworkMessage) and its
//!   type-erased [`AnyMessage`](message::AnyMessage) view
//!
//! ## Security
//! - Reads are bounds-checked and never panic
//! - Length prefixes are validated before allocation

pub mod binary;
pub mod message;
