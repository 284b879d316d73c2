//! # Transport Layer
//!
//! Clients, servers and the entities they manage, over TCP, UDP and WebSocket.
//!
//! ## Components
//! - **Entity**: lifecycle state machine, outbound outlet, observers, user data
//! - **Server**: accept loop, connection table, id provider
//! - **Client**: single-use outbound endpoint
//! - **Monitor**: per-connection flood detection
//! - **Group**: snapshot broadcast lists
//!
//! ## Threading
//! Each stream entity owns one read task and one write task. A UDP server owns
//! one receive task for all of its peers. Handlers never run on these tasks.

pub mod client;
pub mod entity;
pub mod events;
pub mod group;
pub mod monitor;
pub mod server;

mod stream;
mod tcp;
mod udp;
mod websocket;
