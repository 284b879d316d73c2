//! # Transport Entities
//!
//! [`Entity`] is the shared lifecycle and socket helper behind every client
//! and every server-side connection. Application code receives
//! `&Arc<Entity>` in handlers and observers, and uses it to send, inspect or
//! disconnect.
//!
//! ## Lifecycle
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`
//!
//! Teardown is guarded by a single atomic flag: whichever path calls
//! [`Entity::disconnect`] first wins, the disconnecting observers fire once
//! with that reason, and the entity is disposed. Later calls are no-ops.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::core::message::{AnyMessage, NetworkMessage};
use crate::error::{constants, DisconnectReason, ProtocolError, Result};
use crate::protocol::Framing;
use crate::transport::events::{DisconnectObserver, EntityObserver, ObserverList};
use crate::utils::metrics::global_metrics;

/// Socket family of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    WebSocket,
}

impl Transport {
    pub const ALL: [Transport; 3] = [Transport::Tcp, Transport::Udp, Transport::WebSocket];

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of a link an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Outbound endpoint created by the application.
    Client,
    /// Server-side endpoint created on accept.
    Connection,
}

/// Transport + role; the key of the handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKind {
    pub transport: Transport,
    pub role: Role,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::client(Transport::Tcp),
        EntityKind::client(Transport::Udp),
        EntityKind::client(Transport::WebSocket),
        EntityKind::connection(Transport::Tcp),
        EntityKind::connection(Transport::Udp),
        EntityKind::connection(Transport::WebSocket),
    ];

    pub const fn client(transport: Transport) -> Self {
        Self {
            transport,
            role: Role::Client,
        }
    }

    pub const fn connection(transport: Transport) -> Self {
        Self {
            transport,
            role: Role::Connection,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Client => "client",
            Role::Connection => "connection",
        };
        write!(f, "{} {role}", self.transport)
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn replace(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Where outbound bytes go.
pub(crate) enum Outlet {
    /// Bounded queue drained by the writer task of a stream socket.
    Stream(mpsc::Sender<Bytes>),
    /// Shared datagram socket; `peer` is `None` for a connected client socket.
    Datagram {
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
    },
}

type UserData = Arc<dyn Any + Send + Sync>;

/// A client or a server-side connection.
pub struct Entity {
    id: u32,
    kind: EntityKind,
    remote_addr: SocketAddr,
    framing: Framing,
    state: StateCell,
    teardown: AtomicBool,
    outlet: Mutex<Option<Outlet>>,
    shutdown: watch::Sender<bool>,
    connected: ObserverList<EntityObserver>,
    disconnecting: ObserverList<DisconnectObserver>,
    user_data: RwLock<Option<UserData>>,
}

impl Entity {
    pub(crate) fn new(
        id: u32,
        kind: EntityKind,
        remote_addr: SocketAddr,
        framing: Framing,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            kind,
            remote_addr,
            framing,
            state: StateCell::new(ConnectionState::Disconnected),
            teardown: AtomicBool::new(false),
            outlet: Mutex::new(None),
            shutdown,
            connected: ObserverList::new(),
            disconnecting: ObserverList::new(),
            user_data: RwLock::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn transport(&self) -> Transport {
        self.kind.transport
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True once teardown has started; the entity cannot be reused.
    pub fn is_disposed(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    /// Fires once when the entity reaches `Connected`.
    pub fn on_connected<F>(&self, observer: F)
    where
        F: Fn(&Arc<Entity>) + Send + Sync + 'static,
    {
        self.connected.subscribe(Arc::new(observer));
    }

    /// Fires once, with the winning reason, when teardown starts.
    pub fn on_disconnecting<F>(&self, observer: F)
    where
        F: Fn(&Arc<Entity>, DisconnectReason) + Send + Sync + 'static,
    {
        self.disconnecting.subscribe(Arc::new(observer));
    }

    /// Attach an application value to this entity, replacing any previous one.
    pub fn set_user_data<T: Any + Send + Sync>(&self, value: T) {
        *self.user_data.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(value));
    }

    /// The attached value, if one of type `T` is set.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.user_data.read().unwrap_or_else(PoisonError::into_inner);
        slot.clone().and_then(|data| data.downcast::<T>().ok())
    }

    pub fn clear_user_data(&self) {
        *self.user_data.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Serialize and send a typed message.
    pub fn send<M: NetworkMessage>(self: &Arc<Self>, message: &M) -> Result<()> {
        self.send_message(message)
    }

    /// Serialize and send a type-erased message.
    ///
    /// Best effort: the bytes are handed to the outlet and the call returns.
    /// A serialization failure, a write failure or a full outbound queue
    /// disconnects the entity with [`DisconnectReason::InvalidMessageSent`].
    pub fn send_message(self: &Arc<Self>, message: &dyn AnyMessage) -> Result<()> {
        if self.is_disposed() {
            return Err(ProtocolError::Disposed);
        }
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }

        let mut buf = BytesMut::new();
        if let Err(e) = self.framing.encode(message, &mut buf) {
            warn!(
                entity_id = self.id,
                message = message.message_name(),
                error = %e,
                "Failed to serialize message"
            );
            self.disconnect(DisconnectReason::InvalidMessageSent);
            return Err(e);
        }

        trace!(
            entity_id = self.id,
            message_id = message.message_id(),
            len = buf.len(),
            "Sending message"
        );
        let len = buf.len() as u64;
        self.send_raw(buf.freeze())?;
        global_metrics().message_sent(len);
        Ok(())
    }

    /// Hand already-framed bytes to the outlet.
    pub(crate) fn send_raw(self: &Arc<Self>, bytes: Bytes) -> Result<()> {
        let result = {
            let outlet = self.outlet.lock().unwrap_or_else(PoisonError::into_inner);
            match outlet.as_ref() {
                None => return Err(ProtocolError::Disposed),
                Some(Outlet::Stream(tx)) => tx.try_send(bytes).map_err(|e| match e {
                    TrySendError::Full(_) => {
                        ProtocolError::TransportError(constants::ERR_OUTBOUND_FULL.into())
                    }
                    TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
                }),
                Some(Outlet::Datagram { socket, peer }) => {
                    let sent = match peer {
                        Some(peer) => socket.try_send_to(&bytes, *peer),
                        None => socket.try_send(&bytes),
                    };
                    match sent {
                        Ok(_) => Ok(()),
                        // Datagrams are unreliable; a full socket buffer drops this one.
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            debug!(entity_id = self.id, "Datagram dropped, socket busy");
                            Ok(())
                        }
                        Err(e) => Err(ProtocolError::Io(e)),
                    }
                }
            }
        };

        if let Err(e) = result {
            warn!(entity_id = self.id, error = %e, "Failed to write to socket");
            self.disconnect(DisconnectReason::InvalidMessageSent);
            return Err(e);
        }
        Ok(())
    }

    /// Tear the entity down. Idempotent; only the first call has an effect.
    pub fn disconnect(self: &Arc<Self>, reason: DisconnectReason) {
        if self
            .teardown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let previous = self.state.replace(ConnectionState::Disconnecting);
        info!(
            entity_id = self.id,
            kind = %self.kind,
            remote = %self.remote_addr,
            reason = %reason,
            "Disconnecting"
        );

        for observer in self.disconnecting.take() {
            observer(self, reason);
        }
        self.connected.take();

        self.outlet
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shutdown.send_replace(true);
        self.state.set(ConnectionState::Disconnected);

        let metrics = global_metrics();
        metrics.disconnect_recorded(reason);
        if previous == ConnectionState::Connected {
            metrics.connection_closed();
        }
    }

    /// Manual disconnect.
    pub fn close(self: &Arc<Self>) {
        self.disconnect(DisconnectReason::Manual);
    }

    /// `Disconnected → Connecting`, once.
    pub(crate) fn begin_connect(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ProtocolError::Disposed);
        }
        if !self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(ProtocolError::InvalidState(constants::ERR_ALREADY_CONNECTING));
        }
        Ok(())
    }

    /// `Connecting → Connected`; fires the connected observers.
    ///
    /// Returns `false` if teardown won the race.
    pub(crate) fn mark_connected(self: &Arc<Self>) -> bool {
        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            return false;
        }
        global_metrics().connection_opened();
        info!(
            entity_id = self.id,
            kind = %self.kind,
            remote = %self.remote_addr,
            "Connected"
        );
        for observer in self.connected.take() {
            observer(self);
        }
        true
    }

    pub(crate) fn set_outlet(&self, outlet: Outlet) {
        let mut slot = self.outlet.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_disposed() {
            *slot = Some(outlet);
        }
    }

    /// Resolves (changes to `true`) when teardown runs.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
