//! # Server
//!
//! A [`Server`] binds one transport, accepts peers and owns the resulting
//! connections in its [`ConnectionTable`]. Every connection:
//! - gets a server-scoped id from [`IdProvider`] (starting at 1, never reused);
//! - is inserted into the table before its receive loop starts;
//! - is removed exactly once, inside its disconnecting notification;
//! - gets its own serial [`MessageQueue`](crate::protocol::dispatcher::MessageQueue).
//!
//! Stopping or dropping the server disconnects every connection with
//! [`DisconnectReason::Manual`].
//!
//! ## Example
//! ```rust,no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use network_engine::{Registry, Server, Transport};
//!
//! # async fn run() -> network_engine::error::Result<()> {
//! let registry = Registry::builder().build()?;
//! let server = Server::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000, registry);
//! server.on_connection_added(|conn| println!("peer {} joined", conn.id()));
//! let addr = server.start().await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::core::message::NetworkMessage;
use crate::error::{constants, DisconnectReason, ProtocolError, Result};
use crate::protocol::registry::Registry;
use crate::protocol::Framing;
use crate::transport::entity::{Entity, EntityKind, Transport};
use crate::transport::events::{DisconnectObserver, EntityObserver, ObserverList};
use crate::transport::group::ConnectionGroup;
use crate::transport::{tcp, udp};
use crate::utils::metrics::global_metrics;

/// Monotonic id source starting at 1.
#[derive(Debug)]
pub struct IdProvider {
    next: AtomicU32,
}

impl IdProvider {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Live connections of one server, keyed by id.
///
/// Capacity is claimed with [`try_reserve`](Self::try_reserve) when a
/// connection is created and handed back with [`release`](Self::release) when
/// it tears down, so concurrent accepts cannot overshoot `max_connections`.
#[derive(Debug)]
pub struct ConnectionTable {
    inner: DashMap<u32, Arc<Entity>>,
    reserved: AtomicUsize,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Claim one slot; `false` when every slot is taken.
    pub fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                (reserved < self.max_connections).then_some(reserved + 1)
            })
            .is_ok()
    }

    /// Return a slot claimed by `try_reserve`.
    pub fn release(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved.checked_sub(1)
            });
    }

    pub fn insert(&self, entity: Arc<Entity>) {
        self.inner.insert(entity.id(), entity);
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Entity>> {
        self.inner.remove(&id).map(|(_, entity)| entity)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Entity>> {
        self.inner.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Copy of the current connections, taken without holding any shard lock
    /// while the caller uses it.
    pub fn snapshot(&self) -> Vec<Arc<Entity>> {
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

/// State shared between a [`Server`] handle and its I/O tasks.
pub(crate) struct ServerCore {
    pub(crate) transport: Transport,
    pub(crate) config: NetworkConfig,
    pub(crate) registry: Arc<Registry>,
    table: ConnectionTable,
    ids: IdProvider,
    connection_added: ObserverList<EntityObserver>,
    connected: ObserverList<EntityObserver>,
    disconnecting: ObserverList<DisconnectObserver>,
    shutdown: watch::Sender<bool>,
}

impl ServerCore {
    pub(crate) fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Allocate a connection entity in `Connecting` holding one table slot,
    /// wired to leave the table and free the slot when it tears down.
    pub(crate) fn create_connection(
        self: &Arc<Self>,
        remote: SocketAddr,
        framing: Framing,
    ) -> Result<Arc<Entity>> {
        if !self.table.try_reserve() {
            global_metrics().connection_rejected();
            return Err(ProtocolError::ConnectionLimitReached(
                self.table.max_connections,
            ));
        }

        let entity = Entity::new(
            self.ids.next_id(),
            EntityKind::connection(self.transport),
            remote,
            framing,
        );
        if let Err(e) = entity.begin_connect() {
            self.table.release();
            return Err(e);
        }

        let core = Arc::downgrade(self);
        entity.on_disconnecting(move |entity, reason| {
            if let Some(core) = core.upgrade() {
                core.table.remove(entity.id());
                core.table.release();
                for observer in core.disconnecting.snapshot() {
                    observer(entity, reason);
                }
            }
        });
        Ok(entity)
    }

    /// Insert into the table, mark connected, and announce.
    ///
    /// The entity is already `Connected` when the added observers run, so
    /// they can send to it. Returns `false` if the connection was torn down
    /// in the meantime.
    pub(crate) fn register(&self, entity: &Arc<Entity>) -> bool {
        self.table.insert(Arc::clone(entity));
        if !entity.mark_connected() {
            self.table.remove(entity.id());
            return false;
        }
        for observer in self.connection_added.snapshot() {
            observer(entity);
        }
        for observer in self.connected.snapshot() {
            observer(entity);
        }
        if self.is_stopped() {
            entity.disconnect(DisconnectReason::Manual);
            return false;
        }
        true
    }
}

const IDLE: u8 = 0;
const LISTENING: u8 = 1;
const STOPPED: u8 = 2;

/// A listening endpoint for one transport.
pub struct Server {
    core: Arc<ServerCore>,
    bind_addr: SocketAddr,
    state: AtomicU8,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(
        transport: Transport,
        ip: IpAddr,
        port: u16,
        config: NetworkConfig,
        registry: Arc<Registry>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let table = ConnectionTable::new(config.server.max_connections);
        Self {
            core: Arc::new(ServerCore {
                transport,
                config,
                registry,
                table,
                ids: IdProvider::new(),
                connection_added: ObserverList::new(),
                connected: ObserverList::new(),
                disconnecting: ObserverList::new(),
                shutdown,
            }),
            bind_addr: SocketAddr::new(ip, port),
            state: AtomicU8::new(IDLE),
            local_addr: Mutex::new(None),
        }
    }

    /// TCP server with the default configuration.
    pub fn tcp(ip: IpAddr, port: u16, registry: Arc<Registry>) -> Self {
        Self::new(Transport::Tcp, ip, port, NetworkConfig::default(), registry)
    }

    /// UDP server with the default configuration.
    pub fn udp(ip: IpAddr, port: u16, registry: Arc<Registry>) -> Self {
        Self::new(Transport::Udp, ip, port, NetworkConfig::default(), registry)
    }

    /// WebSocket server with the default configuration.
    pub fn websocket(ip: IpAddr, port: u16, registry: Arc<Registry>) -> Self {
        Self::new(
            Transport::WebSocket,
            ip,
            port,
            NetworkConfig::default(),
            registry,
        )
    }

    /// Server bound to `config.server.address`.
    pub fn from_config(
        transport: Transport,
        config: NetworkConfig,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let addr: SocketAddr = config.server.address.parse().map_err(|_| {
            ProtocolError::ConfigError(format!(
                "Invalid server address: '{}'",
                config.server.address
            ))
        })?;
        Ok(Self::new(transport, addr.ip(), addr.port(), config, registry))
    }

    pub fn transport(&self) -> Transport {
        self.core.transport
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.core.config
    }

    /// Bind and start accepting. Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Err(state) =
            self.state
                .compare_exchange(IDLE, LISTENING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(if state == STOPPED {
                ProtocolError::Disposed
            } else {
                ProtocolError::InvalidState(constants::ERR_SERVER_RUNNING)
            });
        }

        let bound = match self.core.transport {
            Transport::Tcp | Transport::WebSocket => {
                tcp::listen(Arc::clone(&self.core), self.bind_addr).await
            }
            Transport::Udp => udp::listen(Arc::clone(&self.core), self.bind_addr).await,
        };

        match bound {
            Ok(addr) => {
                *self
                    .local_addr
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(addr);
                Ok(addr)
            }
            Err(e) => {
                let _ = self.state.compare_exchange(
                    LISTENING,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Err(e)
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state.load(Ordering::Acquire) == LISTENING
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection(&self, id: u32) -> Option<Arc<Entity>> {
        self.core.table.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.core.table.len()
    }

    pub fn connections(&self) -> Vec<Arc<Entity>> {
        self.core.table.snapshot()
    }

    /// Snapshot group of the connections matching `predicate`.
    pub fn connections_where<F>(&self, predicate: F) -> ConnectionGroup
    where
        F: Fn(&Arc<Entity>) -> bool,
    {
        ConnectionGroup::filtered(self.core.table.snapshot(), predicate)
    }

    /// Send `message` to every live connection; returns the number of successful sends.
    pub fn broadcast<M: NetworkMessage>(&self, message: &M) -> usize {
        ConnectionGroup::new(self.core.table.snapshot()).send_to_all(message)
    }

    /// Fires when a connection enters the table; it is already connected.
    pub fn on_connection_added<F>(&self, observer: F)
    where
        F: Fn(&Arc<Entity>) + Send + Sync + 'static,
    {
        self.core.connection_added.subscribe(Arc::new(observer));
    }

    /// Fires when a connection reaches `Connected`.
    pub fn on_connected<F>(&self, observer: F)
    where
        F: Fn(&Arc<Entity>) + Send + Sync + 'static,
    {
        self.core.connected.subscribe(Arc::new(observer));
    }

    /// Fires once per connection when it starts tearing down.
    pub fn on_disconnecting<F>(&self, observer: F)
    where
        F: Fn(&Arc<Entity>, DisconnectReason) + Send + Sync + 'static,
    {
        self.core.disconnecting.subscribe(Arc::new(observer));
    }

    /// Stop accepting and disconnect every connection. Idempotent.
    pub fn stop(&self) {
        if self.state.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return;
        }
        self.core.shutdown.send_replace(true);

        let connections = self.core.table.snapshot();
        info!(
            transport = %self.core.transport,
            connections = connections.len(),
            "Stopping server"
        );
        for connection in connections {
            connection.disconnect(DisconnectReason::Manual);
        }
        if !self.core.table.is_empty() {
            warn!(
                remaining = self.core.table.len(),
                "Connections left in table after stop"
            );
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let ids = IdProvider::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_table_limit() {
        let table = ConnectionTable::new(1);
        assert!(table.try_reserve());
        assert!(!table.try_reserve());
        table.insert(Entity::new(
            1,
            EntityKind::connection(Transport::Tcp),
            "127.0.0.1:1".parse().unwrap(),
            Framing::LengthPrefixed,
        ));
        assert!(table.remove(1).is_some());
        table.release();
        assert!(table.is_empty());
        assert!(table.try_reserve());
    }

    #[test]
    fn test_concurrent_reservations_respect_limit() {
        let table = Arc::new(ConnectionTable::new(4));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.try_reserve())
            })
            .collect();
        let granted = threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 4);

        // Releasing more than was reserved saturates at zero.
        for _ in 0..5 {
            table.release();
        }
        for _ in 0..4 {
            assert!(table.try_reserve());
        }
        assert!(!table.try_reserve());
    }

    #[tokio::test]
    async fn test_start_twice_and_after_stop() {
        let registry = Registry::builder().build().unwrap();
        let server = Server::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, registry);
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(
            server.start().await,
            Err(ProtocolError::InvalidState(_))
        ));

        server.stop();
        server.stop();
        assert!(matches!(server.start().await, Err(ProtocolError::Disposed)));
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_address() {
        let registry = Registry::builder().build().unwrap();
        let config = NetworkConfig::default_with_overrides(|c| c.server.address = "nope".into());
        assert!(Server::from_config(Transport::Tcp, config, registry).is_err());
    }
}
