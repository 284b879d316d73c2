//! # Client
//!
//! An outbound endpoint. A client is single-use: once it has disconnected,
//! for whatever reason, `connect` fails with [`ProtocolError::Disposed`];
//! create a new client instead.
//!
//! Received messages are dispatched on one [`WorkerPool`] shared by every
//! client in the process, sized from the configuration of the first client
//! that connects. Each client maps to one worker, so its messages are handled
//! in order.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::{Lazy, OnceCell};
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::core::message::NetworkMessage;
use crate::error::{DisconnectReason, ProtocolError, Result};
use crate::protocol::dispatcher::{DispatchTarget, WorkerPool};
use crate::protocol::registry::Registry;
use crate::protocol::Framing;
use crate::transport::entity::{ConnectionState, Entity, EntityKind, Transport};
use crate::transport::server::IdProvider;
use crate::transport::{tcp, udp, websocket};

static CLIENT_IDS: Lazy<IdProvider> = Lazy::new(IdProvider::new);
static SHARED_POOL: OnceCell<Arc<WorkerPool>> = OnceCell::new();

pub struct Client {
    entity: Arc<Entity>,
    config: NetworkConfig,
    registry: Arc<Registry>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
}

impl Client {
    /// Client for `ip:port` with the default configuration.
    pub fn new(transport: Transport, ip: IpAddr, port: u16, registry: Arc<Registry>) -> Self {
        Self::with_config(transport, ip, port, NetworkConfig::default(), registry)
    }

    pub fn with_config(
        transport: Transport,
        ip: IpAddr,
        port: u16,
        config: NetworkConfig,
        registry: Arc<Registry>,
    ) -> Self {
        let framing = match transport {
            Transport::WebSocket => Framing::WebSocket { masked: true },
            Transport::Tcp | Transport::Udp => Framing::LengthPrefixed,
        };
        let entity = Entity::new(
            CLIENT_IDS.next_id(),
            EntityKind::client(transport),
            SocketAddr::new(ip, port),
            framing,
        );
        Self {
            entity,
            config,
            registry,
            pool: Mutex::new(None),
        }
    }

    /// Client for `config.client.address`.
    pub fn from_config(
        transport: Transport,
        config: NetworkConfig,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let addr: SocketAddr = config.client.address.parse().map_err(|_| {
            ProtocolError::ConfigError(format!(
                "Invalid client address: '{}'",
                config.client.address
            ))
        })?;
        Ok(Self::with_config(
            transport,
            addr.ip(),
            addr.port(),
            config,
            registry,
        ))
    }

    /// Dispatch on `pool` instead of the process-wide client pool.
    pub fn with_pool(self, pool: Arc<WorkerPool>) -> Self {
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        self
    }

    pub fn id(&self) -> u32 {
        self.entity.id()
    }

    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn state(&self) -> ConnectionState {
        self.entity.state()
    }

    pub fn is_connected(&self) -> bool {
        self.entity.is_connected()
    }

    pub fn on_connected<F>(&self, observer: F)
    where
        F: Fn(&Arc<Entity>) + Send + Sync + 'static,
    {
        self.entity.on_connected(observer);
    }

    pub fn on_disconnecting<F>(&self, observer: F)
    where
        F: Fn(&Arc<Entity>, DisconnectReason) + Send + Sync + 'static,
    {
        self.entity.on_disconnecting(observer);
    }

    fn worker_pool(&self) -> Result<Arc<WorkerPool>> {
        if let Some(pool) = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Arc::clone(pool));
        }
        SHARED_POOL
            .get_or_try_init(|| {
                WorkerPool::new(
                    self.config.client.worker_count,
                    self.config.protocol.dispatch_queue_capacity,
                )
            })
            .map(Arc::clone)
    }

    /// Open the socket and start receiving.
    ///
    /// On failure the client is torn down with
    /// [`DisconnectReason::ConnectionFailed`] and the error is returned.
    pub async fn connect(&self) -> Result<()> {
        self.entity.begin_connect()?;
        let dispatch = match self.worker_pool() {
            Ok(pool) => DispatchTarget::Pool(pool),
            Err(e) => {
                warn!(client_id = self.id(), error = %e, "Failed to start worker pool");
                self.entity.disconnect(DisconnectReason::ConnectionFailed);
                return Err(e);
            }
        };
        let transport = self.entity.transport();
        info!(
            client_id = self.id(),
            transport = %transport,
            remote = %self.entity.remote_addr(),
            "Connecting"
        );

        let attempt = async {
            match transport {
                Transport::Tcp => {
                    tcp::connect(&self.entity, &self.config, &self.registry, dispatch).await
                }
                Transport::Udp => {
                    udp::connect(&self.entity, &self.config, &self.registry, dispatch).await
                }
                Transport::WebSocket => {
                    websocket::connect(&self.entity, &self.config, &self.registry, dispatch)
                        .await
                }
            }
        };
        let result = match tokio::time::timeout(self.config.client.connect_timeout, attempt).await
        {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::TransportError(format!(
                "connect timed out after {:?}",
                self.config.client.connect_timeout
            ))),
        };

        if let Err(e) = result {
            warn!(client_id = self.id(), error = %e, "Connect failed");
            self.entity.disconnect(DisconnectReason::ConnectionFailed);
            return Err(e);
        }
        Ok(())
    }

    pub fn send<M: NetworkMessage>(&self, message: &M) -> Result<()> {
        self.entity.send(message)
    }

    /// Manual disconnect. Idempotent.
    pub fn disconnect(&self) {
        self.entity.disconnect(DisconnectReason::Manual);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
