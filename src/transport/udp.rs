//! UDP server and client.
//!
//! One bound socket serves every peer of a server; peers are keyed by their
//! remote address. The first datagram from an unseen address creates the
//! connection. Each datagram must hold whole frames. A peer's receive state
//! is dropped as soon as its connection tears down.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::{DisconnectReason, ProtocolError, Result};
use crate::protocol::dispatcher::{DispatchTarget, MessageQueue};
use crate::protocol::registry::Registry;
use crate::protocol::wire::FrameCodec;
use crate::protocol::Framing;
use crate::transport::entity::{Entity, Outlet};
use crate::transport::server::ServerCore;
use crate::transport::stream::ReceivePath;

/// Largest possible UDP payload; datagrams are never split across receives.
const MAX_DATAGRAM: usize = 65_536;

fn datagram_buffer(config: &NetworkConfig) -> Vec<u8> {
    vec![0u8; config.protocol.network_buffer_length.max(MAX_DATAGRAM)]
}

/// Bind `addr` and spawn the receive loop. Returns the bound address.
pub(crate) async fn listen(core: Arc<ServerCore>, addr: SocketAddr) -> Result<SocketAddr> {
    let socket = UdpSocket::bind(addr).await.map_err(|e| {
        error!(address = %addr, error = %e, "Failed to bind socket");
        e
    })?;
    let local = socket.local_addr()?;
    info!(address = %local, transport = "udp", "Listening");

    tokio::spawn(receive_loop(core, Arc::new(socket)));
    Ok(local)
}

async fn receive_loop(core: Arc<ServerCore>, socket: Arc<UdpSocket>) {
    let mut shutdown = core.shutdown_signal();
    let mut peers: HashMap<SocketAddr, ReceivePath<FrameCodec>> = HashMap::new();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<SocketAddr>();
    let mut buf = datagram_buffer(&core.config);

    loop {
        let (n, addr) = tokio::select! {
            _ = shutdown.changed() => break,
            Some(closed) = closed_rx.recv() => {
                prune(&mut peers, closed);
                continue;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors surface here on some platforms; the socket stays usable.
                    debug!(error = %e, "Datagram receive failed");
                    continue;
                }
            },
        };

        prune(&mut peers, addr);
        if !peers.contains_key(&addr) {
            match open_peer(&core, &socket, addr, &closed_tx) {
                Ok(path) => {
                    peers.insert(addr, path);
                }
                Err(e) => {
                    warn!(peer = %addr, error = %e, "Ignoring datagram");
                    continue;
                }
            }
        }

        if let Some(path) = peers.get_mut(&addr) {
            trace!(peer = %addr, len = n, "Datagram received");
            path.ingest(&buf[..n]).await;
        }
    }

    info!("UDP receive loop stopped");
}

/// Drop the receive state of `addr` if its connection has torn down.
fn prune(peers: &mut HashMap<SocketAddr, ReceivePath<FrameCodec>>, addr: SocketAddr) {
    if peers
        .get(&addr)
        .is_some_and(|path| path.entity().is_disposed())
    {
        peers.remove(&addr);
        trace!(peer = %addr, "Peer state released");
    }
}

fn open_peer(
    core: &Arc<ServerCore>,
    socket: &Arc<UdpSocket>,
    addr: SocketAddr,
    closed: &mpsc::UnboundedSender<SocketAddr>,
) -> Result<ReceivePath<FrameCodec>> {
    let entity = core.create_connection(addr, Framing::LengthPrefixed)?;
    entity.set_outlet(Outlet::Datagram {
        socket: Arc::clone(socket),
        peer: Some(addr),
    });
    let closed = closed.clone();
    entity.on_disconnecting(move |_, _| {
        let _ = closed.send(addr);
    });

    let protocol = &core.config.protocol;
    let queue = MessageQueue::spawn(protocol.dispatch_queue_capacity);
    if !core.register(&entity) {
        return Err(ProtocolError::Disposed);
    }

    let codec = FrameCodec::new(Arc::clone(&core.registry), protocol.max_payload_size);
    Ok(ReceivePath::new(
        entity,
        Arc::clone(&core.registry),
        codec,
        protocol.max_receives_per_second,
        DispatchTarget::Queue(queue),
    )
    .datagram())
}

/// Connect a UDP client entity (already `Connecting`).
///
/// Connected as soon as the local socket is bound and connected.
pub(crate) async fn connect(
    entity: &Arc<Entity>,
    config: &NetworkConfig,
    registry: &Arc<Registry>,
    dispatch: DispatchTarget,
) -> Result<()> {
    let remote = entity.remote_addr();
    let unspecified = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
    socket.connect(remote).await?;
    let socket = Arc::new(socket);

    entity.set_outlet(Outlet::Datagram {
        socket: Arc::clone(&socket),
        peer: None,
    });
    if !entity.mark_connected() {
        return Err(ProtocolError::Disposed);
    }

    let protocol = &config.protocol;
    let codec = FrameCodec::new(Arc::clone(registry), protocol.max_payload_size);
    let mut path = ReceivePath::new(
        Arc::clone(entity),
        Arc::clone(registry),
        codec,
        protocol.max_receives_per_second,
        dispatch,
    )
    .datagram();
    let mut shutdown = entity.shutdown_signal();
    let mut buf = datagram_buffer(config);

    tokio::spawn(async move {
        if *shutdown.borrow() {
            return;
        }
        loop {
            let n = tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv(&mut buf) => match received {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(entity_id = path.entity().id(), error = %e, "Datagram receive failed");
                        path.entity().disconnect(DisconnectReason::ConnectionLost);
                        break;
                    }
                },
            };
            if !path.ingest(&buf[..n]).await {
                break;
            }
        }
    });
    Ok(())
}
