//! TCP listener and client connect. The WebSocket transport reuses the
//! accept loop and upgrades each socket before it becomes a connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{DispatchTarget, MessageQueue};
use crate::protocol::registry::Registry;
use crate::protocol::wire::FrameCodec;
use crate::protocol::{Framing, WireProtocol};
use crate::transport::entity::{Entity, Transport};
use crate::transport::server::ServerCore;
use crate::transport::stream::{attach_writer, spawn_reader, ReceivePath};
use crate::transport::websocket;

/// Bind `addr` and spawn the accept loop. Returns the bound address.
pub(crate) async fn listen(core: Arc<ServerCore>, addr: SocketAddr) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(address = %addr, error = %e, "Failed to bind listener");
        e
    })?;
    let local = listener.local_addr()?;
    info!(address = %local, transport = %core.transport, "Listening");

    let mut shutdown = core.shutdown_signal();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!(peer = %peer, "Accepted socket");
                        if core.transport == Transport::WebSocket {
                            tokio::spawn(websocket::accept(Arc::clone(&core), socket, peer));
                        } else {
                            let codec = FrameCodec::new(
                                Arc::clone(&core.registry),
                                core.config.protocol.max_payload_size,
                            );
                            open_stream(
                                &core,
                                socket,
                                peer,
                                Framing::LengthPrefixed,
                                codec,
                                BytesMut::new(),
                            );
                        }
                    }
                    Err(e) => {
                        // Accept errors are usually EMFILE; pause before retrying.
                        error!(error = %e, "Error accepting connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        info!(address = %local, "Listener stopped");
    });

    Ok(local)
}

/// Turn an accepted (and, for WebSocket, upgraded) socket into a live connection.
pub(crate) fn open_stream<P: WireProtocol>(
    core: &Arc<ServerCore>,
    socket: TcpStream,
    peer: SocketAddr,
    framing: Framing,
    parser: P,
    leftover: BytesMut,
) {
    let entity = match core.create_connection(peer, framing) {
        Ok(entity) => entity,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Refusing connection");
            return;
        }
    };
    if let Err(e) = socket.set_nodelay(core.config.server.nodelay) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let protocol = &core.config.protocol;
    let (read_half, write_half) = socket.into_split();
    attach_writer(&entity, write_half, protocol.outbound_queue_capacity);

    let queue = MessageQueue::spawn(protocol.dispatch_queue_capacity);
    if !core.register(&entity) {
        return;
    }

    let path = ReceivePath::new(
        Arc::clone(&entity),
        Arc::clone(&core.registry),
        parser,
        protocol.max_receives_per_second,
        DispatchTarget::Queue(queue),
    );
    spawn_reader(read_half, path, leftover, protocol.network_buffer_length);
}

/// Connect a TCP client entity (already `Connecting`).
pub(crate) async fn connect(
    entity: &Arc<Entity>,
    config: &NetworkConfig,
    registry: &Arc<Registry>,
    dispatch: DispatchTarget,
) -> Result<()> {
    let socket = TcpStream::connect(entity.remote_addr()).await?;
    if let Err(e) = socket.set_nodelay(config.client.nodelay) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let protocol = &config.protocol;
    let (read_half, write_half) = socket.into_split();
    attach_writer(entity, write_half, protocol.outbound_queue_capacity);
    if !entity.mark_connected() {
        return Err(ProtocolError::Disposed);
    }

    let codec = FrameCodec::new(Arc::clone(registry), protocol.max_payload_size);
    let path = ReceivePath::new(
        Arc::clone(entity),
        Arc::clone(registry),
        codec,
        protocol.max_receives_per_second,
        dispatch,
    );
    spawn_reader(read_half, path, BytesMut::new(), protocol.network_buffer_length);
    Ok(())
}
