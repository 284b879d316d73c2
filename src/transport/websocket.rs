//! WebSocket upgrade on top of TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::DispatchTarget;
use crate::protocol::handshake::{client_handshake, server_handshake};
use crate::protocol::registry::Registry;
use crate::protocol::websocket::WebSocketCodec;
use crate::protocol::Framing;
use crate::transport::entity::Entity;
use crate::transport::server::ServerCore;
use crate::transport::stream::{attach_writer, spawn_reader, ReceivePath};
use crate::transport::tcp::open_stream;
use crate::utils::metrics::global_metrics;

/// Upgrade an accepted socket; the connection exists only once this succeeds.
pub(crate) async fn accept(core: Arc<ServerCore>, mut socket: TcpStream, peer: SocketAddr) {
    let mut shutdown = core.shutdown_signal();
    let upgraded = tokio::select! {
        _ = shutdown.changed() => return,
        upgraded = server_handshake(&mut socket) => upgraded,
    };

    match upgraded {
        Ok((request, leftover)) => {
            debug!(peer = %peer, path = %request.path, "WebSocket peer upgraded");
            let codec = WebSocketCodec::server(
                Arc::clone(&core.registry),
                core.config.protocol.max_payload_size,
            );
            open_stream(
                &core,
                socket,
                peer,
                Framing::WebSocket { masked: false },
                codec,
                leftover,
            );
        }
        Err(e) => {
            global_metrics().protocol_error();
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
        }
    }
}

/// Connect a WebSocket client entity (already `Connecting`).
pub(crate) async fn connect(
    entity: &Arc<Entity>,
    config: &NetworkConfig,
    registry: &Arc<Registry>,
    dispatch: DispatchTarget,
) -> Result<()> {
    let remote = entity.remote_addr();
    let mut socket = TcpStream::connect(remote).await?;
    if let Err(e) = socket.set_nodelay(config.client.nodelay) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let host = remote.to_string();
    let leftover = client_handshake(&mut socket, &host, &config.client.websocket_path).await?;

    let protocol = &config.protocol;
    let (read_half, write_half) = socket.into_split();
    attach_writer(entity, write_half, protocol.outbound_queue_capacity);
    if !entity.mark_connected() {
        return Err(ProtocolError::Disposed);
    }

    let codec = WebSocketCodec::client(Arc::clone(registry), protocol.max_payload_size);
    let path = ReceivePath::new(
        Arc::clone(entity),
        Arc::clone(registry),
        codec,
        protocol.max_receives_per_second,
        dispatch,
    );
    spawn_reader(read_half, path, leftover, protocol.network_buffer_length);
    Ok(())
}
