//! Receive and write paths shared by every transport.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedWrite};
use tracing::{debug, trace, warn};

use crate::error::{DisconnectReason, ProtocolError};
use crate::protocol::dispatcher::{DispatchTarget, Job};
use crate::protocol::registry::Registry;
use crate::protocol::{MessageParsingOutput, WireProtocol};
use crate::transport::entity::{Entity, Outlet};
use crate::transport::monitor::ConnectionMonitor;
use crate::utils::metrics::global_metrics;

/// Per-entity receive state: flood monitor, parser, pending bytes and dispatch.
pub(crate) struct ReceivePath<P> {
    entity: Arc<Entity>,
    registry: Arc<Registry>,
    monitor: ConnectionMonitor,
    parser: P,
    pending: BytesMut,
    dispatch: DispatchTarget,
    datagram: bool,
}

impl<P: WireProtocol> ReceivePath<P> {
    pub(crate) fn new(
        entity: Arc<Entity>,
        registry: Arc<Registry>,
        parser: P,
        max_receives_per_second: u32,
        dispatch: DispatchTarget,
    ) -> Self {
        Self {
            entity,
            registry,
            monitor: ConnectionMonitor::new(max_receives_per_second),
            parser,
            pending: BytesMut::new(),
            dispatch,
            datagram: false,
        }
    }

    /// Datagram mode: every receive must hold whole frames, and a full queue
    /// drops messages instead of stalling the shared socket.
    pub(crate) fn datagram(mut self) -> Self {
        self.datagram = true;
        self
    }

    pub(crate) fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    /// Feed one receive event. Returns `false` once the entity is torn down.
    pub(crate) async fn ingest(&mut self, bytes: &[u8]) -> bool {
        global_metrics().bytes_received(bytes.len() as u64);

        if !self.monitor.record_receive() {
            warn!(
                entity_id = self.entity.id(),
                remote = %self.entity.remote_addr(),
                max_per_second = self.monitor.max_per_second(),
                "Receive rate exceeded"
            );
            self.entity.disconnect(DisconnectReason::Spam);
            return false;
        }

        self.pending.extend_from_slice(bytes);
        let mut output = MessageParsingOutput::default();
        let mut parsed = self.parser.try_parse(&mut self.pending, &mut output);
        if parsed.is_ok() && self.datagram && !self.pending.is_empty() {
            parsed = Err(ProtocolError::InvalidFrame(format!(
                "datagram ends with a partial frame of {} bytes",
                self.pending.len()
            )));
        }

        if let Err(e) = parsed {
            global_metrics().protocol_error();
            warn!(
                entity_id = self.entity.id(),
                remote = %self.entity.remote_addr(),
                error = %e,
                "Dropping connection after protocol violation"
            );
            self.entity.disconnect(e.disconnect_reason());
            return false;
        }

        self.deliver(output).await
    }

    async fn deliver(&mut self, output: MessageParsingOutput) -> bool {
        for reply in output.replies {
            if self.entity.send_raw(reply).is_err() {
                return false;
            }
        }

        global_metrics().messages_received(output.messages.len() as u64);
        let entity_id = self.entity.id();
        for message in output.messages {
            trace!(entity_id, message_id = message.message_id(), "Queueing message");
            let registry = Arc::clone(&self.registry);
            let entity = Arc::clone(&self.entity);
            let job: Job = Box::new(move || registry.dispatch(&entity, message));

            let queued = if self.datagram {
                self.dispatch.try_enqueue(entity_id, job)
            } else {
                self.dispatch.enqueue(entity_id, job).await
            };
            if let Err(e) = queued {
                debug!(entity_id, error = %e, "Message not queued");
            }
        }

        if output.close_requested {
            self.entity.disconnect(DisconnectReason::ConnectionLost);
            return false;
        }
        self.entity.is_connected()
    }
}

/// Install a writer task for `writer` as the entity's outlet.
///
/// At most `capacity` frames wait for the socket; a send beyond that fails.
/// The task drains outbound bytes until the outlet is dropped at teardown,
/// then shuts the write half down.
pub(crate) fn attach_writer<W>(entity: &Arc<Entity>, writer: W, capacity: usize)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
    entity.set_outlet(Outlet::Stream(tx));
    let owner = Arc::downgrade(entity);

    tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, BytesCodec::new());
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = sink.send(bytes).await {
                if let Some(entity) = owner.upgrade() {
                    warn!(entity_id = entity.id(), error = %e, "Socket write failed");
                    entity.disconnect(DisconnectReason::InvalidMessageSent);
                }
                return;
            }
        }
        let _ = SinkExt::<Bytes>::close(&mut sink).await;
    });
}

/// Start the single read task of a stream entity.
///
/// `leftover` holds bytes that arrived during a handshake and is parsed first.
pub(crate) fn spawn_reader<R, P>(
    mut reader: R,
    mut path: ReceivePath<P>,
    leftover: BytesMut,
    buffer_len: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
    P: WireProtocol,
{
    let mut shutdown = path.entity().shutdown_signal();

    tokio::spawn(async move {
        if *shutdown.borrow() {
            return;
        }
        if !leftover.is_empty() && !path.ingest(&leftover).await {
            return;
        }

        let mut buf = vec![0u8; buffer_len.max(1)];
        loop {
            let n = tokio::select! {
                _ = shutdown.changed() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(entity_id = path.entity().id(), "Peer closed the connection");
                        path.entity().disconnect(DisconnectReason::ConnectionLost);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(entity_id = path.entity().id(), error = %e, "Socket read failed");
                        path.entity().disconnect(DisconnectReason::ConnectionLost);
                        break;
                    }
                },
            };

            if !path.ingest(&buf[..n]).await {
                break;
            }
        }
        trace!(entity_id = path.entity().id(), "Receive loop stopped");
    });
}
