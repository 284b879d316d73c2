//! # Dispatch
//!
//! Handlers never run on an I/O task. Server connections each own a serial
//! [`MessageQueue`]; clients share a [`WorkerPool`] of such queues.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use crate::error::{ProtocolError, Result};
use crate::utils::metrics::global_metrics;

/// Deferred handler invocation.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serial job queue: a bounded channel drained by one worker.
///
/// Jobs run one at a time, in submission order, on tokio's blocking pool
/// ([`spawn`](Self::spawn)) or a dedicated thread
/// ([`spawn_thread`](Self::spawn_thread)), so a slow handler never occupies an
/// I/O worker. A panicking job is logged and
/// the queue moves on. Dropping the queue lets the worker finish the jobs
/// already submitted and exit.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    tx: mpsc::Sender<Job>,
}

impl MessageQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    global_metrics().handler_failed();
                    if e.is_panic() {
                        warn!("Message handler panicked");
                    } else {
                        warn!(error = %e, "Message handler was cancelled");
                    }
                }
            }
            trace!("Message queue drained");
        });
        Self { tx }
    }

    /// Start the worker on a dedicated OS thread named `name`.
    ///
    /// The queue does not depend on any tokio runtime, so it can outlive the
    /// runtime that first used it.
    pub fn spawn_thread(capacity: usize, name: String) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        thread::Builder::new().name(name).spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    global_metrics().handler_failed();
                    warn!("Message handler panicked");
                }
            }
            trace!("Message queue drained");
        })?;
        Ok(Self { tx })
    }

    /// Submit a job, waiting while the queue is full.
    pub async fn enqueue(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Submit a job without waiting; fails when the queue is full.
    pub fn try_enqueue(&self, job: Job) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => ProtocolError::Custom("dispatch queue is full".into()),
            TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }
}

/// Fixed set of serial queues shared by clients, each on its own thread.
///
/// An entity always maps to the same worker, which keeps its messages in order.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<MessageQueue>,
}

impl WorkerPool {
    /// Start `workers` queues of `capacity` each.
    pub fn new(workers: usize, capacity: usize) -> Result<Arc<Self>> {
        let workers = (0..workers.max(1))
            .map(|i| {
                MessageQueue::spawn_thread(capacity, format!("network-engine-worker-{i}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(Self { workers }))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue serving `entity_id`.
    pub fn worker_for(&self, entity_id: u32) -> &MessageQueue {
        &self.workers[entity_id as usize % self.workers.len()]
    }
}

/// Where a receive path sends parsed messages.
#[derive(Debug, Clone)]
pub(crate) enum DispatchTarget {
    Queue(MessageQueue),
    Pool(Arc<WorkerPool>),
}

impl DispatchTarget {
    fn queue(&self, entity_id: u32) -> &MessageQueue {
        match self {
            DispatchTarget::Queue(queue) => queue,
            DispatchTarget::Pool(pool) => pool.worker_for(entity_id),
        }
    }

    pub(crate) async fn enqueue(&self, entity_id: u32, job: Job) -> Result<()> {
        self.queue(entity_id).enqueue(job).await
    }

    pub(crate) fn try_enqueue(&self, entity_id: u32, job: Job) -> Result<()> {
        self.queue(entity_id).try_enqueue(job)
    }
}
