//! Observability and Metrics
//!
//! This module provides metrics collection for monitoring engine throughput
//! and connection health.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::DisconnectReason;

/// Global metrics collector for engine operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections opened (server connections and clients)
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections refused because a server table was full
    pub connections_rejected: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Disconnects, indexed like [`DisconnectReason::ALL`]
    disconnects: [AtomicU64; DisconnectReason::ALL.len()],
    /// Protocol errors (bad frames, unknown ids, failed handshakes)
    pub protocol_errors: AtomicU64,
    /// Handlers that returned an error or panicked
    pub handler_failures: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            disconnects: Default::default(),
            protocol_errors: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record the reason of a teardown
    pub fn disconnect_recorded(&self, reason: DisconnectReason) {
        self.disconnects[reason_index(reason)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection refused by a full table
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a receive event
    pub fn bytes_received(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record parsed messages
    pub fn messages_received(&self, count: u64) {
        self.messages_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed or panicked handler
    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Disconnects recorded for `reason`
    pub fn disconnects(&self, reason: DisconnectReason) -> u64 {
        self.disconnects[reason_index(reason)].load(Ordering::Relaxed)
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            disconnects: DisconnectReason::ALL.map(|reason| (reason, self.disconnects(reason))),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            protocol_errors = snapshot.protocol_errors,
            handler_failures = snapshot.handler_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Engine metrics snapshot"
        );
        for (reason, count) in snapshot.disconnects {
            debug!(reason = %reason, count, "Disconnects by reason");
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn reason_index(reason: DisconnectReason) -> usize {
    match reason {
        DisconnectReason::ConnectionFailed => 0,
        DisconnectReason::ConnectionLost => 1,
        DisconnectReason::InvalidDataReceived => 2,
        DisconnectReason::InvalidMessageSent => 3,
        DisconnectReason::Spam => 4,
        DisconnectReason::Manual => 5,
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub disconnects: [(DisconnectReason, u64); DisconnectReason::ALL.len()],
    pub protocol_errors: u64,
    pub handler_failures: u64,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
