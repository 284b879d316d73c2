//! # Utility Modules
//!
//! Supporting utilities shared by the protocol and transport layers.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup driven by [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: process-wide atomic counters for connections, traffic and disconnects

pub mod logging;
pub mod metrics;

pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
