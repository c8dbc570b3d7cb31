//! # Utility Modules
//!
//! Supporting utilities for logging, timing and observability.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup from the `[logging]` config section
//! - **Timeout**: default protocol timings and an async timeout wrapper
//! - **Metrics**: per-node atomic counters

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
