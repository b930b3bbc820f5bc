//! Observability: in-process metrics exposed on the admin listener

pub mod metrics;

pub use metrics::{ActivatorMetrics, MetricsSnapshot};
