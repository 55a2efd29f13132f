//! Registry statistics

pub mod metrics;

pub use metrics::{MetricsSnapshot, RegistryMetrics};
