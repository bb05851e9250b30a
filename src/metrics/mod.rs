//! Metrics collection.

mod collector;

pub use collector::{MetricsCollector, RequestTimer, ShutdownReason, Transport};
