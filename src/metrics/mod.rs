//! Metrics collection for outbound calls.

mod collector;

pub use collector::{CallTimer, MetricsCollector, Outcome, Transport};
