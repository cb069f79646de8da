//! Metrics collection and exposition.

mod collector;
mod server;

pub use collector::{Direction, MetricsCollector};
pub use server::MetricsServer;
