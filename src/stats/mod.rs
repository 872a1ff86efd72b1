//! Statistics for relays and the output coordinator

pub mod metrics;

pub use metrics::{CoordinatorStats, RelayStats};
