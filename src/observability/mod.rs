pub mod chain;
pub mod metrics;

pub use chain::{ChainEntry, ChainTracker};
pub use metrics::{CounterSnapshot, LiveMetrics};
