//! Out-of-band observers of request latencies.

mod latency;

pub use latency::{LatencySummary, LatencyTracker};
