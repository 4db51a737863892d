//! Stochastic models used to inject latency variability.

mod network;
mod variability;

pub use network::{NetworkDelayer, RandomNetworkDelayer};
pub use variability::{LatencyVarier, RandomLatencyVarier, VariabilityConfig};
