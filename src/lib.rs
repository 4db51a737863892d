//! Tailsim: a simulated server cluster for studying request-dispatch
//! strategies against long-tailed latency distributions.

#[macro_use]
mod utils;

mod cluster;
mod messages;
mod metrics;
mod server;
mod simulation;
mod strategies;

pub use crate::utils::{
    hash_strings, logger_init, CancelCtx, CtxError, TailsimError, Timer,
};

pub use crate::messages::{CancelCause, Request, Response, ResponseError};

pub use crate::simulation::{
    LatencyVarier, NetworkDelayer, RandomLatencyVarier, RandomNetworkDelayer,
    VariabilityConfig,
};

pub use crate::metrics::{LatencySummary, LatencyTracker};

pub use crate::server::{RequestIdFn, ServerConfig, SimServer};

pub use crate::cluster::Cluster;

pub use crate::strategies::{
    Baseline, DispatchStrategy, FanOutAggregate, StrategyKind,
};
