//! Tailsim's collection of request-dispatch strategies.

use std::fmt;

use crate::cluster::Cluster;
use crate::messages::{Request, Response};
use crate::utils::CancelCtx;

use async_trait::async_trait;

mod baseline;

pub use baseline::{Baseline, FanOutAggregate};

/// A dispatch strategy turns one logical request into calls on some servers
/// of a cluster and reduces their outcomes into one response.
#[async_trait]
pub trait DispatchStrategy: Send + Sync {
    /// Human-readable strategy name.
    fn name(&self) -> &'static str;

    /// Dispatches `req` against `cluster` under `ctx`.
    async fn dispatch(
        &self,
        ctx: &CancelCtx,
        cluster: &Cluster,
        req: Request,
    ) -> Response;
}

/// Enum of supported dispatch strategy types.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StrategyKind {
    Baseline,
}

impl StrategyKind {
    /// Parse command line string into StrategyKind enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "Baseline" => Some(Self::Baseline),
            _ => None,
        }
    }

    /// Create a strategy instance of this kind on heap.
    pub fn new_strategy(&self) -> Box<dyn DispatchStrategy> {
        match self {
            Self::Baseline => Box::new(Baseline),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
