//! Per-request processing time model with an injected heavy tail.

use crate::utils::TailsimError;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use serde::Deserialize;

use tokio::time::Duration;

/// Fraction of requests that hit the extreme tail (`10 * p99`).
const EXTREME_TAIL_PROB: f64 = 0.001;

/// Cumulative fraction of requests that hit at least the moderate tail
/// (`p99`).
const MODERATE_TAIL_PROB: f64 = 0.01;

/// Multiplier of p99 for the extreme tail.
const EXTREME_TAIL_FACTOR: u32 = 10;

/// Turns a server's (base, p99) latency configuration into one simulated
/// processing duration per call.
pub trait LatencyVarier: Send {
    fn add_variability(&mut self, base: Duration, p99: Duration) -> Duration;
}

/// Configuration parameters of `RandomLatencyVarier`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariabilityConfig {
    /// Maximum jitter around the base latency in microsecs.
    pub max_jitter_us: u64,

    /// Seed of the model's random source.
    pub rng_seed: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for VariabilityConfig {
    fn default() -> Self {
        VariabilityConfig {
            max_jitter_us: 0,
            rng_seed: 0,
        }
    }
}

/// Three-regime variability model driven by a seeded random source:
///   - 0.1% of draws return `10 * p99`
///   - the next 0.9% return `p99`
///   - the remaining 99% return `base` +/- uniform jitter, clamped at zero
#[derive(Debug)]
pub struct RandomLatencyVarier {
    rng: StdRng,
    max_jitter: Duration,
}

impl RandomLatencyVarier {
    pub fn new(seed: u64, max_jitter: Duration) -> Self {
        RandomLatencyVarier {
            rng: StdRng::seed_from_u64(seed),
            max_jitter,
        }
    }

    /// Creates a new model from an optional TOML config string.
    pub fn from_config(config_str: Option<&str>) -> Result<Self, TailsimError> {
        let config = parsed_config!(config_str => VariabilityConfig;
                                    max_jitter_us, rng_seed)?;
        Ok(Self::new(
            config.rng_seed,
            Duration::from_micros(config.max_jitter_us),
        ))
    }

    /// Returns `base` shifted by a jitter uniform in
    /// `[-max_jitter, +max_jitter)`, never below zero.
    fn jitter(&mut self, base: Duration) -> Duration {
        let max_ns = self.max_jitter.as_nanos() as i128;
        if max_ns == 0 {
            return base;
        }
        let shift = self.rng.gen_range(0..2 * max_ns) - max_ns;
        let ns = (base.as_nanos() as i128 + shift).max(0);
        Duration::from_nanos(ns as u64)
    }
}

impl LatencyVarier for RandomLatencyVarier {
    fn add_variability(&mut self, base: Duration, p99: Duration) -> Duration {
        let draw: f64 = self.rng.gen();
        if draw < EXTREME_TAIL_PROB {
            p99 * EXTREME_TAIL_FACTOR
        } else if draw < MODERATE_TAIL_PROB {
            p99
        } else {
            self.jitter(base)
        }
    }
}
