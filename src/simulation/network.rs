//! Transport-level delay model, independent of server processing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tokio::time::Duration;

/// Produces one simulated one-way network delay per call.
pub trait NetworkDelayer: Send {
    fn network_delay(&mut self) -> Duration;
}

/// Additive delay model: `base_delay + uniform[0, max_jitter)`.
#[derive(Debug)]
pub struct RandomNetworkDelayer {
    rng: StdRng,
    base_delay: Duration,
    max_jitter: Duration,
}

impl RandomNetworkDelayer {
    pub fn new(seed: u64, base_delay: Duration, max_jitter: Duration) -> Self {
        RandomNetworkDelayer {
            rng: StdRng::seed_from_u64(seed),
            base_delay,
            max_jitter,
        }
    }
}

impl NetworkDelayer for RandomNetworkDelayer {
    fn network_delay(&mut self) -> Duration {
        let max_ns = self.max_jitter.as_nanos() as u64;
        if max_ns == 0 {
            return self.base_delay;
        }
        self.base_delay + Duration::from_nanos(self.rng.gen_range(0..max_ns))
    }
}
