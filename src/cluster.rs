//! Fixed, ordered collection of simulated servers.

use std::collections::HashSet;
use std::slice;
use std::sync::Arc;

use crate::server::{ServerConfig, SimServer};
use crate::simulation::{RandomLatencyVarier, VariabilityConfig};
use crate::utils::TailsimError;

use tokio::time::Duration;

/// An immutable, ordered set of servers assembled once at construction.
#[derive(Debug, Clone)]
pub struct Cluster {
    servers: Vec<Arc<SimServer>>,
}

impl Cluster {
    /// Composes a cluster from already running servers.
    pub fn new(servers: Vec<Arc<SimServer>>) -> Self {
        Cluster { servers }
    }

    /// Creates and sets up one server per config, each with its own
    /// variability model. The model of the `i`-th server is seeded with
    /// `variability.rng_seed + i`. Must be called within the context of a
    /// tokio runtime.
    pub fn launch(
        configs: Vec<ServerConfig>,
        variability: &VariabilityConfig,
    ) -> Result<Self, TailsimError> {
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.id.clone()) {
                return logged_err!("c"; "duplicate server id '{}'", config.id);
            }
        }

        let max_jitter = Duration::from_micros(variability.max_jitter_us);
        let servers = configs
            .into_iter()
            .enumerate()
            .map(|(i, config)| {
                let varier = RandomLatencyVarier::new(
                    variability.rng_seed.wrapping_add(i as u64),
                    max_jitter,
                );
                SimServer::new_and_setup(config, Box::new(varier))
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        pf_info!("c"; "launched cluster of {} servers", servers.len());
        Ok(Self::new(servers))
    }

    /// Number of servers.
    pub fn size(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn servers(&self) -> &[Arc<SimServer>] {
        &self.servers
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<SimServer>> {
        self.servers.get(idx)
    }

    pub fn iter(&self) -> slice::Iter<'_, Arc<SimServer>> {
        self.servers.iter()
    }

    /// Server IDs in cluster order.
    pub fn server_ids(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.id()).collect()
    }

    /// Sum of all servers' queue depths; advisory.
    pub fn total_queue_depth(&self) -> usize {
        self.servers.iter().map(|s| s.queue_depth()).sum()
    }

    /// Signals every server to shut down.
    pub fn shutdown_all(&self) {
        for server in &self.servers {
            server.shutdown();
        }
    }
}

impl<'a> IntoIterator for &'a Cluster {
    type Item = &'a Arc<SimServer>;
    type IntoIter = slice::Iter<'a, Arc<SimServer>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
