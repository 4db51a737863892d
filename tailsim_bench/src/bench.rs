//! Closed-loop benchmarking driver over a simulated cluster.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use serde::{Deserialize, Serialize};

use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use tailsim::{
    logged_err, parsed_config, pf_debug, pf_info, pf_warn, CancelCtx, Cluster,
    DispatchStrategy, LatencyTracker, Request, ServerConfig, StrategyKind,
    TailsimError, VariabilityConfig,
};

/// Statistics printing interval.
const PRINT_INTERVAL: Duration = Duration::from_millis(500);

/// Mode parameters struct.
#[derive(Debug, Deserialize)]
pub struct ModeParamsBench {
    /// Total number of logical requests to issue.
    pub num_reqs: u64,

    /// Number of concurrent closed-loop workers.
    pub concurrency: usize,

    /// Think time between two consecutive requests of a worker in
    /// microsecs. Zero means back-to-back.
    pub interval_us: u64,

    /// Capacity of the latency tracker window.
    pub tracker_cap: usize,

    /// If true, the last server of the cluster is made a straggler.
    pub straggler: bool,

    /// Latency multiplier applied to the straggler.
    pub straggler_factor: u64,

    /// Size of the random request payload in bytes.
    pub payload_size: usize,

    /// Max jitter of the latency variability model in microsecs.
    pub max_jitter_us: u64,

    /// Seed of the variability models and the payload generator.
    pub seed: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ModeParamsBench {
    fn default() -> Self {
        ModeParamsBench {
            num_reqs: 10000,
            concurrency: 16,
            interval_us: 0,
            tracker_cap: 100000,
            straggler: false,
            straggler_factor: 10,
            payload_size: 64,
            max_jitter_us: 100,
            seed: 0,
        }
    }
}

impl ModeParamsBench {
    /// Composes mode parameters from defaults overwritten by an optional
    /// TOML string, then validates them.
    pub fn from_params_str(
        params_str: Option<&str>,
    ) -> Result<Self, TailsimError> {
        let params = parsed_config!(params_str => ModeParamsBench;
                                    num_reqs, concurrency, interval_us,
                                    tracker_cap, straggler, straggler_factor,
                                    payload_size, max_jitter_us, seed)?;
        if params.num_reqs == 0 {
            return logged_err!("bench"; "invalid params.num_reqs '{}'",
                                        params.num_reqs);
        }
        if params.concurrency == 0 {
            return logged_err!("bench"; "invalid params.concurrency '{}'",
                                        params.concurrency);
        }
        if params.tracker_cap == 0 {
            return logged_err!("bench"; "invalid params.tracker_cap '{}'",
                                        params.tracker_cap);
        }
        if params.straggler_factor == 0 {
            return logged_err!("bench"; "invalid params.straggler_factor '{}'",
                                        params.straggler_factor);
        }
        Ok(params)
    }
}

/// Final benchmark report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchReport {
    pub strategy: String,
    pub servers: usize,
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub elapsed_ms: u64,
    pub tpt_reqs_s: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub mean_us: f64,
    pub stdev_us: f64,
}

impl BenchReport {
    /// Prints the report as a small table.
    pub fn print(&self) {
        println!(
            "{:>10} | {:>8} | {:>8} | {:>8} | {:>12} | \
             {:>10} | {:>10} | {:>10} | {:>10}",
            "Strategy", "Succ", "Fail", "Cncl", "Tpt (reqs/s)",
            "p50 (us)", "p95 (us)", "p99 (us)", "p999 (us)"
        );
        println!(
            "{:>10} | {:>8} | {:>8} | {:>8} | {:>12.2} | \
             {:>10} | {:>10} | {:>10} | {:>10}",
            self.strategy,
            self.succeeded,
            self.failed,
            self.cancelled,
            self.tpt_reqs_s,
            self.p50_us,
            self.p95_us,
            self.p99_us,
            self.p999_us
        );
        println!(
            "mean {:.2} us  stdev {:.2} us  over {} reqs in {} ms",
            self.mean_us, self.stdev_us, self.issued, self.elapsed_ms
        );
    }

    /// Dumps the report as TOML into the given file path.
    pub fn dump(&self, path: &str) -> Result<(), TailsimError> {
        let content = toml::to_string(self)?;
        fs::write(path, content)?;
        pf_info!("bench"; "report dumped to '{}'", path);
        Ok(())
    }
}

/// Per-worker outcome counters.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    issued: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
}

impl Tally {
    fn merge(&mut self, other: &Tally) {
        self.issued += other.issued;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

/// State shared by all closed-loop workers.
struct BenchShared {
    strategy: Box<dyn DispatchStrategy>,
    cluster: Cluster,
    tracker: LatencyTracker,

    /// Index of the next request to issue.
    next_req: AtomicU64,

    num_reqs: u64,
    interval: Duration,
    timeout: Duration,
    payload: String,
}

/// Benchmarking driver struct.
pub struct ClusterBench {
    /// Strategy in use.
    kind: StrategyKind,

    /// Mode parameters struct.
    params: ModeParamsBench,

    /// Shared worker state.
    shared: Arc<BenchShared>,
}

impl ClusterBench {
    /// Launches the cluster and creates a new benchmarking driver. Must be
    /// called within the context of a tokio runtime.
    pub fn new(
        kind: StrategyKind,
        template: &ServerConfig,
        num_servers: usize,
        timeout: Duration,
        params_str: Option<&str>,
    ) -> Result<Self, TailsimError> {
        let params = ModeParamsBench::from_params_str(params_str)?;
        if num_servers == 0 {
            return logged_err!("bench"; "invalid number of servers {}",
                                        num_servers);
        }

        let configs = Self::server_configs(template, num_servers, &params);
        let variability = VariabilityConfig {
            max_jitter_us: params.max_jitter_us,
            rng_seed: params.seed,
        };
        let cluster = Cluster::launch(configs, &variability)?;

        let payload = StdRng::seed_from_u64(params.seed)
            .sample_iter(&Alphanumeric)
            .take(params.payload_size)
            .map(char::from)
            .collect();

        let shared = Arc::new(BenchShared {
            strategy: kind.new_strategy(),
            cluster,
            tracker: LatencyTracker::new(params.tracker_cap),
            next_req: AtomicU64::new(0),
            num_reqs: params.num_reqs,
            interval: Duration::from_micros(params.interval_us),
            timeout,
            payload,
        });

        Ok(ClusterBench {
            kind,
            params,
            shared,
        })
    }

    /// Derives per-server configs from a template. Servers get IDs
    /// `s0..sN` and consecutive failure-draw seeds; if requested, the last
    /// one gets its latencies multiplied by the straggler factor.
    pub fn server_configs(
        template: &ServerConfig,
        num_servers: usize,
        params: &ModeParamsBench,
    ) -> Vec<ServerConfig> {
        (0..num_servers)
            .map(|i| {
                let mut config = template.clone();
                config.id = format!("s{}", i);
                config.rng_seed = template.rng_seed.wrapping_add(i as u64);
                if params.straggler && i + 1 == num_servers {
                    config.base_latency_us = config
                        .base_latency_us
                        .saturating_mul(params.straggler_factor);
                    config.p99_latency_us = config
                        .p99_latency_us
                        .saturating_mul(params.straggler_factor);
                }
                config
            })
            .collect()
    }

    /// Closed-loop worker: issues one request at a time until the request
    /// budget is used up or the root context fires.
    async fn worker_loop(
        wid: usize,
        shared: Arc<BenchShared>,
        root: CancelCtx,
    ) -> Tally {
        let mut tally = Tally::default();
        while !root.is_done() {
            let idx = shared.next_req.fetch_add(1, Ordering::Relaxed);
            if idx >= shared.num_reqs {
                break;
            }

            let ctx = root.with_timeout(shared.timeout);
            let req =
                Request::new(format!("req-{}", idx), shared.payload.clone());
            let resp =
                shared.strategy.dispatch(&ctx, &shared.cluster, req).await;

            tally.issued += 1;
            if resp.err.is_some() {
                tally.cancelled += 1;
            } else {
                if resp.success {
                    tally.succeeded += 1;
                } else {
                    tally.failed += 1;
                }
                shared.tracker.record(resp.latency);
            }

            if !shared.interval.is_zero() {
                tokio::select! {
                    () = time::sleep(shared.interval) => {}
                    _ = root.done() => break,
                }
            }
        }

        pf_debug!("bench"; "worker {} done, issued {}", wid, tally.issued);
        tally
    }

    /// Periodically prints progress until `stop` fires.
    async fn progress_loop(shared: Arc<BenchShared>, stop: CancelCtx) {
        println!(
            "{:^11} | {:>10} | {:>12}",
            "Elapsed (s)", "Issued", "p99 (us)"
        );
        let start = Instant::now();
        let mut ticker = time::interval(PRINT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let issued = shared
                        .next_req
                        .load(Ordering::Relaxed)
                        .min(shared.num_reqs);
                    println!(
                        "{:>11.2} | {:>10} | {:>12}",
                        start.elapsed().as_secs_f64(),
                        issued,
                        shared.tracker.percentile(0.99).as_micros()
                    );
                }
                _ = stop.done() => break,
            }
        }
    }

    /// Runs the benchmark to completion (or interruption via `root`) and
    /// returns the final report.
    pub async fn run(
        &mut self,
        root: &CancelCtx,
    ) -> Result<BenchReport, TailsimError> {
        pf_info!("bench"; "running {} over {} servers: {} reqs, {} workers",
                          self.kind, self.shared.cluster.size(),
                          self.params.num_reqs, self.params.concurrency);

        let start = Instant::now();
        let stop = root.child();
        let printer = tokio::spawn(Self::progress_loop(
            self.shared.clone(),
            stop.clone(),
        ));

        let mut handles = Vec::with_capacity(self.params.concurrency);
        for wid in 0..self.params.concurrency {
            handles.push(tokio::spawn(Self::worker_loop(
                wid,
                self.shared.clone(),
                root.clone(),
            )));
        }

        let mut tally = Tally::default();
        for handle in handles {
            tally.merge(&handle.await?);
        }
        let elapsed = start.elapsed();
        stop.cancel();
        printer.await?;

        if root.is_done() {
            pf_warn!(
                "bench";
                "benchmark interrupted after {} reqs",
                tally.issued
            );
        }

        let summary = self.shared.tracker.summary();
        let (mean_us, stdev_us) =
            self.shared.tracker.mean_stdev().unwrap_or((0.0, 0.0));
        let tpt_reqs_s = if elapsed.is_zero() {
            0.0
        } else {
            tally.issued as f64 / elapsed.as_secs_f64()
        };

        Ok(BenchReport {
            strategy: self.kind.to_string(),
            servers: self.shared.cluster.size(),
            issued: tally.issued,
            succeeded: tally.succeeded,
            failed: tally.failed,
            cancelled: tally.cancelled,
            elapsed_ms: elapsed.as_millis() as u64,
            tpt_reqs_s,
            p50_us: summary.p50.as_micros() as u64,
            p95_us: summary.p95.as_micros() as u64,
            p99_us: summary.p99.as_micros() as u64,
            p999_us: summary.p999.as_micros() as u64,
            mean_us,
            stdev_us,
        })
    }

    /// Shuts down all servers of the cluster.
    pub fn shutdown(&self) {
        self.shared.cluster.shutdown_all();
    }
}
