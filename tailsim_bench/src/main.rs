//! Tailsim benchmarking driver executable.

use std::process::ExitCode;

use clap::Parser;

use tokio::runtime::Builder;
use tokio::time::Duration;

use tailsim::{
    logger_init, pf_error, pf_warn, CancelCtx, ServerConfig, StrategyKind,
    TailsimError,
};

mod bench;

use crate::bench::ClusterBench;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Name of dispatch strategy to use.
    #[arg(short, long)]
    strategy: String,

    /// Number of simulated servers.
    #[arg(short = 'n', long, default_value_t = 5)]
    servers: usize,

    /// Server configuration TOML string applied to every server.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Benchmark parameters TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    params: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Per-request deadline in millisecs.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// If non-empty, dump the final report as TOML into this file.
    #[arg(short, long, default_value_t = String::from(""))]
    output: String,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(strategy)` on success
    /// or `Err(TailsimError)` on any error.
    fn sanitize(&self) -> Result<StrategyKind, TailsimError> {
        if self.threads < 2 {
            Err(TailsimError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if self.servers == 0 {
            Err(TailsimError::msg(format!(
                "invalid number of servers {}",
                self.servers
            )))
        } else if self.timeout_ms == 0 {
            Err(TailsimError::msg(format!(
                "invalid timeout duration {} ms",
                self.timeout_ms
            )))
        } else {
            StrategyKind::parse_name(&self.strategy).ok_or(TailsimError::msg(
                format!("strategy name '{}' unrecognized", self.strategy),
            ))
        }
    }
}

/// Actual main function of Tailsim benchmarking driver.
fn bench_main() -> Result<(), TailsimError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let strategy = args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };
    let template = ServerConfig::from_config_str(config_str)?;

    // parse optional params string if given
    let params_str = if args.params.is_empty() {
        None
    } else {
        args.params = args.params.replace('+', "\n");
        Some(&args.params[..])
    };

    // set up termination signals handler
    let root = CancelCtx::background();
    let root_term = root.clone();
    ctrlc::set_handler(move || root_term.cancel()).map_err(|e| {
        TailsimError::msg(format!("failed to set ctrlc handler: {}", e))
    })?;

    let num_servers = args.servers;
    let timeout = Duration::from_millis(args.timeout_ms);
    let output = args.output.clone();

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-bench")
        .build()?;

    // enter tokio runtime, launch the cluster, and run the benchmark
    runtime.block_on(async move {
        let mut bench = ClusterBench::new(
            strategy,
            &template,
            num_servers,
            timeout,
            params_str,
        )?;

        let report = bench.run(&root).await?;
        bench.shutdown();

        report.print();
        if !output.is_empty() {
            report.dump(&output)?;
        }

        Ok::<(), TailsimError>(()) // give type hint for this async closure
    })
}

/// Main function of Tailsim benchmarking driver.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = bench_main() {
        pf_error!("bench"; "bench_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        pf_warn!("bench"; "bench_main exited successfully");
        ExitCode::SUCCESS
    }
}
