//! Purpose: `dispatch-bench` entry point for dispatcher throughput runs.
//! Role: Parses args, installs tracing, runs the harness, maps errors to exit codes.
//! Invariants: Reports go to stdout (JSON) and stderr (table); logs go to stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use clap::Parser;
use tracing_subscriber::EnvFilter;

use logbuffer::api::{DispatcherOptions, to_exit_code};
use logbuffer::core::options::DEFAULT_BUFFER_SIZE;

#[path = "../bench.rs"]
mod bench;

#[derive(Parser)]
#[command(
    name = "dispatch-bench",
    version,
    about = "Measure claim/commit throughput of the in-memory dispatcher",
    long_about = None,
    after_help = r#"EXAMPLES
  $ dispatch-bench --producers 1 --producers 4 --subscribers 2
  $ dispatch-bench --batch 8 --payload-bytes 64 --format json
  $ RUST_LOG=logbuffer=debug dispatch-bench --messages 1000"#
)]
struct Cli {
    #[arg(long, default_values_t = [1usize], help = "Producer thread count (repeatable)")]
    producers: Vec<usize>,
    #[arg(long, default_value_t = 1, help = "Subscriptions draining concurrently")]
    subscribers: usize,
    #[arg(long, default_value_t = 100_000, help = "Messages per producer")]
    messages: u64,
    #[arg(long = "payload-bytes", default_values_t = [64usize], help = "Payload size in bytes (repeatable, at least 8)")]
    payload_bytes: Vec<usize>,
    #[arg(long = "buffer-size", default_value_t = DEFAULT_BUFFER_SIZE, help = "Total log buffer size in bytes")]
    buffer_size: usize,
    #[arg(long, default_value_t = 0, help = "Fragments per batch claim (0 = single claims)")]
    batch: usize,
    #[arg(long, default_value = "both", help = "Report format: json|table|both")]
    format: String,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let format = match bench::BenchFormat::parse(&cli.format) {
        Ok(format) => format,
        Err(err) => {
            tracing::error!(error = %err, "invalid arguments");
            std::process::exit(to_exit_code(err.kind()));
        }
    };

    let args = bench::BenchArgs {
        buffer_size: cli.buffer_size,
        payload_sizes: cli.payload_bytes,
        messages: cli.messages,
        producers: cli.producers,
        subscribers: cli.subscribers,
        batch: cli.batch,
        format,
    };
    tracing::info!(
        buffer_size = args.buffer_size,
        partitions = DispatcherOptions::default().partition_count,
        subscribers = args.subscribers,
        batch = args.batch,
        "starting bench"
    );

    if let Err(err) = bench::run_bench(args, env!("CARGO_PKG_VERSION")) {
        tracing::error!(error = %err, "bench failed");
        std::process::exit(to_exit_code(err.kind()));
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
