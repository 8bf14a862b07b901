use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use xfer_bench::{
    logging, BenchConfig, BenchmarkHarness, BenchmarkResult, Interrupt, Role,
};
use xfer_engine::{Dtype, EngineFactory, LoopbackFabric, XferOp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Creator,
    Peer,
    /// Both sides in this process, over the loopback engine.
    Pair,
}

#[derive(Parser, Debug)]
#[command(name = "xfer-bench")]
#[command(about = "Measure point-to-point bulk transfer throughput", long_about = None)]
struct Cli {
    #[arg(long, value_enum)]
    role: Mode,
    /// READ or WRITE
    #[arg(long)]
    operation: Option<XferOp>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    num_blocks: Option<usize>,
    #[arg(long)]
    num_layers: Option<usize>,
    #[arg(long)]
    block_size: Option<usize>,
    #[arg(long)]
    hidden_dim: Option<usize>,
    /// bfloat16, float32, float64 or uint8
    #[arg(long)]
    dtype: Option<Dtype>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long)]
    iters: Option<usize>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    connect_timeout_ms: Option<u64>,
    #[arg(long)]
    completion_timeout_ms: Option<u64>,
    /// TOML file with defaults for every option above
    #[arg(long)]
    config: Option<PathBuf>,
    /// Also write the log to a timestamped file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn bench_config(&self) -> Result<BenchConfig> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::from_toml_file(path).with_context(
                || format!("Failed to load config {}", path.display()),
            )?,
            None => BenchConfig::default(),
        };

        if let Some(operation) = self.operation {
            config.operation = operation;
        }
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(num_blocks) = self.num_blocks {
            config.num_blocks = num_blocks;
        }
        if let Some(num_layers) = self.num_layers {
            config.num_layers = num_layers;
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(hidden_dim) = self.hidden_dim {
            config.hidden_dim = hidden_dim;
        }
        if let Some(dtype) = self.dtype {
            config.dtype = dtype;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(iters) = self.iters {
            config.iters = iters;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if self.completion_timeout_ms.is_some() {
            config.completion_timeout_ms = self.completion_timeout_ms;
        }
        Ok(config)
    }
}

async fn run_side(
    config: BenchConfig,
    factory: Arc<dyn EngineFactory>,
    interrupt: &Interrupt,
) -> Result<BenchmarkResult> {
    let role = config.role;
    let harness = BenchmarkHarness::new(config, factory)
        .with_context(|| format!("Invalid {} configuration", role))?;
    Ok(harness.run(interrupt).await)
}

fn report(role: Role, result: &BenchmarkResult) {
    for outcome in &result.outcomes {
        match outcome.error {
            Some(kind) => println!(
                "[{}] AgentPair-{}: {:.2} GB/s ({})",
                role, outcome.index, outcome.throughput, kind
            ),
            None => println!(
                "[{}] AgentPair-{}: {:.2} GB/s",
                role, outcome.index, outcome.throughput
            ),
        }
    }
    println!("[{}] Total: {:.2} GB/s", role, result.total);
    println!("[{}] Average per thread: {:.2} GB/s", role, result.average);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(path) = logging::init(cli.log_dir.as_deref())? {
        info!("Logging to {}", path.display());
    }
    let config = cli.bench_config()?;

    let interrupt = Interrupt::new();
    let watcher = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping all units");
            watcher.trigger();
        }
    });

    let factory: Arc<dyn EngineFactory> = Arc::new(LoopbackFabric::new());
    let results = match cli.role {
        Mode::Creator | Mode::Peer => {
            let role = if cli.role == Mode::Creator {
                Role::Creator
            } else {
                Role::Peer
            };
            let config = BenchConfig { role, ..config };
            vec![(role, run_side(config, factory, &interrupt).await?)]
        }
        Mode::Pair => {
            let creator = BenchConfig {
                role: Role::Creator,
                host: if config.host == "0.0.0.0" {
                    "127.0.0.1".to_string()
                } else {
                    config.host.clone()
                },
                ..config.clone()
            };
            let peer = BenchConfig {
                role: Role::Peer,
                ..config
            };
            let (creator, peer) = tokio::join!(
                run_side(creator, factory.clone(), &interrupt),
                run_side(peer, factory, &interrupt),
            );
            vec![(Role::Creator, creator?), (Role::Peer, peer?)]
        }
    };

    for (role, result) in &results {
        report(*role, result);
    }
    if interrupt.is_triggered() {
        warn!("Benchmark was interrupted, results are partial");
    }
    if results.iter().any(|(_, result)| !result.correct) {
        bail!("Correctness check failed");
    }
    Ok(())
}
