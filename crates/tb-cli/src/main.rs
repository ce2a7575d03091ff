use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use tb_config::{EngineConfig, HumanDuration, Overrides};
use tb_runtime::lifecycle::{Engine, wait_for_signal};
use tb_runtime::tracing_init::init_tracing;

#[derive(Parser)]
#[command(name = "tumbler", about = "Tumbling-window aggregation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured consumer group until SIGINT/SIGTERM
    Run {
        /// Path to tumbler.toml
        #[arg(short, long, env = "TUMBLER_CONFIG")]
        config: PathBuf,

        #[command(flatten)]
        overrides: OverrideArgs,
    },
}

/// Settings that take precedence over the config file.
#[derive(Args)]
struct OverrideArgs {
    /// Window workers per consumer group
    #[arg(long, env = "TUMBLER_SHARDS")]
    shards: Option<usize>,
    /// Tumbling window length, e.g. "1m"
    #[arg(long, env = "TUMBLER_WINDOW")]
    window: Option<HumanDuration>,
    #[arg(long, env = "TUMBLER_ALLOWED_LATENESS")]
    allowed_lateness: Option<HumanDuration>,
    /// Windows with more events than this are not written
    #[arg(long, env = "TUMBLER_COUNT_CEILING")]
    count_ceiling: Option<u64>,
    #[arg(long, env = "TUMBLER_BATCH_SIZE")]
    batch_size: Option<usize>,
    #[arg(long, env = "TUMBLER_BATCH_INTERVAL")]
    batch_interval: Option<HumanDuration>,
    #[arg(long, env = "TUMBLER_COMMIT_INTERVAL")]
    commit_interval: Option<HumanDuration>,
    /// Partition readers per consumer group
    #[arg(long, env = "TUMBLER_PARALLELISM")]
    parallelism: Option<usize>,
    /// Enable the metrics summary log and Prometheus endpoint
    #[arg(long, env = "TUMBLER_METRICS")]
    metrics: bool,
}

impl From<OverrideArgs> for Overrides {
    fn from(a: OverrideArgs) -> Self {
        Overrides {
            shards: a.shards,
            window: a.window,
            allowed_lateness: a.allowed_lateness,
            count_ceiling: a.count_ceiling,
            batch_size: a.batch_size,
            batch_interval: a.batch_interval,
            commit_interval: a.commit_interval,
            parallelism: a.parallelism,
            metrics: a.metrics,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, overrides } => {
            let config_path = config
                .canonicalize()
                .map_err(|e| anyhow::anyhow!("config path '{}': {e}", config.display()))?;
            let mut engine_config = EngineConfig::load(&config_path)?;
            engine_config.apply_overrides(&overrides.into())?;
            let base_dir = config_path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("config path has no parent directory"))?;

            let _guard = init_tracing(&engine_config.logging, base_dir)?;

            let groups = engine_config.consumer_groups.len();
            let engine = Engine::start(engine_config, base_dir)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            match engine.metrics_addr() {
                Some(addr) => {
                    tracing::info!(domain = "sys", groups, metrics = %addr, "tumbler started")
                }
                None => tracing::info!(domain = "sys", groups, "tumbler started"),
            }

            wait_for_signal(engine.cancel_token()).await;
            engine.shutdown();
            engine.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        }
    }

    Ok(())
}
