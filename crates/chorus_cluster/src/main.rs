use std::path::PathBuf;
use std::sync::Arc;

use chorus_cluster::launcher::{self, ClusterLauncher};
use chorus_cluster::{ProcessSpawner, ShutdownReason};
use chorus_core::config::save_config;
use chorus_core::{ChorusConfig, WorkerExitCode};
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::info;

#[derive(Parser)]
#[command(name = "chorus-launcher")]
#[command(about = "Starts and supervises Chorus worker clusters")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, short = 'c', default_value = "chorus.toml")]
    config: PathBuf,

    /// Total shard count (overrides config and discovery)
    #[arg(long)]
    shard_count: Option<u32>,

    /// Shards per worker process (overrides config)
    #[arg(long)]
    shards_per_cluster: Option<u32>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Write a default configuration file to --config and exit
    #[arg(long)]
    init: bool,
}

fn init_tracing(config: &ChorusConfig, debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if debug {
            "debug"
        } else {
            config.logging.level.as_str()
        };
        EnvFilter::new(format!(
            "chorus_cluster={level},chorus_core={level},warn"
        ))
    });

    let builder = fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339());

    if config.logging.json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .context_lines(5)
                .build(),
        )
    }))?;
    miette::set_panic_hook();
    let cli = Cli::parse();

    if cli.init {
        if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
            miette::bail!("{} already exists", cli.config.display());
        }
        save_config(&ChorusConfig::default(), &cli.config).await?;
        println!("Wrote default configuration to {}", cli.config.display());
        return Ok(());
    }

    let mut config = ChorusConfig::load_or_default(&cli.config).await?;
    init_tracing(&config, cli.debug);

    if let Some(per_cluster) = cli.shards_per_cluster {
        config.cluster.shards_per_cluster = per_cluster;
    }

    let shard_count = match cli.shard_count.or(config.cluster.shard_count) {
        Some(count) => count,
        None => launcher::discover_shard_count(config.token()?).await?,
    };

    let worker_binary = match &config.cluster.worker_binary {
        Some(path) => path.clone(),
        None => ProcessSpawner::sibling_binary().into_diagnostic()?,
    };
    info!("Using worker binary {}", worker_binary.display());

    let config_path = tokio::fs::try_exists(&cli.config)
        .await
        .unwrap_or(false)
        .then(|| cli.config.clone());
    let spawner = ProcessSpawner::new(worker_binary, config.cluster.bus_url(), config_path);

    let listener = launcher::bind(&config.cluster.bind_address).await?;
    let reason = ClusterLauncher::new(config.cluster.clone(), Arc::new(spawner))
        .run(shard_count, listener)
        .await?;

    match reason {
        Some(ShutdownReason::WorkerExit {
            code: WorkerExitCode::DoNotRestartCluster,
            cluster_id,
        }) => {
            miette::bail!("Cluster {cluster_id} exited with DO_NOT_RESTART_CLUSTER")
        }
        Some(ShutdownReason::SpawnFailed { cluster_id }) => {
            miette::bail!("Cluster {cluster_id} could not be started")
        }
        _ => Ok(()),
    }
}
