use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chorus_core::cache::MemoryAudioCache;
use chorus_core::config::SynthesisConfig;
use chorus_core::playback::{ErrorReporter, TracingReporter};
use chorus_core::settings::{MemorySettingsStore, SettingKey, SettingValue};
use chorus_core::synthesis::{
    CachedSynthesizer, FallbackSynthesizer, Synthesizer, VoicevoxSynthesizer,
};
use chorus_core::{ChorusConfig, ClusterId, WorkerExitCode, log_error_chain};
use chorus_discord::reporter::ChannelReporter;
use chorus_discord::state::parse_assignment;
use chorus_discord::{
    BusClient, ClusterState, GuildPlaybackRegistry, Handler, Result, Speaker, WorkerError,
};
use clap::Parser;
use serenity::Client;
use serenity::http::Http;
use serenity::model::gateway::GatewayIntents;
use songbird::Songbird;
use tracing::{Instrument, info};

#[derive(Parser)]
#[command(name = "chorus-worker")]
#[command(about = "Runs one cluster of Chorus shards; started by chorus-launcher")]
#[command(version)]
struct Cli {
    #[arg(long)]
    cluster_id: u32,

    /// Total shard count across every cluster
    #[arg(long)]
    shard_count: u32,

    /// Comma separated shard indices for this cluster
    #[arg(long)]
    shards: String,

    /// Configuration file path
    #[arg(long, short = 'c', default_value = "chorus.toml")]
    config: PathBuf,

    /// Launcher bus URL (overrides config)
    #[arg(long)]
    bus_url: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
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
            "chorus_discord={level},chorus_core={level},songbird=warn,serenity=warn,warn"
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

fn build_synthesizer(config: &SynthesisConfig) -> Result<Arc<dyn Synthesizer>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let primary: Arc<dyn Synthesizer> =
        Arc::new(VoicevoxSynthesizer::new(&config.voicevox_url, timeout)?);

    let engine: Arc<dyn Synthesizer> = match &config.fallback_url {
        Some(url) => Arc::new(FallbackSynthesizer::new(
            primary,
            Arc::new(VoicevoxSynthesizer::new(url, timeout)?),
        )),
        None => primary,
    };

    let cache = Arc::new(MemoryAudioCache::new(config.cache_entries));
    Ok(Arc::new(CachedSynthesizer::new(engine, cache)))
}

async fn run(cli: Cli, config: ChorusConfig) -> Result<WorkerExitCode> {
    let cluster_id = ClusterId(cli.cluster_id);
    let assignment = parse_assignment(cluster_id, cli.shard_count, &cli.shards)?;
    let token = config.token()?.to_string();

    let registry = Arc::new(GuildPlaybackRegistry::new());
    let state = Arc::new(ClusterState::new(
        assignment.clone(),
        config.cluster.support_guild_id,
        Arc::clone(&registry),
    ));

    let bus_url = cli.bus_url.unwrap_or_else(|| config.cluster.bus_url());
    let (bus, bus_task) = BusClient::connect(
        &bus_url,
        cluster_id,
        state.clone(),
        config.cluster.health.ping_timeout(),
    )
    .await?;

    let reporter: Arc<dyn ErrorReporter> = match config.discord.error_channel_id {
        Some(channel_id) => Arc::new(ChannelReporter::new(Arc::new(Http::new(&token)), channel_id)),
        None => Arc::new(TracingReporter),
    };
    let settings = MemorySettingsStore::new().with_default(
        SettingKey::Prefix,
        SettingValue::Text(config.discord.prefix.clone()),
    );
    let speaker = Arc::new(Speaker::new(
        Arc::new(settings),
        build_synthesizer(&config.synthesis)?,
        reporter,
        Arc::clone(&registry),
        config.playback.clone(),
    ));

    let songbird = Songbird::serenity();
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES;
    let mut client = Client::builder(&token, intents)
        .event_handler(Handler::new(speaker, state, bus, Arc::clone(&songbird)))
        .voice_manager_arc(songbird)
        .await?;
    let shard_manager = Arc::clone(&client.shard_manager);

    info!(
        shards = %assignment.shard_list(),
        total_shards = assignment.total_shards,
        "Starting shards"
    );
    let exit = tokio::select! {
        result = client.start_shard_range(assignment.range(), assignment.total_shards) => match result {
            Ok(()) => {
                tracing::warn!("Every shard stopped");
                WorkerExitCode::RestartCluster
            }
            Err(e) => {
                let e = WorkerError::from(e);
                log_error_chain!("Gateway failed", e);
                e.exit_code()
            }
        },
        exit = bus_task => match exit {
            Ok(exit) => exit.exit_code(),
            Err(e) => {
                tracing::error!(error = %e, "Bus task failed");
                WorkerExitCode::RestartCluster
            }
        },
    };

    shard_manager.shutdown_all().await;
    registry.shutdown_all();
    info!(?exit, "Worker stopping");
    Ok(exit)
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let _ = miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .context_lines(5)
                .build(),
        )
    }));
    miette::set_panic_hook();
    let cli = Cli::parse();

    let config = match ChorusConfig::load_or_default(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            return ExitCode::from(WorkerExitCode::DoNotRestartCluster.code() as u8);
        }
    };
    init_tracing(&config, cli.debug);

    let span = tracing::info_span!("cluster", id = cli.cluster_id);
    let code = match run(cli, config).instrument(span).await {
        Ok(exit) => exit,
        Err(e) => {
            let code = e.exit_code();
            log_error_chain!("Worker failed", e);
            code
        }
    };
    ExitCode::from(code.code() as u8)
}
