//! Configuration for the launcher and worker processes
//!
//! Both binaries read the same TOML file. Every field has a default so an
//! almost empty file (just a token) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, CoreError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChorusConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub discord: DiscordConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Static sharding parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Total shard count; discovered from the Discord API when absent
    #[serde(default)]
    pub shard_count: Option<u32>,

    #[serde(default = "default_shards_per_cluster")]
    pub shards_per_cluster: u32,

    /// Address the cluster bus listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Worker executable; defaults to `chorus-worker` next to the launcher
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Guild whose hosting cluster is addressed by the `support` target
    #[serde(default)]
    pub support_guild_id: Option<u64>,

    #[serde(default)]
    pub health: HealthConfig,
}

/// Timings for the health monitor and supervision loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    #[serde(default = "default_restart_grace")]
    pub restart_grace_secs: u64,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Wait before re-joining a process that reported no exit status
    #[serde(default = "default_retry_join")]
    pub retry_join_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub token: String,

    /// Default command prefix for guilds that haven't set one
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Channel that receives pipeline error reports
    #[serde(default)]
    pub error_channel_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// VOICEVOX-compatible engine
    #[serde(default = "default_voicevox_url")]
    pub voicevox_url: String,

    /// Secondary engine used when the primary is rate limited
    #[serde(default)]
    pub fallback_url: Option<String>,

    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Capacity of the synthesized-audio buffer
    #[serde(default = "default_audio_buffer")]
    pub audio_buffer: usize,

    /// Added to a clip's length to get its playback timeout
    #[serde(default = "default_play_timeout_margin")]
    pub play_timeout_margin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_shards_per_cluster() -> u32 {
    4
}

fn default_bind_address() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    60
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_restart_grace() -> u64 {
    15
}

fn default_initial_delay() -> u64 {
    10
}

fn default_retry_join() -> u64 {
    10
}

fn default_prefix() -> String {
    "-".to_string()
}

fn default_voicevox_url() -> String {
    "http://localhost:50021".to_string()
}

fn default_cache_entries() -> usize {
    500
}

fn default_request_timeout() -> u64 {
    20
}

fn default_audio_buffer() -> usize {
    5
}

fn default_play_timeout_margin() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shard_count: None,
            shards_per_cluster: default_shards_per_cluster(),
            bind_address: default_bind_address(),
            worker_binary: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
            support_guild_id: None,
            health: HealthConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            ping_timeout_secs: default_ping_timeout(),
            restart_grace_secs: default_restart_grace(),
            initial_delay_secs: default_initial_delay(),
            retry_join_secs: default_retry_join(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            prefix: default_prefix(),
            error_channel_id: None,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voicevox_url: default_voicevox_url(),
            fallback_url: None,
            cache_entries: default_cache_entries(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            audio_buffer: default_audio_buffer(),
            play_timeout_margin_secs: default_play_timeout_margin(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ClusterConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// WebSocket URL a worker uses to reach the bus
    pub fn bus_url(&self) -> String {
        format!("ws://{}", self.bind_address)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_secs(self.restart_grace_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn retry_join(&self) -> Duration {
        Duration::from_secs(self.retry_join_secs)
    }
}

impl PlaybackConfig {
    pub fn play_timeout_margin(&self) -> Duration {
        Duration::from_secs(self.play_timeout_margin_secs)
    }
}

/// Load configuration from a TOML file
pub async fn load_config(path: &Path) -> Result<ChorusConfig> {
    let content =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoreError::ConfigurationError {
                config_path: path.display().to_string(),
                field: "file".to_string(),
                expected: "readable TOML file".to_string(),
                cause: ConfigError::Io(e.to_string()),
            })?;

    parse_config(&content, path)
}

fn parse_config(content: &str, path: &Path) -> Result<ChorusConfig> {
    let config: ChorusConfig =
        toml::from_str(content).map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "content".to_string(),
            expected: "valid TOML configuration".to_string(),
            cause: ConfigError::TomlParse(e.to_string()),
        })?;
    config.validate(path)?;
    Ok(config)
}

/// Save configuration to a TOML file
pub async fn save_config(config: &ChorusConfig, path: &Path) -> Result<()> {
    let content =
        toml::to_string_pretty(config).map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "serialization".to_string(),
            expected: "serializable config structure".to_string(),
            cause: ConfigError::TomlSerialize(e.to_string()),
        })?;

    tokio::fs::write(path, content)
        .await
        .map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "file".to_string(),
            expected: "writable file location".to_string(),
            cause: ConfigError::Io(e.to_string()),
        })
}

impl ChorusConfig {
    /// Load from `path` if it exists, otherwise start from defaults.
    ///
    /// `DISCORD_TOKEN` from the environment (or a `.env` file loaded by the
    /// binary) always wins over the file.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
            load_config(path).await?
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Self::default()
        };

        if let Ok(token) = std::env::var("DISCORD_TOKEN") {
            if !token.is_empty() {
                config.discord.token = token;
            }
        }

        Ok(config)
    }

    /// Reject values that parse but cannot run: a zero health interval or
    /// audio buffer, or an empty command prefix.
    pub fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |field: &str, expected: &str, value: String| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: field.to_string(),
            expected: expected.to_string(),
            cause: ConfigError::Invalid(value),
        };

        if self.cluster.health.interval_secs == 0 {
            return Err(invalid(
                "cluster.health.interval_secs",
                "a number of seconds greater than 0",
                "0".to_string(),
            ));
        }
        if self.playback.audio_buffer == 0 {
            return Err(invalid(
                "playback.audio_buffer",
                "a buffer size of at least 1",
                "0".to_string(),
            ));
        }
        if self.discord.prefix.trim().is_empty() {
            return Err(invalid(
                "discord.prefix",
                "a non-empty command prefix",
                format!("{:?}", self.discord.prefix),
            ));
        }
        Ok(())
    }

    /// The Discord token, or an error if none was configured
    pub fn token(&self) -> Result<&str> {
        if self.discord.token.is_empty() {
            Err(CoreError::MissingToken)
        } else {
            Ok(&self.discord.token)
        }
    }
}
