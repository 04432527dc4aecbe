use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    #[error("Invalid shard layout")]
    #[diagnostic(
        code(chorus_core::invalid_shard_layout),
        help("shard_count and shards_per_cluster must both be at least 1 (got {shard_count} and {shards_per_cluster})")
    )]
    InvalidShardLayout {
        shard_count: u32,
        shards_per_cluster: u32,
    },

    #[error("Configuration error")]
    #[diagnostic(
        code(chorus_core::configuration_error),
        help("Check the configuration file at {config_path}: expected {expected} for field '{field}'")
    )]
    ConfigurationError {
        config_path: String,
        field: String,
        expected: String,
        #[source]
        cause: ConfigError,
    },

    #[error("Missing Discord token")]
    #[diagnostic(
        code(chorus_core::missing_token),
        help("Set DISCORD_TOKEN in the environment or `token` under [discord] in the config file")
    )]
    MissingToken,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
