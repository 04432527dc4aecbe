use chorus_core::{CoreError, WorkerExitCode};
use chorus_core::playback::PlaybackError;
use chorus_core::protocol::ProtocolError;
use chorus_core::settings::SettingsError;
use chorus_core::synthesis::SynthesisError;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] CoreError),

    #[error("Could not connect to the cluster bus at {url}")]
    #[diagnostic(
        code(chorus_discord::bus_connect),
        help("Make sure chorus-launcher is running and --bus-url points at its bind address")
    )]
    BusConnect {
        url: String,
        #[source]
        cause: tokio_tungstenite::tungstenite::Error,
    },

    #[error("Cluster bus connection closed")]
    #[diagnostic(code(chorus_discord::bus_closed))]
    BusClosed,

    #[error("Request {nonce} was not answered in time")]
    #[diagnostic(code(chorus_discord::bus_timeout))]
    BusTimeout { nonce: uuid::Uuid },

    #[error("Launcher could not complete relayed request: {message}")]
    #[diagnostic(code(chorus_discord::relay_failed))]
    RelayFailed { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid shard list '{raw}'")]
    #[diagnostic(
        code(chorus_discord::invalid_shards),
        help("Shards are a comma separated, contiguous list of indices such as 4,5,6,7")
    )]
    InvalidShards { raw: String },

    #[error("Discord client error")]
    #[diagnostic(
        code(chorus_discord::discord),
        help("Check that your Discord bot token is valid and has not been regenerated")
    )]
    Discord(#[from] serenity::Error),

    #[error("Failed to {action} voice in guild {guild_id}")]
    #[diagnostic(code(chorus_discord::voice))]
    Voice {
        action: &'static str,
        guild_id: u64,
        #[source]
        cause: songbird::error::JoinError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Playback(#[from] PlaybackError),
}

impl WorkerError {
    /// Exit code to leave with when this error ends the worker.
    ///
    /// Configuration and authentication problems will not fix themselves on
    /// respawn; everything else gets another try.
    pub fn exit_code(&self) -> WorkerExitCode {
        use serenity::gateway::GatewayError;

        match self {
            Self::Core(_) | Self::InvalidShards { .. } => WorkerExitCode::DoNotRestartCluster,
            Self::Discord(serenity::Error::Gateway(
                GatewayError::InvalidAuthentication
                | GatewayError::InvalidGatewayIntents
                | GatewayError::DisallowedGatewayIntents,
            )) => WorkerExitCode::DoNotRestartCluster,
            _ => WorkerExitCode::RestartCluster,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unrecoverable_errors_stop_the_cluster() {
        let bad_shards = WorkerError::InvalidShards { raw: "x".into() };
        assert_eq!(bad_shards.exit_code(), WorkerExitCode::DoNotRestartCluster);

        let bad_token = WorkerError::Discord(serenity::Error::Gateway(
            serenity::gateway::GatewayError::InvalidAuthentication,
        ));
        assert_eq!(bad_token.exit_code(), WorkerExitCode::DoNotRestartCluster);
        assert_eq!(
            WorkerError::Core(CoreError::MissingToken).exit_code(),
            WorkerExitCode::DoNotRestartCluster
        );
    }

    #[test]
    fn transient_errors_restart_the_cluster() {
        assert_eq!(WorkerError::BusClosed.exit_code(), WorkerExitCode::RestartCluster);
        assert_eq!(
            WorkerError::BusTimeout {
                nonce: uuid::Uuid::new_v4()
            }
            .exit_code(),
            WorkerExitCode::RestartCluster
        );
    }
}
