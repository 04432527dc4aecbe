//! Chorus Core - shared building blocks for the Chorus TTS bot
//!
//! This crate holds everything the launcher and the worker processes agree
//! on: configuration, shard partitioning, the worker exit-code vocabulary,
//! the cluster bus wire protocol, and the per-guild playback pipeline along
//! with the collaborator traits it drives (synthesis, caching, settings,
//! audio sinks and error reporting).

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod exit;
pub mod filter;
pub mod playback;
pub mod protocol;
pub mod settings;
pub mod shard;
pub mod synthesis;
pub mod utils;

pub use config::{ChorusConfig, ClusterConfig, HealthConfig};
pub use error::{CoreError, Result};
pub use exit::{ExitAction, WorkerExit, WorkerExitCode};
pub use playback::{PlaybackQueue, QueuedMessage};
pub use protocol::{Command, Envelope, InfoKind, Target};
pub use shard::{ClusterId, ShardAssignment, partition_shards};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        ChorusConfig, ClusterConfig, ClusterId, Command, CoreError, Envelope, ExitAction,
        HealthConfig, InfoKind, PlaybackQueue, QueuedMessage, Result, ShardAssignment, Target,
        WorkerExit, WorkerExitCode, partition_shards,
    };
}
