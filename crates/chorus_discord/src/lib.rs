//! Chorus Discord - the worker process
//!
//! A worker runs a contiguous range of gateway shards, reads configured text
//! channels aloud through per-guild playback queues, and stays connected to
//! the launcher's cluster bus. How it exits tells the launcher what to do
//! next.

pub mod bus_client;
pub mod commands;
pub mod error;
pub mod handler;
pub mod registry;
pub mod reporter;
pub mod speech;
pub mod state;
pub mod voice;

#[cfg(test)]
mod testing;

pub use bus_client::{BusClient, BusExit, WorkerInfo};
pub use error::{Result, WorkerError};
pub use handler::Handler;
pub use registry::GuildPlaybackRegistry;
pub use speech::Speaker;
pub use state::ClusterState;
