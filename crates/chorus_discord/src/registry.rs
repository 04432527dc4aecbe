//! Playback queues of every guild this worker is speaking in

use std::sync::Arc;

use chorus_core::PlaybackQueue;
use dashmap::DashMap;

/// One [`PlaybackQueue`] per connected voice channel, keyed by guild.
///
/// Owned by the worker and handed to whatever needs it; there is no global.
#[derive(Default)]
pub struct GuildPlaybackRegistry {
    queues: DashMap<u64, Arc<PlaybackQueue>>,
}

impl GuildPlaybackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guild_id: u64) -> Option<Arc<PlaybackQueue>> {
        self.queues.get(&guild_id).map(|q| Arc::clone(&q))
    }

    /// Register `queue` for its guild, shutting down any queue it replaces.
    pub fn insert(&self, queue: PlaybackQueue) -> Arc<PlaybackQueue> {
        let queue = Arc::new(queue);
        if let Some(old) = self.queues.insert(queue.guild_id(), Arc::clone(&queue)) {
            old.shutdown();
        }
        queue
    }

    /// Shut down and forget the guild's queue. Returns whether one existed.
    pub fn remove(&self, guild_id: u64) -> bool {
        match self.queues.remove(&guild_id) {
            Some((_, queue)) => {
                queue.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn guild_ids(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self.queues.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn shutdown_all(&self) {
        for guild_id in self.guild_ids() {
            self.remove(guild_id);
        }
    }
}
