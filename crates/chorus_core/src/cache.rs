//! Cache of synthesized audio, keyed by (text, voice)

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

#[async_trait]
pub trait AudioCache: Send + Sync {
    async fn get(&self, text: &str, voice: &str) -> Option<Arc<[u8]>>;
    async fn set(&self, text: &str, voice: &str, audio: Arc<[u8]>);
}

type CacheKey = (String, String);

/// In-memory cache that evicts the oldest entry once full.
pub struct MemoryAudioCache {
    entries: DashMap<CacheKey, Arc<[u8]>>,
    order: Mutex<VecDeque<CacheKey>>,
    capacity: usize,
}

impl MemoryAudioCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AudioCache for MemoryAudioCache {
    async fn get(&self, text: &str, voice: &str) -> Option<Arc<[u8]>> {
        self.entries
            .get(&(text.to_string(), voice.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn set(&self, text: &str, voice: &str, audio: Arc<[u8]>) {
        if self.capacity == 0 {
            return;
        }

        let key = (text.to_string(), voice.to_string());
        let mut order = self.order.lock();
        if self.entries.insert(key.clone(), audio).is_none() {
            order.push_back(key);
        }

        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}
