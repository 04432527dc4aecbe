//! Fakes shared by the unit tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_core::PlaybackQueue;
use chorus_core::config::PlaybackConfig;
use chorus_core::playback::{AudioSink, PlaybackError, PlaybackHandle, TracingReporter};
use chorus_core::synthesis::{Audio, SynthesisError, Synthesizer};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Speaks every text as its own bytes, one second per byte.
pub(crate) struct BytesSynthesizer;

#[async_trait]
impl Synthesizer for BytesSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Audio, SynthesisError> {
        Ok(Arc::from(text.as_bytes()))
    }

    fn duration(&self, audio: &[u8]) -> Option<Duration> {
        Some(Duration::from_secs(audio.len() as u64))
    }
}

/// Finishes every clip immediately and remembers what it played.
#[derive(Default)]
pub(crate) struct SilentSink {
    played: Mutex<Vec<String>>,
}

impl SilentSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn played(&self) -> Vec<String> {
        self.played.lock().clone()
    }
}

#[async_trait]
impl AudioSink for SilentSink {
    async fn play(&self, audio: Audio) -> Result<PlaybackHandle, PlaybackError> {
        self.played
            .lock()
            .push(String::from_utf8_lossy(&audio).into_owned());
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Ok(PlaybackHandle::new(rx, || {}))
    }
}

pub(crate) fn queue_for(guild_id: u64, sink: Arc<SilentSink>) -> PlaybackQueue {
    PlaybackQueue::new(
        guild_id,
        Arc::new(BytesSynthesizer),
        sink,
        Arc::new(TracingReporter),
        &PlaybackConfig::default(),
    )
}
