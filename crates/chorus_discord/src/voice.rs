//! Songbird-backed audio output

use std::sync::Arc;

use async_trait::async_trait;
use chorus_core::playback::{AudioSink, PlaybackError, PlaybackHandle};
use chorus_core::synthesis::Audio;
use parking_lot::Mutex;
use songbird::input::Input;
use songbird::{Call, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use tokio::sync::oneshot;

/// Plays clips into one guild's voice call.
pub struct SongbirdSink {
    call: Arc<tokio::sync::Mutex<Call>>,
}

impl SongbirdSink {
    pub fn new(call: Arc<tokio::sync::Mutex<Call>>) -> Self {
        Self { call }
    }
}

#[async_trait]
impl AudioSink for SongbirdSink {
    async fn play(&self, audio: Audio) -> Result<PlaybackHandle, PlaybackError> {
        let input = Input::from(audio.to_vec());
        let track = self.call.lock().await.play_input(input);

        let (tx, rx) = oneshot::channel();
        let done = Arc::new(Mutex::new(Some(tx)));
        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(
                    Event::Track(event),
                    TrackFinished {
                        done: Arc::clone(&done),
                    },
                )
                .map_err(|e| PlaybackError::Sink(e.to_string()))?;
        }

        Ok(PlaybackHandle::new(rx, move || {
            // Already finished tracks refuse the stop; nothing to do then
            let _ = track.stop();
        }))
    }
}

/// Fires the completion channel the first time the track ends or fails.
struct TrackFinished {
    done: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackFinished {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(());
        }
        Some(Event::Cancel)
    }
}
