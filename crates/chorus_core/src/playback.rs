//! Per-guild playback pipeline and the collaborators it drives
//!
//! A [`PlaybackQueue`] turns queued text into audio in two stages: synthesis
//! (strictly FIFO, feeding a small bounded buffer) and playback (one clip at a
//! time, bounded by the clip length plus a margin). Audio output goes through
//! an [`AudioSink`] and per-item failures go to an [`ErrorReporter`].

pub mod queue;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::synthesis::{Audio, SynthesisError};
use crate::utils::ErrorLogging;

pub use queue::PlaybackQueue;

/// A message waiting to be spoken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message_id: u64,
    pub author_id: u64,
    /// Already filtered text
    pub text: String,
    pub voice: String,
    /// Clips longer than this are dropped before reaching the buffer
    pub max_length: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Synthesis,
    Play,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synthesis => f.write_str("synthesis"),
            Self::Play => f.write_str("play"),
        }
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum PlaybackError {
    #[error("Synthesis failed for message {message_id}")]
    #[diagnostic(code(chorus_core::playback::synthesis))]
    Synthesis {
        message_id: u64,
        #[source]
        cause: SynthesisError,
    },

    #[error("Audio sink failed: {0}")]
    #[diagnostic(
        code(chorus_core::playback::sink),
        help("The voice connection may have been closed; rejoin the channel")
    )]
    Sink(String),

    #[error("Playback did not finish within {waited:?} (clip length {length:?})")]
    #[diagnostic(
        code(chorus_core::playback::timeout),
        help("The voice driver stopped reporting progress; the clip was stopped")
    )]
    Timeout { length: Duration, waited: Duration },

    #[error("Audio sink dropped the track without reporting completion")]
    #[diagnostic(code(chorus_core::playback::abandoned))]
    Abandoned,

    #[error("The {stage} stage panicked and was restarted")]
    #[diagnostic(code(chorus_core::playback::stage_panicked))]
    StagePanicked { stage: Stage },

    #[error("Playback queue has been shut down")]
    #[diagnostic(code(chorus_core::playback::closed))]
    Closed,
}

/// A track that has started playing.
///
/// Dropping the handle before completion stops the track.
pub struct PlaybackHandle {
    done: oneshot::Receiver<()>,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl PlaybackHandle {
    /// `done` fires when the track ends; `stop` cuts it short.
    pub fn new(done: oneshot::Receiver<()>, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            done,
            stop: Some(Box::new(stop)),
        }
    }

    /// Resolves when the sink reports the track finished.
    pub async fn finished(&mut self) -> Result<(), PlaybackError> {
        let result = (&mut self.done).await.map_err(|_| PlaybackError::Abandoned);
        if result.is_ok() {
            self.stop = None;
        }
        result
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("stoppable", &self.stop.is_some())
            .finish()
    }
}

#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: Audio) -> Result<PlaybackHandle, PlaybackError>;
}

/// Something went wrong in a guild's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub guild_id: u64,
    pub stage: Stage,
    pub message: String,
}

impl ErrorReport {
    pub fn new(guild_id: u64, stage: Stage, error: &PlaybackError) -> Self {
        Self {
            guild_id,
            stage,
            message: error.log_format(),
        }
    }
}

#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, report: ErrorReport);
}

/// Reports through the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

#[async_trait]
impl ErrorReporter for TracingReporter {
    async fn report(&self, report: ErrorReport) {
        tracing::warn!(
            guild_id = report.guild_id,
            stage = %report.stage,
            "Playback error: {}",
            report.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handle(stops: &Arc<AtomicUsize>) -> (oneshot::Sender<()>, PlaybackHandle) {
        let (tx, rx) = oneshot::channel();
        let stops = Arc::clone(stops);
        let handle = PlaybackHandle::new(rx, move || {
            stops.fetch_add(1, Ordering::SeqCst);
        });
        (tx, handle)
    }

    #[tokio::test]
    async fn finished_track_is_not_stopped_on_drop() {
        let stops = Arc::new(AtomicUsize::new(0));
        let (tx, mut handle) = handle(&stops);
        tx.send(()).unwrap();
        handle.finished().await.unwrap();
        drop(handle);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_handle_stops_track() {
        let stops = Arc::new(AtomicUsize::new(0));
        let (_tx, handle) = handle(&stops);
        drop(handle);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_completion_is_an_error() {
        let stops = Arc::new(AtomicUsize::new(0));
        let (tx, mut handle) = handle(&stops);
        drop(tx);
        assert!(matches!(
            handle.finished().await,
            Err(PlaybackError::Abandoned)
        ));
        handle.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn report_carries_the_cause() {
        let error = PlaybackError::Synthesis {
            message_id: 7,
            cause: SynthesisError::BadStatus {
                engine: "voicevox".into(),
                status: 500,
                body: String::new(),
            },
        };
        let report = ErrorReport::new(1, Stage::Synthesis, &error);
        assert!(report.message.starts_with("Synthesis failed for message 7"));
        assert!(report.message.contains("HTTP 500"));
    }
}
