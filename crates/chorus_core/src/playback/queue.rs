use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{
    AudioSink, ErrorReport, ErrorReporter, PlaybackError, QueuedMessage, Stage,
};
use crate::config::PlaybackConfig;
use crate::synthesis::{Audio, Synthesizer};

type MessageReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<QueuedMessage>>>;
type AudioReceiver = Arc<AsyncMutex<mpsc::Receiver<SynthesizedClip>>>;

struct SynthesizedClip {
    message_id: u64,
    audio: Audio,
    length: Duration,
}

/// What both stages need, shared across generations.
struct StageContext {
    guild_id: u64,
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
    reporter: Arc<dyn ErrorReporter>,
    audio_buffer: usize,
    timeout_margin: Duration,
}

impl StageContext {
    async fn report(&self, stage: Stage, error: PlaybackError) {
        self.reporter
            .report(ErrorReport::new(self.guild_id, stage, &error))
            .await;
    }
}

/// One set of queues plus the tasks draining them. `skip` swaps generations.
struct Generation {
    messages: mpsc::UnboundedSender<QueuedMessage>,
    cancel: CancellationToken,
}

/// Text-to-audio pipeline for one guild.
///
/// Messages are synthesized strictly in the order they were queued, at most
/// `audio_buffer` clips wait for playback, and clips play one at a time.
pub struct PlaybackQueue {
    ctx: Arc<StageContext>,
    current: Mutex<Option<Generation>>,
}

impl PlaybackQueue {
    /// Must be called from within a tokio runtime; both stages start immediately.
    pub fn new(
        guild_id: u64,
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
        reporter: Arc<dyn ErrorReporter>,
        config: &PlaybackConfig,
    ) -> Self {
        let ctx = Arc::new(StageContext {
            guild_id,
            synthesizer,
            sink,
            reporter,
            audio_buffer: config.audio_buffer.max(1),
            timeout_margin: config.play_timeout_margin(),
        });
        let generation = start_generation(&ctx);

        Self {
            ctx,
            current: Mutex::new(Some(generation)),
        }
    }

    pub fn guild_id(&self) -> u64 {
        self.ctx.guild_id
    }

    /// Append a message. Never waits and never rejects on depth.
    pub fn queue(
        &self,
        message_id: u64,
        author_id: u64,
        text: String,
        voice: String,
        max_length: Duration,
    ) -> Result<(), PlaybackError> {
        self.push(QueuedMessage {
            message_id,
            author_id,
            text,
            voice,
            max_length,
        })
    }

    pub fn push(&self, message: QueuedMessage) -> Result<(), PlaybackError> {
        let current = self.current.lock();
        let generation = current.as_ref().ok_or(PlaybackError::Closed)?;
        generation
            .messages
            .send(message)
            .map_err(|_| PlaybackError::Closed)
    }

    /// Discard everything queued, buffered or playing and start over.
    pub fn skip(&self) -> Result<(), PlaybackError> {
        let mut current = self.current.lock();
        let old = current.take().ok_or(PlaybackError::Closed)?;
        old.cancel.cancel();
        *current = Some(start_generation(&self.ctx));
        tracing::debug!(guild_id = self.ctx.guild_id, "Playback queue skipped");
        Ok(())
    }

    /// Stop both stages for good. Further `queue` calls fail with `Closed`.
    pub fn shutdown(&self) {
        if let Some(generation) = self.current.lock().take() {
            generation.cancel.cancel();
            tracing::debug!(guild_id = self.ctx.guild_id, "Playback queue shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.current.lock().is_none()
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn start_generation(ctx: &Arc<StageContext>) -> Generation {
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let (audio_tx, audio_rx) = mpsc::channel(ctx.audio_buffer);
    let cancel = CancellationToken::new();

    let messages: MessageReceiver = Arc::new(AsyncMutex::new(message_rx));
    let audio: AudioReceiver = Arc::new(AsyncMutex::new(audio_rx));

    supervise_stage(Arc::clone(ctx), Stage::Synthesis, cancel.clone(), {
        let ctx = Arc::clone(ctx);
        move || synthesis_stage(Arc::clone(&ctx), Arc::clone(&messages), audio_tx.clone())
    });
    supervise_stage(Arc::clone(ctx), Stage::Play, cancel.clone(), {
        let ctx = Arc::clone(ctx);
        move || play_stage(Arc::clone(&ctx), Arc::clone(&audio))
    });

    Generation {
        messages: message_tx,
        cancel,
    }
}

/// Run a stage until cancelled, restarting it on the same queues if it panics.
fn supervise_stage<F, Fut>(
    ctx: Arc<StageContext>,
    stage: Stage,
    cancel: CancellationToken,
    make_stage: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut task = tokio::spawn(make_stage());
            tokio::select! {
                _ = cancel.cancelled() => {
                    task.abort();
                    return;
                }
                joined = &mut task => match joined {
                    Ok(()) => return,
                    Err(e) if e.is_panic() => {
                        tracing::error!(guild_id = ctx.guild_id, %stage, "Playback stage panicked, restarting");
                        ctx.report(stage, PlaybackError::StagePanicked { stage }).await;
                    }
                    Err(_) => return,
                },
            }
        }
    });
}

async fn synthesis_stage(
    ctx: Arc<StageContext>,
    messages: MessageReceiver,
    audio: mpsc::Sender<SynthesizedClip>,
) {
    loop {
        let Some(message) = messages.lock().await.recv().await else {
            return;
        };

        let clip = match ctx
            .synthesizer
            .synthesize(&message.text, &message.voice)
            .await
        {
            Ok(clip) => clip,
            Err(cause) => {
                let error = PlaybackError::Synthesis {
                    message_id: message.message_id,
                    cause,
                };
                ctx.report(Stage::Synthesis, error).await;
                continue;
            }
        };

        let Some(length) = ctx.synthesizer.duration(&clip) else {
            tracing::debug!(
                guild_id = ctx.guild_id,
                message_id = message.message_id,
                "Dropping clip with unmeasurable length"
            );
            continue;
        };
        if length > message.max_length {
            tracing::debug!(
                guild_id = ctx.guild_id,
                message_id = message.message_id,
                ?length,
                max_length = ?message.max_length,
                "Dropping clip over the length limit"
            );
            continue;
        }

        let clip = SynthesizedClip {
            message_id: message.message_id,
            audio: clip,
            length,
        };
        if audio.send(clip).await.is_err() {
            return;
        }
    }
}

async fn play_stage(ctx: Arc<StageContext>, audio: AudioReceiver) {
    loop {
        let Some(clip) = audio.lock().await.recv().await else {
            return;
        };

        let mut handle = match ctx.sink.play(clip.audio).await {
            Ok(handle) => handle,
            Err(e) => {
                ctx.report(Stage::Play, e).await;
                continue;
            }
        };

        let waited = clip.length + ctx.timeout_margin;
        match tokio::time::timeout(waited, handle.finished()).await {
            Ok(Ok(())) => {
                tracing::trace!(guild_id = ctx.guild_id, message_id = clip.message_id, "Clip finished");
            }
            Ok(Err(e)) => ctx.report(Stage::Play, e).await,
            Err(_) => {
                handle.stop();
                let error = PlaybackError::Timeout {
                    length: clip.length,
                    waited,
                };
                ctx.report(Stage::Play, error).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::SynthesisError;
    use crate::playback::PlaybackHandle;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    /// Audio is the text itself; one byte lasts one second.
    struct EchoSynthesizer;

    #[async_trait]
    impl Synthesizer for EchoSynthesizer {
        async fn synthesize(&self, text: &str, _voice: &str) -> Result<Audio, SynthesisError> {
            match text {
                "boom" => panic!("synthesizer exploded"),
                "fail" => Err(SynthesisError::InvalidVoice {
                    voice: "x".into(),
                }),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Arc::from(text.as_bytes()))
                }
                _ => Ok(Arc::from(text.as_bytes())),
            }
        }

        fn duration(&self, audio: &[u8]) -> Option<Duration> {
            if audio == b"???" {
                None
            } else {
                Some(Duration::from_secs(audio.len() as u64))
            }
        }
    }

    /// Records what was played. Clips starting with "hang" never finish.
    struct RecordingSink {
        played: mpsc::UnboundedSender<String>,
        stopped: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, audio: Audio) -> Result<PlaybackHandle, PlaybackError> {
            let text = String::from_utf8_lossy(&audio).into_owned();
            let (done_tx, done_rx) = oneshot::channel();
            let stopped = self.stopped.clone();
            let name = text.clone();
            let handle = PlaybackHandle::new(done_rx, move || {
                let _ = stopped.send(name);
            });

            let _ = self.played.send(text.clone());
            if text.starts_with("hang") {
                // Keep the sender alive so completion never resolves
                std::mem::forget(done_tx);
            } else {
                let _ = done_tx.send(());
            }
            Ok(handle)
        }
    }

    struct CollectingReporter(mpsc::UnboundedSender<ErrorReport>);

    #[async_trait]
    impl ErrorReporter for CollectingReporter {
        async fn report(&self, report: ErrorReport) {
            let _ = self.0.send(report);
        }
    }

    struct Harness {
        queue: PlaybackQueue,
        played: mpsc::UnboundedReceiver<String>,
        stopped: mpsc::UnboundedReceiver<String>,
        reports: mpsc::UnboundedReceiver<ErrorReport>,
    }

    impl Harness {
        fn new() -> Self {
            let (played_tx, played) = mpsc::unbounded_channel();
            let (stopped_tx, stopped) = mpsc::unbounded_channel();
            let (report_tx, reports) = mpsc::unbounded_channel();
            let queue = PlaybackQueue::new(
                7,
                Arc::new(EchoSynthesizer),
                Arc::new(RecordingSink {
                    played: played_tx,
                    stopped: stopped_tx,
                }),
                Arc::new(CollectingReporter(report_tx)),
                &PlaybackConfig::default(),
            );
            Self {
                queue,
                played,
                stopped,
                reports,
            }
        }

        fn say(&self, id: u64, text: &str) {
            self.queue
                .queue(id, 1, text.to_string(), "1".into(), Duration::from_secs(30))
                .unwrap();
        }

        async fn next_played(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(60), self.played.recv())
                .await
                .expect("nothing played")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn plays_in_queue_order() {
        let mut h = Harness::new();
        h.say(1, "slow");
        h.say(2, "b");
        h.say(3, "c");

        assert_eq!(h.next_played().await, "slow");
        assert_eq!(h.next_played().await, "b");
        assert_eq!(h.next_played().await, "c");
    }

    #[tokio::test]
    async fn over_length_and_unmeasurable_clips_are_never_played() {
        let mut h = Harness::new();
        h.queue
            .queue(1, 1, "far too long".into(), "1".into(), Duration::from_secs(3))
            .unwrap();
        h.say(2, "???");
        h.say(3, "ok");

        assert_eq!(h.next_played().await, "ok");
        assert!(h.played.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn play_timeout_is_reported_and_pipeline_continues() {
        let mut h = Harness::new();
        h.say(1, "hang");
        h.say(2, "next");

        assert_eq!(h.next_played().await, "hang");
        assert_eq!(h.next_played().await, "next");

        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.guild_id, 7);
        assert_eq!(report.stage, Stage::Play);
        assert!(report.message.contains("did not finish"));
        assert_eq!(h.stopped.recv().await.unwrap(), "hang");
    }

    #[tokio::test]
    async fn skip_discards_queued_and_playing_work() {
        let mut h = Harness::new();
        h.say(1, "hang a");
        h.say(2, "b");
        h.say(3, "c");
        assert_eq!(h.next_played().await, "hang a");

        h.queue.skip().unwrap();
        assert_eq!(h.stopped.recv().await.unwrap(), "hang a");

        h.say(4, "d");
        assert_eq!(h.next_played().await, "d");
        assert!(h.played.try_recv().is_err());
    }

    #[tokio::test]
    async fn synthesis_errors_skip_the_item() {
        let mut h = Harness::new();
        h.say(1, "fail");
        h.say(2, "after");

        assert_eq!(h.next_played().await, "after");
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.stage, Stage::Synthesis);
    }

    #[tokio::test]
    async fn panicking_stage_is_restarted_on_same_queue() {
        let mut h = Harness::new();
        h.say(1, "boom");
        h.say(2, "survivor");

        assert_eq!(h.next_played().await, "survivor");
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.stage, Stage::Synthesis);
        assert!(report.message.contains("panicked"));
    }

    #[tokio::test]
    async fn closed_queue_rejects_messages() {
        let h = Harness::new();
        h.queue.shutdown();
        assert!(h.queue.is_closed());
        assert!(matches!(
            h.queue
                .queue(1, 1, "x".into(), "1".into(), Duration::from_secs(1)),
            Err(PlaybackError::Closed)
        ));
        assert!(matches!(h.queue.skip(), Err(PlaybackError::Closed)));
    }
}
