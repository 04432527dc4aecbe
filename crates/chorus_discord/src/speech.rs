//! From chat message to queued speech
//!
//! Independent of the gateway so the decision logic (which channel, which
//! voice, whether to prefix the author) can be exercised without Discord.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::config::PlaybackConfig;
use chorus_core::filter::{Filtered, MessageContext, clean_message};
use chorus_core::playback::{AudioSink, ErrorReporter};
use chorus_core::settings::{GuildSettings, SettingsStore};
use chorus_core::synthesis::Synthesizer;
use chorus_core::PlaybackQueue;
use dashmap::DashMap;

use crate::error::Result;
use crate::registry::GuildPlaybackRegistry;

/// A guild text message, reduced to what speech needs.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub content: String,
    pub context: MessageContext,
}

pub struct Speaker {
    settings: Arc<dyn SettingsStore>,
    synthesizer: Arc<dyn Synthesizer>,
    reporter: Arc<dyn ErrorReporter>,
    registry: Arc<GuildPlaybackRegistry>,
    playback: PlaybackConfig,
    /// Author of the last spoken message, per guild
    last_author: DashMap<u64, u64>,
}

impl Speaker {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        synthesizer: Arc<dyn Synthesizer>,
        reporter: Arc<dyn ErrorReporter>,
        registry: Arc<GuildPlaybackRegistry>,
        playback: PlaybackConfig,
    ) -> Self {
        Self {
            settings,
            synthesizer,
            reporter,
            registry,
            playback,
            last_author: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<GuildPlaybackRegistry> {
        &self.registry
    }

    /// Start a fresh pipeline for a guild that just joined voice.
    pub fn open(&self, guild_id: u64, sink: Arc<dyn AudioSink>) -> Arc<PlaybackQueue> {
        self.last_author.remove(&guild_id);
        self.registry.insert(PlaybackQueue::new(
            guild_id,
            Arc::clone(&self.synthesizer),
            sink,
            Arc::clone(&self.reporter),
            &self.playback,
        ))
    }

    /// Tear down a guild's pipeline. Returns whether one was running.
    pub fn close(&self, guild_id: u64) -> bool {
        self.last_author.remove(&guild_id);
        self.registry.remove(guild_id)
    }

    /// Discard what the guild has queued. Returns whether it had a pipeline.
    pub fn skip(&self, guild_id: u64) -> Result<bool> {
        match self.registry.get(guild_id) {
            Some(queue) => {
                queue.skip()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Queue `message` if the guild reads its channel aloud and has a voice
    /// connection. Returns the text that was queued.
    pub async fn speak(
        &self,
        message: IncomingMessage,
        settings: &GuildSettings,
    ) -> Result<Option<String>> {
        if settings.channel != Some(message.channel_id) {
            return Ok(None);
        }
        let Some(queue) = self.registry.get(message.guild_id) else {
            return Ok(None);
        };

        let mut context = message.context;
        context.same_author_as_last = self
            .last_author
            .get(&message.guild_id)
            .is_some_and(|last| *last == message.author_id);

        let text = match clean_message(&message.content, &context, settings) {
            Filtered::Speak(text) => text,
            Filtered::Ignore(reason) => {
                tracing::trace!(guild_id = message.guild_id, ?reason, "Not speaking message");
                return Ok(None);
            }
        };

        let voice = self
            .settings
            .user_voice(message.author_id)
            .await?
            .unwrap_or_else(|| settings.voice.clone());

        queue.queue(
            message.message_id,
            message.author_id,
            text.clone(),
            voice,
            Duration::from_secs(settings.msg_length),
        )?;
        self.last_author.insert(message.guild_id, message.author_id);
        Ok(Some(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BytesSynthesizer, SilentSink};
    use chorus_core::playback::TracingReporter;
    use chorus_core::settings::MemorySettingsStore;
    use pretty_assertions::assert_eq;

    const GUILD: u64 = 1;
    const CHANNEL: u64 = 10;

    fn speaker() -> Speaker {
        Speaker::new(
            Arc::new(MemorySettingsStore::new()),
            Arc::new(BytesSynthesizer),
            Arc::new(TracingReporter),
            Arc::new(GuildPlaybackRegistry::new()),
            PlaybackConfig::default(),
        )
    }

    fn settings() -> GuildSettings {
        GuildSettings {
            channel: Some(CHANNEL),
            ..Default::default()
        }
    }

    fn message(author_id: u64, name: &str, content: &str) -> IncomingMessage {
        IncomingMessage {
            guild_id: GUILD,
            channel_id: CHANNEL,
            message_id: 100 + author_id,
            author_id,
            content: content.to_string(),
            context: MessageContext {
                author_name: name.to_string(),
                ..Default::default()
            },
        }
    }

    async fn played(sink: &SilentSink, count: usize) -> Vec<String> {
        for _ in 0..500 {
            if sink.played().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.played()
    }

    #[tokio::test]
    async fn names_author_only_when_it_changes() {
        let speaker = speaker();
        let sink = SilentSink::new();
        speaker.open(GUILD, sink.clone());

        for (author, name, text) in [(1, "Ann", "hi"), (1, "Ann", "again"), (2, "Bo", "yo")] {
            speaker
                .speak(message(author, name, text), &settings())
                .await
                .unwrap();
        }

        assert_eq!(
            played(&sink, 3).await,
            vec!["Ann said: hi", "again", "Bo said: yo"]
        );
    }

    #[tokio::test]
    async fn ignores_other_channels_and_guilds_without_voice() {
        let speaker = speaker();
        let mut elsewhere = message(1, "Ann", "hello");
        elsewhere.channel_id = 11;

        assert_eq!(speaker.speak(message(1, "Ann", "hello"), &settings()).await.unwrap(), None);

        speaker.open(GUILD, SilentSink::new());
        assert_eq!(speaker.speak(elsewhere, &settings()).await.unwrap(), None);
        assert_eq!(
            speaker
                .speak(message(1, "Ann", "-skip"), &settings())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn closing_forgets_the_last_author() {
        let speaker = speaker();
        speaker.open(GUILD, SilentSink::new());
        speaker.speak(message(1, "Ann", "hi"), &settings()).await.unwrap();

        assert!(speaker.close(GUILD));
        assert!(!speaker.skip(GUILD).unwrap());

        speaker.open(GUILD, SilentSink::new());
        let text = speaker.speak(message(1, "Ann", "back"), &settings()).await.unwrap();
        assert_eq!(text.as_deref(), Some("Ann said: back"));
    }

    #[tokio::test]
    async fn skip_keeps_the_guild_connected() {
        let speaker = speaker();
        speaker.open(GUILD, SilentSink::new());
        assert!(speaker.skip(GUILD).unwrap());
        assert_eq!(speaker.registry().len(), 1);
    }
}
