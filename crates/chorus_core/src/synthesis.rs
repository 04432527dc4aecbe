//! Text-to-speech synthesis collaborators
//!
//! The pipeline only needs `synthesize(text, voice)` and a way to measure the
//! result. [`VoicevoxSynthesizer`] talks to a VOICEVOX-compatible HTTP engine,
//! [`FallbackSynthesizer`] switches engines when the primary is rate limited,
//! and [`CachedSynthesizer`] puts an [`AudioCache`] in front of either.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::audio::wav_duration;
use crate::cache::AudioCache;

/// Synthesized audio, shareable between the cache and the player
pub type Audio = Arc<[u8]>;

#[derive(Error, Diagnostic, Debug)]
pub enum SynthesisError {
    #[error("Synthesis engine is rate limiting requests")]
    #[diagnostic(
        code(chorus_core::synthesis::rate_limited),
        help("Configure synthesis.fallback_url to keep speaking while the primary engine recovers")
    )]
    RateLimited { engine: String },

    #[error("Synthesis request failed")]
    #[diagnostic(
        code(chorus_core::synthesis::request_failed),
        help("Check that the engine at {engine} is running and reachable")
    )]
    RequestFailed {
        engine: String,
        #[source]
        cause: reqwest::Error,
    },

    #[error("Synthesis engine returned HTTP {status}")]
    #[diagnostic(code(chorus_core::synthesis::bad_status))]
    BadStatus {
        engine: String,
        status: u16,
        body: String,
    },

    #[error("Invalid voice '{voice}'")]
    #[diagnostic(
        code(chorus_core::synthesis::invalid_voice),
        help("VOICEVOX voices are numeric speaker ids")
    )]
    InvalidVoice { voice: String },
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Audio, SynthesisError>;

    /// Playback length of audio produced by this synthesizer
    fn duration(&self, audio: &[u8]) -> Option<Duration>;
}

/// Two-step VOICEVOX engine client (`audio_query` then `synthesis`).
pub struct VoicevoxSynthesizer {
    client: Client,
    base_url: String,
}

impl VoicevoxSynthesizer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SynthesisError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|cause| SynthesisError::RequestFailed {
                engine: base_url.clone(),
                cause,
            })?;

        Ok(Self { client, base_url })
    }

    fn request_failed(&self, cause: reqwest::Error) -> SynthesisError {
        SynthesisError::RequestFailed {
            engine: self.base_url.clone(),
            cause,
        }
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, SynthesisError> {
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(SynthesisError::RateLimited {
                engine: self.base_url.clone(),
            }),
            status if status.is_success() => Ok(response),
            status => Err(SynthesisError::BadStatus {
                engine: self.base_url.clone(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl Synthesizer for VoicevoxSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Audio, SynthesisError> {
        let speaker: u32 = voice.parse().map_err(|_| SynthesisError::InvalidVoice {
            voice: voice.to_string(),
        })?;
        let speaker = speaker.to_string();

        let query = self
            .client
            .post(format!("{}/audio_query", self.base_url))
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;
        let query: serde_json::Value = self
            .check_status(query)
            .await?
            .json()
            .await
            .map_err(|e| self.request_failed(e))?;

        let synthesis = self
            .client
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;
        let bytes = self
            .check_status(synthesis)
            .await?
            .bytes()
            .await
            .map_err(|e| self.request_failed(e))?;

        Ok(Arc::from(bytes.as_ref()))
    }

    fn duration(&self, audio: &[u8]) -> Option<Duration> {
        wav_duration(audio)
    }
}

/// Uses `fallback` whenever `primary` reports a rate limit.
pub struct FallbackSynthesizer {
    primary: Arc<dyn Synthesizer>,
    fallback: Arc<dyn Synthesizer>,
}

impl FallbackSynthesizer {
    pub fn new(primary: Arc<dyn Synthesizer>, fallback: Arc<dyn Synthesizer>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Synthesizer for FallbackSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Audio, SynthesisError> {
        match self.primary.synthesize(text, voice).await {
            Err(SynthesisError::RateLimited { engine }) => {
                tracing::warn!(%engine, "Primary synthesis engine rate limited, using fallback");
                self.fallback.synthesize(text, voice).await
            }
            other => other,
        }
    }

    fn duration(&self, audio: &[u8]) -> Option<Duration> {
        self.primary
            .duration(audio)
            .or_else(|| self.fallback.duration(audio))
    }
}

/// Consults the cache before synthesizing and fills it afterwards.
pub struct CachedSynthesizer {
    inner: Arc<dyn Synthesizer>,
    cache: Arc<dyn AudioCache>,
}

impl CachedSynthesizer {
    pub fn new(inner: Arc<dyn Synthesizer>, cache: Arc<dyn AudioCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Synthesizer for CachedSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Audio, SynthesisError> {
        if let Some(audio) = self.cache.get(text, voice).await {
            tracing::trace!(text, voice, "Synthesis cache hit");
            return Ok(audio);
        }

        let audio = self.inner.synthesize(text, voice).await?;
        self.cache.set(text, voice, Arc::clone(&audio)).await;
        Ok(audio)
    }

    fn duration(&self, audio: &[u8]) -> Option<Duration> {
        self.inner.duration(audio)
    }
}
