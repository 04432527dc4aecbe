//! Playback error reporting into a Discord channel

use std::sync::Arc;

use async_trait::async_trait;
use chorus_core::playback::{ErrorReport, ErrorReporter, TracingReporter};
use serenity::http::Http;
use serenity::model::id::ChannelId;

/// Logs every report and posts it to the configured error channel.
pub struct ChannelReporter {
    http: Arc<Http>,
    channel_id: ChannelId,
}

impl ChannelReporter {
    pub fn new(http: Arc<Http>, channel_id: u64) -> Self {
        Self {
            http,
            channel_id: ChannelId::new(channel_id),
        }
    }
}

pub fn format_report(report: &ErrorReport) -> String {
    format!(
        "**Playback error** in guild `{}` during {}: {}",
        report.guild_id, report.stage, report.message
    )
}

#[async_trait]
impl ErrorReporter for ChannelReporter {
    async fn report(&self, report: ErrorReport) {
        let content = format_report(&report);
        TracingReporter.report(report).await;

        if let Err(e) = self.channel_id.say(&self.http, content).await {
            tracing::warn!(channel_id = %self.channel_id, error = %e, "Failed to post error report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::playback::{PlaybackError, Stage};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn report_names_guild_and_stage() {
        let report = ErrorReport::new(
            42,
            Stage::Play,
            &PlaybackError::Timeout {
                length: Duration::from_secs(3),
                waited: Duration::from_secs(8),
            },
        );
        let text = format_report(&report);
        assert!(text.starts_with("**Playback error** in guild `42` during play: "));
        assert!(text.ends_with(&report.message));
        assert_eq!(report.stage, Stage::Play);
    }
}
