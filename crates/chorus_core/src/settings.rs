//! Per-guild and per-user settings
//!
//! The relational store used in production sits behind [`SettingsStore`];
//! [`MemorySettingsStore`] keeps everything in process.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use dashmap::DashMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every setting a guild can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    /// Text channel whose messages are read aloud
    Channel,
    Prefix,
    /// Prepend "<name> said" to each message
    Xsaid,
    AutoJoin,
    BotIgnore,
    /// Longest clip that will be played, in seconds
    MsgLength,
    /// Collapse runs of the same character longer than this (0 = off)
    RepeatedChars,
    /// Default voice for the guild
    Voice,
}

impl SettingKey {
    pub const ALL: [SettingKey; 8] = [
        Self::Channel,
        Self::Prefix,
        Self::Xsaid,
        Self::AutoJoin,
        Self::BotIgnore,
        Self::MsgLength,
        Self::RepeatedChars,
        Self::Voice,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Prefix => "prefix",
            Self::Xsaid => "xsaid",
            Self::AutoJoin => "auto_join",
            Self::BotIgnore => "bot_ignore",
            Self::MsgLength => "msg_length",
            Self::RepeatedChars => "repeated_chars",
            Self::Voice => "voice",
        }
    }

    pub fn default_value(self) -> SettingValue {
        match self {
            Self::Channel => SettingValue::Unset,
            Self::Prefix => SettingValue::Text("-".to_string()),
            Self::Xsaid => SettingValue::Bool(true),
            Self::AutoJoin => SettingValue::Bool(false),
            Self::BotIgnore => SettingValue::Bool(true),
            Self::MsgLength => SettingValue::Number(30),
            Self::RepeatedChars => SettingValue::Number(0),
            Self::Voice => SettingValue::Text("1".to_string()),
        }
    }

    /// Parse user input for this key, e.g. from a `set` command.
    pub fn parse_value(self, raw: &str) -> Result<SettingValue, SettingsError> {
        let invalid = |expected: &str| SettingsError::InvalidValue {
            key: self,
            value: raw.to_string(),
            expected: expected.to_string(),
        };

        match self {
            Self::Xsaid | Self::AutoJoin | Self::BotIgnore => {
                match raw.to_ascii_lowercase().as_str() {
                    "true" | "on" | "yes" | "enable" => Ok(SettingValue::Bool(true)),
                    "false" | "off" | "no" | "disable" => Ok(SettingValue::Bool(false)),
                    _ => Err(invalid("on/off")),
                }
            }
            Self::Channel => {
                let id = raw.trim_start_matches("<#").trim_end_matches('>');
                id.parse()
                    .map(SettingValue::Number)
                    .map_err(|_| invalid("a channel mention or id"))
            }
            Self::MsgLength => match raw.parse::<u64>() {
                Ok(secs @ 1..=60) => Ok(SettingValue::Number(secs)),
                _ => Err(invalid("a number of seconds between 1 and 60")),
            },
            Self::RepeatedChars => match raw.parse::<u64>() {
                Ok(n @ (0 | 5..=100)) => Ok(SettingValue::Number(n)),
                _ => Err(invalid("0 to disable, or a number between 5 and 100")),
            },
            Self::Prefix => {
                if raw.is_empty() || raw.chars().count() > 5 || raw.contains(char::is_whitespace) {
                    Err(invalid("up to 5 characters without spaces"))
                } else {
                    Ok(SettingValue::Text(raw.to_string()))
                }
            }
            Self::Voice => Ok(SettingValue::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.name() == s)
            .ok_or_else(|| SettingsError::UnknownKey {
                key: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Number(u64),
    Text(String),
    Unset,
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("on"),
            Self::Bool(false) => f.write_str("off"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Unset => f.write_str("not set"),
        }
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum SettingsError {
    #[error("Unknown setting '{key}'")]
    #[diagnostic(
        code(chorus_core::settings::unknown_key),
        help("Known settings: channel, prefix, xsaid, auto_join, bot_ignore, msg_length, repeated_chars, voice")
    )]
    UnknownKey { key: String },

    #[error("Invalid value '{value}' for {key}")]
    #[diagnostic(code(chorus_core::settings::invalid_value), help("Expected {expected}"))]
    InvalidValue {
        key: SettingKey,
        value: String,
        expected: String,
    },

    #[error("Settings backend failed: {0}")]
    #[diagnostic(code(chorus_core::settings::backend))]
    Backend(String),
}

/// Resolved settings for one guild, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSettings {
    pub channel: Option<u64>,
    pub prefix: String,
    pub xsaid: bool,
    pub auto_join: bool,
    pub bot_ignore: bool,
    pub msg_length: u64,
    pub repeated_chars: u64,
    pub voice: String,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self::from_lookup(|key| key.default_value())
    }
}

impl GuildSettings {
    fn from_lookup(mut get: impl FnMut(SettingKey) -> SettingValue) -> Self {
        let mut value = |key: SettingKey| match get(key) {
            SettingValue::Unset => key.default_value(),
            other => other,
        };

        Self {
            channel: value(SettingKey::Channel).as_number(),
            prefix: value(SettingKey::Prefix).as_text().unwrap_or("-").to_string(),
            xsaid: value(SettingKey::Xsaid).as_bool().unwrap_or(true),
            auto_join: value(SettingKey::AutoJoin).as_bool().unwrap_or(false),
            bot_ignore: value(SettingKey::BotIgnore).as_bool().unwrap_or(true),
            msg_length: value(SettingKey::MsgLength).as_number().unwrap_or(30),
            repeated_chars: value(SettingKey::RepeatedChars).as_number().unwrap_or(0),
            voice: value(SettingKey::Voice).as_text().unwrap_or("1").to_string(),
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, guild_id: u64, key: SettingKey) -> Result<SettingValue, SettingsError>;

    async fn set(
        &self,
        guild_id: u64,
        key: SettingKey,
        value: SettingValue,
    ) -> Result<(), SettingsError>;

    async fn user_voice(&self, user_id: u64) -> Result<Option<String>, SettingsError>;

    async fn set_user_voice(&self, user_id: u64, voice: Option<String>)
    -> Result<(), SettingsError>;

    async fn guild_settings(&self, guild_id: u64) -> Result<GuildSettings, SettingsError> {
        let mut values = Vec::with_capacity(SettingKey::ALL.len());
        for key in SettingKey::ALL {
            values.push((key, self.get(guild_id, key).await?));
        }

        Ok(GuildSettings::from_lookup(|key| {
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or(SettingValue::Unset)
        }))
    }
}

/// Settings held in memory for the lifetime of the process
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    guilds: DashMap<(u64, SettingKey), SettingValue>,
    users: DashMap<u64, String>,
    defaults: DashMap<SettingKey, SettingValue>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the built-in default of `key` for guilds that never set it.
    pub fn with_default(self, key: SettingKey, value: SettingValue) -> Self {
        self.defaults.insert(key, value);
        self
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, guild_id: u64, key: SettingKey) -> Result<SettingValue, SettingsError> {
        Ok(self
            .guilds
            .get(&(guild_id, key))
            .map(|v| v.clone())
            .or_else(|| self.defaults.get(&key).map(|v| v.clone()))
            .unwrap_or_else(|| key.default_value()))
    }

    async fn set(
        &self,
        guild_id: u64,
        key: SettingKey,
        value: SettingValue,
    ) -> Result<(), SettingsError> {
        if value == SettingValue::Unset {
            self.guilds.remove(&(guild_id, key));
        } else {
            self.guilds.insert((guild_id, key), value);
        }
        Ok(())
    }

    async fn user_voice(&self, user_id: u64) -> Result<Option<String>, SettingsError> {
        Ok(self.users.get(&user_id).map(|v| v.clone()))
    }

    async fn set_user_voice(
        &self,
        user_id: u64,
        voice: Option<String>,
    ) -> Result<(), SettingsError> {
        match voice {
            Some(voice) => {
                self.users.insert(user_id, voice);
            }
            None => {
                self.users.remove(&user_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn defaults_until_set() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.guild_settings(1).await.unwrap(), GuildSettings::default());

        store
            .set(1, SettingKey::MsgLength, SettingValue::Number(12))
            .await
            .unwrap();
        store
            .set(1, SettingKey::Channel, SettingValue::Number(42))
            .await
            .unwrap();

        let settings = store.guild_settings(1).await.unwrap();
        assert_eq!(settings.msg_length, 12);
        assert_eq!(settings.channel, Some(42));
        assert_eq!(store.guild_settings(2).await.unwrap().channel, None);
    }

    #[tokio::test]
    async fn configured_default_applies_until_set() {
        let store = MemorySettingsStore::new()
            .with_default(SettingKey::Prefix, SettingValue::Text("!".into()));
        assert_eq!(store.guild_settings(1).await.unwrap().prefix, "!");

        store
            .set(1, SettingKey::Prefix, SettingValue::Text("?".into()))
            .await
            .unwrap();
        assert_eq!(store.guild_settings(1).await.unwrap().prefix, "?");
        assert_eq!(store.guild_settings(2).await.unwrap().prefix, "!");
    }

    #[test]
    fn parses_user_input() {
        assert_eq!(
            SettingKey::Xsaid.parse_value("off").unwrap(),
            SettingValue::Bool(false)
        );
        assert_eq!(
            SettingKey::Channel.parse_value("<#1234>").unwrap(),
            SettingValue::Number(1234)
        );
        assert!(SettingKey::MsgLength.parse_value("0").is_err());
        assert!(SettingKey::RepeatedChars.parse_value("3").is_err());
        assert!(SettingKey::Prefix.parse_value("a b").is_err());
        assert_eq!("auto_join".parse::<SettingKey>().unwrap(), SettingKey::AutoJoin);
        assert!("volume".parse::<SettingKey>().is_err());
    }

    #[tokio::test]
    async fn user_voice_overrides() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.user_voice(5).await.unwrap(), None);
        store.set_user_voice(5, Some("3".into())).await.unwrap();
        assert_eq!(store.user_voice(5).await.unwrap().as_deref(), Some("3"));
        store.set_user_voice(5, None).await.unwrap();
        assert_eq!(store.user_voice(5).await.unwrap(), None);
    }
}
