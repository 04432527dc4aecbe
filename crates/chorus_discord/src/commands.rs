//! Prefix commands understood by the worker

use chorus_core::settings::{GuildSettings, SettingKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// Join the author's voice channel
    Join,
    Leave,
    /// Drop everything queued or playing in this guild
    Skip,
    Set { key: SettingKey, value: String },
    Settings,
    /// Set the author's voice, or reset it with `None`
    Voice(Option<String>),
    /// Guild and voice totals across every cluster
    Stats,
    Help,
    Unknown(String),
    /// Known command with missing arguments
    Usage(&'static str),
}

/// Parse `content` as a command if it starts with `prefix`.
pub fn parse_command(content: &str, prefix: &str) -> Option<BotCommand> {
    if prefix.is_empty() {
        return None;
    }
    let rest = content.strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let name = words.next()?.to_lowercase();

    let command = match name.as_str() {
        "join" => BotCommand::Join,
        "leave" => BotCommand::Leave,
        "skip" | "clear" => BotCommand::Skip,
        "settings" => BotCommand::Settings,
        "stats" | "botstats" => BotCommand::Stats,
        "help" => BotCommand::Help,
        "voice" => match words.next() {
            None => BotCommand::Usage("voice <speaker id | reset>"),
            Some("reset") => BotCommand::Voice(None),
            Some(voice) => BotCommand::Voice(Some(voice.to_string())),
        },
        "set" => {
            let (Some(key), Some(first)) = (words.next(), words.next()) else {
                return Some(BotCommand::Usage("set <setting> <value>"));
            };
            match key.parse() {
                Ok(key) => {
                    let value = std::iter::once(first).chain(words).collect::<Vec<_>>().join(" ");
                    BotCommand::Set { key, value }
                }
                Err(_) => BotCommand::Unknown(format!("set {key}")),
            }
        }
        other => BotCommand::Unknown(other.to_string()),
    };
    Some(command)
}

pub fn render_settings(settings: &GuildSettings) -> String {
    let channel = settings
        .channel
        .map(|id| format!("<#{id}>"))
        .unwrap_or_else(|| "not set".to_string());
    let on_off = |flag: bool| if flag { "on" } else { "off" };
    let repeated = match settings.repeated_chars {
        0 => "off".to_string(),
        n => n.to_string(),
    };

    format!(
        "**Settings**\n\
         channel: {channel}\n\
         prefix: `{}`\n\
         xsaid: {}\n\
         auto_join: {}\n\
         bot_ignore: {}\n\
         msg_length: {}s\n\
         repeated_chars: {repeated}\n\
         voice: {}",
        settings.prefix,
        on_off(settings.xsaid),
        on_off(settings.auto_join),
        on_off(settings.bot_ignore),
        settings.msg_length,
        settings.voice,
    )
}

pub fn help_text(prefix: &str) -> String {
    let keys = SettingKey::ALL
        .iter()
        .map(|key| key.name())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "`{prefix}join` `{prefix}leave` `{prefix}skip` `{prefix}settings` `{prefix}stats`\n\
         `{prefix}voice <speaker id | reset>`\n\
         `{prefix}set <setting> <value>` where setting is one of: {keys}"
    )
}
