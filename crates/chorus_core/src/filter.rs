//! Turns a chat message into the text that gets spoken
//!
//! Discord markup (mentions, custom emoji, links, spoilers) is rewritten into
//! something a speech engine can read, guild settings are applied, and
//! messages that shouldn't be read at all come back as [`Filtered::Ignore`].

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::settings::GuildSettings;

lazy_static! {
    static ref URL: Regex = Regex::new(r"https?://\S+").unwrap();
    static ref CUSTOM_EMOJI: Regex = Regex::new(r"<a?:(\w+):\d+>").unwrap();
    static ref MENTION: Regex = Regex::new(r"<(@!?|@&|#)(\d+)>").unwrap();
    static ref SPOILER: Regex = Regex::new(r"\|\|.+?\|\|").unwrap();
    static ref CODE_BLOCK: Regex = Regex::new(r"(?s)```.*?```").unwrap();
}

/// Everything about a message the filter needs besides its content.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub author_name: String,
    pub author_is_bot: bool,
    /// The previous spoken message in this guild came from the same author
    pub same_author_as_last: bool,
    pub attachment_count: usize,
    /// Display names for mentioned users, roles and channels, by id
    pub mention_names: HashMap<u64, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Bot,
    Command,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filtered {
    Speak(String),
    Ignore(IgnoreReason),
}

impl Filtered {
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Speak(text) => Some(text),
            Self::Ignore(_) => None,
        }
    }
}

pub fn clean_message(content: &str, ctx: &MessageContext, settings: &GuildSettings) -> Filtered {
    if ctx.author_is_bot && settings.bot_ignore {
        return Filtered::Ignore(IgnoreReason::Bot);
    }
    if !settings.prefix.is_empty() && content.starts_with(&settings.prefix) {
        return Filtered::Ignore(IgnoreReason::Command);
    }

    let text = CODE_BLOCK.replace_all(content, " a code block ");
    let text = SPOILER.replace_all(&text, " a spoiler ");
    let text = URL.replace_all(&text, " a link ");
    let text = CUSTOM_EMOJI.replace_all(&text, " emoji $1 ");
    let text = MENTION.replace_all(&text, |caps: &Captures<'_>| {
        let name = caps[2]
            .parse::<u64>()
            .ok()
            .and_then(|id| ctx.mention_names.get(&id));
        match (&caps[1], name) {
            ("#", Some(name)) => format!(" channel {name} "),
            ("#", None) => " a channel ".to_string(),
            ("@&", Some(name)) => format!(" role {name} "),
            ("@&", None) => " a role ".to_string(),
            (_, Some(name)) => format!(" {name} "),
            (_, None) => " someone ".to_string(),
        }
    });

    let mut text = collapse_whitespace(&text);
    if settings.repeated_chars > 0 {
        text = limit_repeats(&text, settings.repeated_chars as usize);
    }

    if ctx.attachment_count > 0 {
        let attachment = if ctx.attachment_count == 1 {
            "a file"
        } else {
            "some files"
        };
        text = if text.is_empty() {
            format!("sent {attachment}")
        } else {
            format!("{text} and sent {attachment}")
        };
    }

    if !text.chars().any(char::is_alphanumeric) {
        return Filtered::Ignore(IgnoreReason::Empty);
    }

    if settings.xsaid && !ctx.same_author_as_last {
        let verb = if ctx.attachment_count > 0 && text.starts_with("sent ") {
            ""
        } else {
            " said:"
        };
        text = format!("{}{verb} {text}", ctx.author_name);
    }

    Filtered::Speak(text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut runs of one character down to `max` repetitions.
fn limit_repeats(text: &str, max: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = None;
    let mut run = 0;

    for ch in text.chars() {
        if Some(ch) == last {
            run += 1;
        } else {
            last = Some(ch);
            run = 1;
        }
        if run <= max {
            out.push(ch);
        }
    }
    out
}
