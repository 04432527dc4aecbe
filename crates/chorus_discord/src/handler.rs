//! Gateway events: guild bookkeeping, voice state, commands and speech

use std::collections::HashMap;
use std::sync::Arc;

use chorus_core::filter::MessageContext;
use chorus_core::settings::GuildSettings;
use chorus_core::{InfoKind, Target, log_error};
use serenity::async_trait;
use serenity::client::{Context, EventHandler};
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::model::guild::{Guild, UnavailableGuild};
use serenity::model::id::{GuildId, UserId};
use serenity::model::user::User;
use serenity::model::voice::VoiceState;
use songbird::Songbird;
use songbird::error::JoinError;

use crate::bus_client::BusClient;
use crate::commands::{BotCommand, help_text, parse_command, render_settings};
use crate::error::{Result, WorkerError};
use crate::speech::{IncomingMessage, Speaker};
use crate::state::ClusterState;
use crate::voice::SongbirdSink;

pub struct Handler {
    speaker: Arc<Speaker>,
    state: Arc<ClusterState>,
    bus: BusClient,
    songbird: Arc<Songbird>,
}

impl Handler {
    pub fn new(
        speaker: Arc<Speaker>,
        state: Arc<ClusterState>,
        bus: BusClient,
        songbird: Arc<Songbird>,
    ) -> Self {
        Self {
            speaker,
            state,
            bus,
            songbird,
        }
    }

    async fn join(&self, ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<String> {
        let channel_id = ctx
            .cache
            .guild(guild_id)
            .and_then(|guild| guild.voice_states.get(&user_id).and_then(|vs| vs.channel_id));
        let Some(channel_id) = channel_id else {
            return Ok("You need to be in a voice channel first".to_string());
        };

        let call = self
            .songbird
            .join(guild_id, channel_id)
            .await
            .map_err(|cause| WorkerError::Voice {
                action: "join",
                guild_id: guild_id.get(),
                cause,
            })?;
        self.speaker
            .open(guild_id.get(), Arc::new(SongbirdSink::new(call)));
        tracing::info!(guild_id = guild_id.get(), %channel_id, "Joined voice");
        Ok(format!("Joined <#{channel_id}>"))
    }

    async fn leave(&self, guild_id: GuildId) -> Result<String> {
        self.speaker.close(guild_id.get());
        match self.songbird.remove(guild_id).await {
            Ok(()) => Ok("Left the voice channel".to_string()),
            Err(JoinError::NoCall) => Ok("I'm not in a voice channel".to_string()),
            Err(cause) => Err(WorkerError::Voice {
                action: "leave",
                guild_id: guild_id.get(),
                cause,
            }),
        }
    }

    async fn stats(&self) -> Result<String> {
        let responses = self
            .bus
            .request(vec![InfoKind::GuildCount, InfoKind::VoiceCount], Target::All)
            .await?;
        let total = |kind: InfoKind| {
            responses
                .iter()
                .filter_map(|r| r.data.get(kind.key()).and_then(|v| v.as_u64()))
                .sum::<u64>()
        };
        Ok(format!(
            "{} guilds, {} voice connections across {} clusters",
            total(InfoKind::GuildCount),
            total(InfoKind::VoiceCount),
            responses.len()
        ))
    }

    async fn run_command(
        &self,
        ctx: &Context,
        msg: &Message,
        guild_id: GuildId,
        command: BotCommand,
        settings: &GuildSettings,
    ) -> Result<String> {
        let guild = guild_id.get();
        match command {
            BotCommand::Join => self.join(ctx, guild_id, msg.author.id).await,
            BotCommand::Leave => self.leave(guild_id).await,
            BotCommand::Skip => Ok(if self.speaker.skip(guild)? {
                "Skipped".to_string()
            } else {
                "Nothing to skip".to_string()
            }),
            BotCommand::Settings => Ok(render_settings(settings)),
            BotCommand::Set { key, value } => {
                let can_manage = msg
                    .author_permissions(&ctx.cache)
                    .is_some_and(|p| p.manage_guild());
                if !can_manage {
                    return Ok("You need the Manage Server permission to change settings".into());
                }
                let parsed = match key.parse_value(&value) {
                    Ok(parsed) => parsed,
                    Err(e) => return Ok(e.to_string()),
                };
                self.speaker.settings().set(guild, key, parsed).await?;
                tracing::info!(guild_id = guild, %key, %value, "Setting changed");
                Ok(format!("Set {key} to {value}"))
            }
            BotCommand::Voice(voice) => {
                let reply = match &voice {
                    Some(voice) => format!("Your voice is now {voice}"),
                    None => "Your voice was reset to the server default".to_string(),
                };
                self.speaker
                    .settings()
                    .set_user_voice(msg.author.id.get(), voice)
                    .await?;
                Ok(reply)
            }
            BotCommand::Stats => self.stats().await,
            BotCommand::Help => Ok(help_text(&settings.prefix)),
            BotCommand::Unknown(name) => Ok(format!(
                "Unknown command `{name}`, try `{}help`",
                settings.prefix
            )),
            BotCommand::Usage(usage) => Ok(format!("Usage: `{}{usage}`", settings.prefix)),
        }
    }

    async fn handle_message(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<()> {
        if msg.author.id == ctx.cache.current_user().id {
            return Ok(());
        }
        let settings = self.speaker.settings().guild_settings(guild_id.get()).await?;

        if !msg.author.bot {
            if let Some(command) = parse_command(&msg.content, &settings.prefix) {
                let reply = self
                    .run_command(ctx, msg, guild_id, command, &settings)
                    .await
                    .unwrap_or_else(|e| {
                        log_error!("Command failed", e);
                        format!("Something went wrong: {e}")
                    });
                msg.channel_id.say(&ctx.http, reply).await?;
                return Ok(());
            }
        }

        let guild = guild_id.get();
        let reads_channel = settings.channel == Some(msg.channel_id.get());
        if reads_channel && settings.auto_join && self.speaker.registry().get(guild).is_none() {
            self.join(ctx, guild_id, msg.author.id).await?;
        }

        let incoming = IncomingMessage {
            guild_id: guild,
            channel_id: msg.channel_id.get(),
            message_id: msg.id.get(),
            author_id: msg.author.id.get(),
            content: msg.content.clone(),
            context: message_context(ctx, msg, guild_id),
        };
        if let Some(text) = self.speaker.speak(incoming, &settings).await? {
            tracing::debug!(guild_id = guild, message_id = msg.id.get(), %text, "Queued speech");
        }
        Ok(())
    }
}

fn display_name(user: &User) -> String {
    user.global_name.clone().unwrap_or_else(|| user.name.clone())
}

fn message_context(ctx: &Context, msg: &Message, guild_id: GuildId) -> MessageContext {
    let mut mention_names: HashMap<u64, String> = msg
        .mentions
        .iter()
        .map(|user| (user.id.get(), display_name(user)))
        .collect();

    if let Some(guild) = ctx.cache.guild(guild_id) {
        for role_id in &msg.mention_roles {
            if let Some(role) = guild.roles.get(role_id) {
                mention_names.insert(role_id.get(), role.name.clone());
            }
        }
        for (channel_id, channel) in &guild.channels {
            if msg.content.contains(&format!("<#{channel_id}>")) {
                mention_names.insert(channel_id.get(), channel.name.clone());
            }
        }
    }

    MessageContext {
        author_name: msg
            .member
            .as_ref()
            .and_then(|member| member.nick.clone())
            .unwrap_or_else(|| display_name(&msg.author)),
        author_is_bot: msg.author.bot,
        same_author_as_last: false,
        attachment_count: msg.attachments.len(),
        mention_names,
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(
            user = %ready.user.name,
            shard = ?ready.shard,
            guilds = ready.guilds.len(),
            "Shard ready"
        );
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        self.state.guild_available(guild.id.get());
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // Outages also arrive as deletes; only forget guilds we were removed from
        if !incomplete.unavailable {
            let guild_id = incomplete.id.get();
            self.state.guild_removed(guild_id);
            self.speaker.close(guild_id);
        }
    }

    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else { return };
        let is_me = new.user_id == ctx.cache.current_user().id;

        if is_me && new.channel_id.is_none() && self.speaker.close(guild_id.get()) {
            tracing::info!(guild_id = guild_id.get(), "Disconnected from voice");
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(guild_id) = msg.guild_id else { return };
        if let Err(e) = self.handle_message(&ctx, &msg, guild_id).await {
            log_error!("Failed to handle message", e);
        }
    }
}
