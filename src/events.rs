use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serenity::all::{ConnectionStage, ShardStageUpdateEvent};
use serenity::async_trait;
use serenity::builder::{CreateEmbed, CreateMessage};
use serenity::model::event::ResumedEvent;
use serenity::model::gateway::Ready;
use serenity::model::guild::{Guild, UnavailableGuild};
use serenity::prelude::{Context, EventHandler};
use tracing::{error, info, warn};

use crate::bot::{Bot, ShardManagerKey};
use crate::commands::EMBED_COLOUR;

pub struct Handler {
    bot: Arc<Bot>,
    started: AtomicBool,
}

impl Handler {
    pub fn new(bot: Arc<Bot>) -> Self {
        Self {
            bot,
            started: AtomicBool::new(false),
        }
    }
}

pub fn welcome_text(prefix: &str) -> String {
    format!(
        "**LISTEN.moe discord bot**\n\
        **Usage:**\n\
        After adding me to your server, join a voice channel and type `{prefix}join` to bind me to that voice channel. \
        Keep in mind that you need to have the `Manage Server` permission to use this command.\n\
        **Commands:**\n\
        **{prefix}join**: Type this while in a voice channel to have the bot join that channel and start playing there. Limited to users with the \"manage server\" permission.\n\
        **{prefix}leave**: Makes the bot leave the voice channel it's currently in.\n\
        **{prefix}np**: Gets the currently playing song and artist. If the song was requested by someone, also gives their name.\n\
        **{prefix}ignore**: Ignores commands in the current channel. Admin commands are exempt from the ignore.\n\
        **{prefix}unignore**: Unignores commands in the current channel.\n\
        **{prefix}ignore all**: Ignores commands in all channels on the guild.\n\
        **{prefix}unignore all**: Unignores all channels on the guild.\n\
        **{prefix}prefix !** Adds a custom prefix for this server, `{prefix}` keeps working alongside it. Prefixes cannot contain whitespace, letters, or numbers - anything else is fair game. \
        It's recommended that you stick with the default prefix of {prefix}, but this command is provided in case you find conflicts with other bots."
    )
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(
            "Client ready... Logged in as {} ({})",
            ready.user.tag(),
            ready.user.id
        );

        // ready fires once per shard, the background loops are process wide
        if !self.started.swap(true, Ordering::SeqCst) {
            let shard_manager = ctx.data.read().await.get::<ShardManagerKey>().cloned();
            match shard_manager {
                Some(shard_manager) => self.bot.start(ctx.cache.clone(), shard_manager),
                None => error!("Shard manager missing from the type map, relay not started"),
            }
        }

        // each shard rejoins the stored channels of its own guilds
        let guilds = ready.guilds.iter().map(|guild| guild.id).collect::<Vec<_>>();
        info!(
            "[SHARD: {}] Rejoining voice in {} guilds",
            ctx.shard_id.0,
            guilds.len()
        );
        self.bot.voice.setup_guilds(guilds).await;
    }

    async fn resume(&self, _ctx: Context, _resumed: ResumedEvent) {
        warn!("Reconnecting...");
    }

    async fn shard_stage_update(&self, _ctx: Context, event: ShardStageUpdateEvent) {
        if event.new == ConnectionStage::Disconnected {
            warn!("[SHARD: {}] Disconnected!", event.shard_id.0);
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, is_new: Option<bool>) {
        if is_new != Some(true) {
            return;
        }
        info!("Joined guild {} ({})", guild.name, guild.id);

        let Some(channel_id) = guild.system_channel_id else {
            return;
        };

        let embed = CreateEmbed::new()
            .colour(EMBED_COLOUR)
            .description(welcome_text(&self.bot.config.prefix));
        if let Err(why) = channel_id
            .send_message(&ctx.http, CreateMessage::new().embed(embed))
            .await
        {
            warn!("Cannot send welcome message to {}: {why}", guild.id);
        }
    }

    async fn guild_delete(
        &self,
        _ctx: Context,
        incomplete: UnavailableGuild,
        _full: Option<Guild>,
    ) {
        // an unavailable guild is an outage, not a removal
        if incomplete.unavailable {
            return;
        }

        info!("Removed from guild {}", incomplete.id);
        if let Err(why) = self.bot.settings.clear(incomplete.id) {
            warn!("Cannot clear settings for {}: {why}", incomplete.id);
        }
    }
}
