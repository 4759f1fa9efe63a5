use std::collections::HashSet;
use std::sync::Arc;

use serenity::builder::{CreateEmbed, CreateMessage};
use serenity::framework::standard::macros::{command, group, help, hook};
use serenity::framework::standard::{
    help_commands, Args, CommandGroup, CommandResult, Configuration, DispatchError, HelpOptions,
    StandardFramework,
};
use serenity::model::channel::{ChannelType, Message};
use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::prelude::Context;
use tracing::{error, info, warn};

use crate::bot::{bot, Bot};
use crate::config::{Config, DEFAULT_PREFIX};
use crate::presence::LOADING_TEXT;
use crate::radio::NowPlaying;
use crate::settings::{self, Settings};

pub const EMBED_COLOUR: u32 = 15473237;

/// Commands that still work in ignored channels.
const ADMIN_COMMANDS: &[&str] = &["ignore", "unignore", "prefix"];

#[group]
#[commands(join, leave, np)]
struct Listen;

#[group]
#[commands(ignore, unignore, change_prefix, ping)]
struct Util;

pub fn framework(config: &Config) -> StandardFramework {
    let framework = StandardFramework::new()
        .before(before)
        .after(after)
        .on_dispatch_error(dispatch_error)
        .help(&HELP)
        .group(&LISTEN_GROUP)
        .group(&UTIL_GROUP);

    framework.configure(
        Configuration::new()
            .prefix(config.prefix.clone())
            .dynamic_prefix(dynamic_prefix)
            .owners(config.owners.clone())
            .case_insensitivity(true),
    );

    framework
}

async fn shared(ctx: &Context) -> Result<Arc<Bot>, &'static str> {
    bot(ctx).await.ok_or("Bot state missing from the type map")
}

#[hook]
async fn dynamic_prefix(ctx: &Context, msg: &Message) -> Option<String> {
    let guild_id = msg.guild_id?;
    bot(ctx).await?.settings.prefix(guild_id)
}

pub fn is_blocked(
    settings: &Settings,
    guild_id: GuildId,
    channel_id: ChannelId,
    command: &str,
) -> bool {
    !ADMIN_COMMANDS.contains(&command) && settings.is_ignored(guild_id, channel_id)
}

#[hook]
async fn before(ctx: &Context, msg: &Message, command_name: &str) -> bool {
    let (Some(guild_id), Some(bot)) = (msg.guild_id, bot(ctx).await) else {
        return true;
    };

    if is_blocked(&bot.settings, guild_id, msg.channel_id, command_name) {
        info!(
            "Command {command_name} blocked; User {} ({}): channel {} is ignored",
            msg.author.tag(),
            msg.author.id,
            msg.channel_id
        );
        return false;
    }
    true
}

#[hook]
async fn after(_ctx: &Context, msg: &Message, command_name: &str, command_result: CommandResult) {
    let location = msg
        .guild_id
        .map(|g| format!("guild {g}"))
        .unwrap_or_else(|| "DM".into());

    match command_result {
        Ok(()) => info!(
            "{} ({}) > {location} >> {command_name}",
            msg.author.tag(),
            msg.author.id
        ),
        Err(why) => error!("Error in command {command_name}: {why:?}"),
    }
}

#[hook]
async fn dispatch_error(ctx: &Context, msg: &Message, error: DispatchError, command_name: &str) {
    info!(
        "Command {command_name} blocked; User {} ({}): {error:?}",
        msg.author.tag(),
        msg.author.id
    );

    let reply = match error {
        DispatchError::LackingPermissions(_) => {
            "You need the `Manage Server` permission to use this command."
        }
        DispatchError::OnlyForGuilds => "This command can only be used in a server.",
        _ => return,
    };
    if let Err(why) = msg.reply(ctx, reply).await {
        warn!("Cannot reply to {}: {why}", msg.channel_id);
    }
}

#[help]
async fn help(
    ctx: &Context,
    msg: &Message,
    args: Args,
    help_options: &'static HelpOptions,
    groups: &[&'static CommandGroup],
    owners: HashSet<UserId>,
) -> CommandResult {
    if let Err(why) =
        help_commands::with_embeds(ctx, msg, args, help_options, groups, owners).await
    {
        warn!("Cannot send help to {}: {why}", msg.channel_id);
    }
    Ok(())
}

#[command]
#[only_in(guilds)]
#[required_permissions("MANAGE_GUILD")]
#[description = "Joins your voice channel and starts playing there."]
async fn join(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = msg.guild_id.ok_or("Not in a guild")?;
    let channel_id = ctx.cache.guild(guild_id).and_then(|guild| {
        guild
            .voice_states
            .get(&msg.author.id)
            .and_then(|voice_state| voice_state.channel_id)
    });

    let Some(channel_id) = channel_id else {
        msg.reply(ctx, "You need to be in a voice channel first.").await?;
        return Ok(());
    };

    shared(ctx).await?.voice.join(guild_id, channel_id).await?;
    msg.reply(ctx, format!("Now streaming in <#{channel_id}>.")).await?;
    Ok(())
}

#[command]
#[only_in(guilds)]
#[required_permissions("MANAGE_GUILD")]
#[description = "Leaves the voice channel."]
async fn leave(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = msg.guild_id.ok_or("Not in a guild")?;

    let content = if shared(ctx).await?.voice.leave(guild_id).await? {
        "Left the voice channel."
    } else {
        "I'm not in a voice channel."
    };
    msg.reply(ctx, content).await?;
    Ok(())
}

pub fn now_playing_text(np: &NowPlaying) -> String {
    let mut text = format!("**Now playing:** {} **by** {}", np.song_name, np.artist_name);

    if let Some(anime) = np.anime_name.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(&format!("\n**Anime:** {anime}"));
    }
    if let Some(requester) = np.requested_by.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(&format!("\n**Requested by:** {requester}"));
    }
    text.push_str(&format!(
        "\n**Listeners:** {} on the radio, {} on Discord",
        np.listeners, np.discord_listeners
    ));

    text
}

#[command]
#[aliases("nowplaying")]
#[description = "Shows the current song and artist, and who requested it."]
async fn np(ctx: &Context, msg: &Message) -> CommandResult {
    let description = match shared(ctx).await?.radio.now_playing() {
        Some(np) => now_playing_text(&np),
        None => LOADING_TEXT.into(),
    };

    let embed = CreateEmbed::new().colour(EMBED_COLOUR).description(description);
    msg.channel_id
        .send_message(ctx, CreateMessage::new().embed(embed))
        .await?;
    Ok(())
}

fn wants_all(args: &Args) -> bool {
    args.current().is_some_and(|arg| arg.eq_ignore_ascii_case("all"))
}

fn text_channels(ctx: &Context, guild_id: GuildId) -> Vec<ChannelId> {
    ctx.cache
        .guild(guild_id)
        .map(|guild| {
            guild
                .channels
                .values()
                .filter(|channel| channel.kind == ChannelType::Text)
                .map(|channel| channel.id)
                .collect()
        })
        .unwrap_or_default()
}

/// Adds channels to the ignore list, returning how many were new.
pub fn add_ignored(ignored: &mut Vec<ChannelId>, channels: &[ChannelId]) -> usize {
    let before = ignored.len();
    for channel in channels {
        if !ignored.contains(channel) {
            ignored.push(*channel);
        }
    }
    ignored.len() - before
}

/// Removes channels from the ignore list, returning how many were dropped.
pub fn remove_ignored(ignored: &mut Vec<ChannelId>, channels: &[ChannelId]) -> usize {
    let before = ignored.len();
    ignored.retain(|channel| !channels.contains(channel));
    before - ignored.len()
}

#[command]
#[only_in(guilds)]
#[required_permissions("MANAGE_GUILD")]
#[usage = "[all]"]
#[description = "Ignores commands in this channel, or in every channel with `all`. Admin commands are exempt."]
async fn ignore(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let guild_id = msg.guild_id.ok_or("Not in a guild")?;
    let bot = shared(ctx).await?;
    let all = wants_all(&args);

    let channels = if all {
        text_channels(ctx, guild_id)
    } else {
        vec![msg.channel_id]
    };

    let mut ignored = bot.settings.ignored_channels(guild_id);
    let added = add_ignored(&mut ignored, &channels);
    bot.settings.set(guild_id, settings::IGNORED_CHANNELS, &ignored)?;

    let content = match (all, added) {
        (true, _) => "Now ignoring commands in all channels on this server.".to_string(),
        (false, 0) => "This channel is already ignored.".to_string(),
        (false, _) => "Now ignoring commands in this channel.".to_string(),
    };
    msg.reply(ctx, content).await?;
    Ok(())
}

#[command]
#[only_in(guilds)]
#[required_permissions("MANAGE_GUILD")]
#[usage = "[all]"]
#[description = "Stops ignoring commands in this channel, or in every channel with `all`."]
async fn unignore(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let guild_id = msg.guild_id.ok_or("Not in a guild")?;
    let bot = shared(ctx).await?;

    let content = if wants_all(&args) {
        bot.settings.remove(guild_id, settings::IGNORED_CHANNELS)?;
        "No longer ignoring commands in any channel on this server."
    } else {
        let mut ignored = bot.settings.ignored_channels(guild_id);
        if remove_ignored(&mut ignored, &[msg.channel_id]) == 0 {
            "This channel isn't ignored."
        } else {
            bot.settings.set(guild_id, settings::IGNORED_CHANNELS, &ignored)?;
            "No longer ignoring commands in this channel."
        }
    };
    msg.reply(ctx, content).await?;
    Ok(())
}

/// The default prefix keeps working next to a server's custom one.
pub fn prefix_changed_text(prefix: &str, default: &str) -> String {
    format!("Changed the prefix to `{prefix}`. The default `{default}` still works too.")
}

/// Prefixes may not contain whitespace, letters or digits.
pub fn valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty() && !prefix.chars().any(|c| c.is_whitespace() || c.is_alphanumeric())
}

#[command("prefix")]
#[only_in(guilds)]
#[required_permissions("MANAGE_GUILD")]
#[usage = "<prefix|default>"]
#[description = "Shows or changes the command prefix for this server."]
async fn change_prefix(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = msg.guild_id.ok_or("Not in a guild")?;
    let bot = shared(ctx).await?;
    let default = bot.config.prefix.as_str();

    let content = match args.single::<String>().ok() {
        None => {
            let current = bot.settings.prefix(guild_id);
            format!("The prefix is `{}`.", current.as_deref().unwrap_or(default))
        }
        Some(prefix) if prefix.eq_ignore_ascii_case("default") => {
            bot.settings.remove(guild_id, settings::PREFIX)?;
            format!("Reset the prefix to `{default}`.")
        }
        Some(prefix) if valid_prefix(&prefix) => {
            bot.settings.set(guild_id, settings::PREFIX, &prefix)?;
            info!("Prefix changed to {prefix} in guild {guild_id}");
            prefix_changed_text(&prefix, default)
        }
        Some(_) => format!(
            "Prefixes cannot contain whitespace, letters, or numbers. The default `{DEFAULT_PREFIX}` is recommended."
        ),
    };
    msg.reply(ctx, content).await?;
    Ok(())
}

#[command]
#[description = "Checks that the bot is alive."]
async fn ping(ctx: &Context, msg: &Message) -> CommandResult {
    msg.reply(ctx, "Pong!").await?;
    Ok(())
}
