use std::error::Error;
use std::sync::Arc;

use dotenvy::dotenv;
use reqwest::Client as HttpClient;
use serenity::gateway::ActivityData;
use serenity::prelude::*;
use songbird::serenity::SerenityInit;
use songbird::Songbird;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod bot;
mod commands;
mod config;
mod error;
mod events;
mod listeners;
mod presence;
mod radio;
mod settings;
mod stream_status;
mod task;
mod voice;
mod websocket_manager;

use bot::{Bot, BotKey, ShardManagerKey};
use config::Config;
use events::Handler;
use settings::Settings;
use voice::VoiceManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let settings = Arc::new(Settings::open(&config.settings_path)?);
    info!("Settings loaded from {}", settings.path().display());
    let http = HttpClient::new();
    let songbird = Songbird::serenity();
    let voice = Arc::new(VoiceManager::new(
        songbird.clone(),
        http.clone(),
        config.stream.clone(),
        settings.clone(),
    ));

    let token = config.token.clone();
    let custom_presence = config.custom_presence.clone();
    let framework = commands::framework(&config);
    let bot = Arc::new(Bot::new(config, settings, voice, http));

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut builder = Client::builder(&token, intents)
        .event_handler(Handler::new(bot.clone()))
        .framework(framework)
        .register_songbird_with(songbird)
        .type_map_insert::<BotKey>(bot.clone());

    // shards started later by the autosharder pick this up too
    if let Some(custom) = custom_presence {
        builder = builder.activity(ActivityData::playing(custom));
    }

    let mut client = builder.await?;

    let shard_manager = client.shard_manager.clone();
    client
        .data
        .write()
        .await
        .insert::<ShardManagerKey>(shard_manager.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            bot.shutdown();
            shard_manager.shutdown_all().await;
        }
    });

    // Shards reconnect on their own with exponential backoff.
    if let Err(why) = client.start_autosharded().await {
        error!("Client error: {why:?}");
    }

    Ok(())
}
