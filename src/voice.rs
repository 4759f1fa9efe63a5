use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use reqwest::Client as HttpClient;
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use serenity::prelude::Mutex as AsyncMutex;
use songbird::input::HttpRequest;
use songbird::tracks::{PlayMode, Track, TrackHandle};
use songbird::{Call, CoreEvent, Event, EventContext, Songbird, TrackEvent};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::settings::{Settings, VOICE_CHANNEL};

const RESTART_DELAY: Duration = Duration::from_millis(3000);

/// The radio's HTTP audio stream.
#[derive(Clone)]
struct StreamSource {
    http: HttpClient,
    url: String,
}

impl StreamSource {
    /// Replaces whatever the call is playing with a fresh stream, restarted
    /// whenever it runs out.
    fn play(
        &self,
        handler: &mut Call,
        handler_lock: Arc<AsyncMutex<Call>>,
        shard: &str,
    ) -> TrackHandle {
        let source = HttpRequest::new(self.http.clone(), self.url.clone());
        let audio = Track::from(source);
        let audio_handle = handler.play_only(audio);

        audio_handle
            .add_event(
                Event::Track(TrackEvent::End),
                StreamEndNotifier {
                    handler_lock,
                    source: self.clone(),
                    shard: shard.to_string(),
                },
            )
            .ok();

        audio_handle
    }
}

/// Relays the radio stream into every voice channel the bot is bound to.
pub struct VoiceManager {
    songbird: Arc<Songbird>,
    source: StreamSource,
    settings: Arc<Settings>,
    connections: Arc<Mutex<HashMap<GuildId, ChannelId>>>,
    shard: RwLock<String>,
}

impl VoiceManager {
    pub fn new(
        songbird: Arc<Songbird>,
        http: HttpClient,
        stream: impl Into<String>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            songbird,
            source: StreamSource {
                http,
                url: stream.into(),
            },
            settings,
            connections: Arc::new(Mutex::new(HashMap::new())),
            shard: RwLock::new("0".into()),
        }
    }

    pub fn set_shard(&self, label: impl Into<String>) {
        *self.shard.write() = label.into();
    }

    fn shard(&self) -> String {
        self.shard.read().clone()
    }

    /// Calls currently receiving the stream.
    pub fn live_channels(&self) -> Vec<(GuildId, ChannelId)> {
        self.connections
            .lock()
            .iter()
            .map(|(guild_id, channel_id)| (*guild_id, *channel_id))
            .collect()
    }

    pub fn is_live(&self, guild_id: GuildId) -> bool {
        self.connections.lock().contains_key(&guild_id)
    }

    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<()> {
        let shard = self.shard();
        let handler_lock = self
            .songbird
            .join(guild_id, channel_id)
            .await
            .map_err(|why| {
                Error::Voice(format!("Could not join {channel_id} in {guild_id}: {why}"))
            })?;

        {
            let mut handler = handler_lock.lock().await;
            if let Err(why) = handler.deafen(true).await {
                warn!(shard = %shard, "VOICE: Could not deafen in {guild_id}: {why}");
            }

            let audio_handle = self.source.play(&mut handler, handler_lock.clone(), &shard);

            handler.remove_all_global_events();
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DriverDisconnectNotifier {
                    audio_handle,
                    guild_id,
                    connections: self.connections.clone(),
                    shard: shard.clone(),
                },
            );
        }

        self.connections.lock().insert(guild_id, channel_id);
        self.settings.set(guild_id, VOICE_CHANNEL, channel_id)?;
        info!(shard = %shard, "VOICE: Streaming to {channel_id} in {guild_id}");
        Ok(())
    }

    /// Leaves voice and forgets the bound channel. Returns whether a call existed.
    pub async fn leave(&self, guild_id: GuildId) -> Result<bool> {
        self.settings.remove(guild_id, VOICE_CHANNEL)?;
        self.connections.lock().remove(&guild_id);

        match self.songbird.remove(guild_id).await {
            Ok(()) => {
                info!(shard = %self.shard(), "VOICE: Left voice in {guild_id}");
                Ok(true)
            }
            Err(songbird::error::JoinError::NoCall) => Ok(false),
            Err(why) => Err(Error::Voice(format!("Could not leave {guild_id}: {why}"))),
        }
    }

    /// Rejoins the channels stored for the given guilds, skipping calls that
    /// are already live. Failures are logged and not retried.
    pub async fn setup_guilds(&self, guilds: impl IntoIterator<Item = GuildId>) -> usize {
        let mut joined = 0;

        for guild_id in guilds {
            if self.is_live(guild_id) {
                continue;
            }
            let Some(channel_id) = self.settings.voice_channel(guild_id) else {
                continue;
            };

            match self.join(guild_id, channel_id).await {
                Ok(()) => joined += 1,
                Err(why) => error!(shard = %self.shard(), "VOICE: {why}"),
            }
        }

        info!(shard = %self.shard(), "VOICE: Rejoined {joined} voice channels");
        joined
    }
}

struct StreamEndNotifier {
    handler_lock: Arc<AsyncMutex<Call>>,
    source: StreamSource,
    shard: String,
}

#[async_trait]
impl songbird::events::EventHandler for StreamEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::Track(tracks) = ctx else {
            return None;
        };

        // a deliberate stop must not bring the stream back
        let ran_out = tracks
            .iter()
            .any(|(state, _)| matches!(state.playing, PlayMode::End | PlayMode::Errored(_)));
        if ran_out {
            warn!(
                shard = %self.shard,
                "VOICE: Audio stream ended, restarting in {RESTART_DELAY:?}"
            );
            tokio::time::sleep(RESTART_DELAY).await;
            let mut handler = self.handler_lock.lock().await;
            self.source
                .play(&mut handler, self.handler_lock.clone(), &self.shard);
        }

        None
    }
}

struct DriverDisconnectNotifier {
    audio_handle: TrackHandle,
    guild_id: GuildId,
    connections: Arc<Mutex<HashMap<GuildId, ChannelId>>>,
    shard: String,
}

#[async_trait]
impl songbird::events::EventHandler for DriverDisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(_data) = ctx {
            warn!(shard = %self.shard, "VOICE: Driver disconnected in {}", self.guild_id);
            self.audio_handle.stop().ok();
            self.connections.lock().remove(&self.guild_id);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice() -> (tempfile::TempDir, Arc<Settings>, VoiceManager) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings::open(dir.path().join("settings.json")).unwrap());
        let voice = VoiceManager::new(
            Songbird::serenity(),
            HttpClient::new(),
            "https://listen.moe/stream",
            settings.clone(),
        );
        (dir, settings, voice)
    }

    #[tokio::test]
    async fn leave_without_a_call_forgets_the_channel() {
        let (_dir, settings, voice) = voice();
        let guild = GuildId::new(3);
        settings.set(guild, VOICE_CHANNEL, ChannelId::new(4)).unwrap();

        assert!(!voice.leave(guild).await.unwrap());
        assert_eq!(settings.voice_channel(guild), None);
        assert!(voice.live_channels().is_empty());
    }

    #[tokio::test]
    async fn setup_skips_guilds_without_a_bound_channel() {
        let (_dir, _settings, voice) = voice();

        let joined = voice
            .setup_guilds([GuildId::new(1), GuildId::new(2)])
            .await;

        assert_eq!(joined, 0);
        assert!(voice.live_channels().is_empty());
    }

    #[tokio::test]
    async fn setup_skips_calls_already_live() {
        let (_dir, settings, voice) = voice();
        let guild = GuildId::new(5);
        let channel = ChannelId::new(50);
        settings.set(guild, VOICE_CHANNEL, channel).unwrap();
        voice.connections.lock().insert(guild, channel);

        assert_eq!(voice.setup_guilds([guild]).await, 0);
        assert_eq!(voice.live_channels(), vec![(guild, channel)]);
        assert!(voice.is_live(guild));
    }

    #[tokio::test]
    async fn leave_drops_the_live_call() {
        let (_dir, _settings, voice) = voice();
        let guild = GuildId::new(6);
        voice.connections.lock().insert(guild, ChannelId::new(60));

        voice.leave(guild).await.unwrap();

        assert!(!voice.is_live(guild));
    }
}
