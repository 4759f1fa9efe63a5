use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::gateway::{ActivityData, ShardManager};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::listeners::{count_guilds, ShardRpc};
use crate::radio::{NowPlaying, RadioState};
use crate::task::TaskHandle;

/// Delay between the server-count presence and the song presence.
pub const SONG_DELAY: Duration = Duration::from_millis(10_000);
/// Delay between the song presence and the next server-count presence.
pub const SERVER_COUNT_DELAY: Duration = Duration::from_millis(20_000);

pub const LOADING_TEXT: &str = "Loading data...";

/// The platform presence API.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn set_presence(&self, text: &str, stream_url: Option<&str>) -> Result<()>;
}

/// Pushes the activity to every shard this process runs.
pub struct ShardPresence {
    shard_manager: Arc<ShardManager>,
}

impl ShardPresence {
    pub fn new(shard_manager: Arc<ShardManager>) -> Self {
        Self { shard_manager }
    }
}

#[async_trait]
impl PresenceSink for ShardPresence {
    async fn set_presence(&self, text: &str, stream_url: Option<&str>) -> Result<()> {
        let activity = match stream_url {
            Some(url) => ActivityData::streaming(text, url)?,
            None => ActivityData::playing(text),
        };

        let runners = self.shard_manager.runners.lock().await;
        for runner in runners.values() {
            runner.runner_tx.set_activity(Some(activity.clone()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ServerCount,
    Song,
}

#[derive(Debug)]
pub enum PresenceOutcome {
    Pushed(String),
    /// A custom presence is active, nothing was pushed.
    Overridden,
    Failed(Error),
}

pub fn server_count_text(discord_listeners: u64, guilds: u64) -> String {
    format!("for {discord_listeners} on {guilds} servers")
}

pub fn song_text(now_playing: Option<&NowPlaying>) -> String {
    match now_playing {
        Some(np) => format!("{} - {}", np.artist_name, np.song_name),
        None => LOADING_TEXT.into(),
    }
}

/// Alternates the bot presence between the server count and the current song.
pub struct PresenceUpdater {
    radio: Arc<RadioState>,
    shards: Arc<dyn ShardRpc>,
    sink: Arc<dyn PresenceSink>,
    stream_url: String,
    refresh: Arc<Notify>,
    shard: String,
    phase: Phase,
}

impl PresenceUpdater {
    pub fn new(
        radio: Arc<RadioState>,
        shards: Arc<dyn ShardRpc>,
        sink: Arc<dyn PresenceSink>,
        stream_url: String,
        refresh: Arc<Notify>,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            radio,
            shards,
            sink,
            stream_url,
            refresh,
            shard: shard.into(),
            phase: Phase::ServerCount,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs the current phase and moves to the next one, returning how long to
    /// wait before the next step.
    pub async fn step(&mut self) -> (PresenceOutcome, Duration) {
        match self.phase {
            Phase::ServerCount => {
                let outcome = self.server_count().await;
                self.phase = Phase::Song;
                (outcome, SONG_DELAY)
            }
            Phase::Song => {
                let outcome = self.song().await;
                self.phase = Phase::ServerCount;
                (outcome, SERVER_COUNT_DELAY)
            }
        }
    }

    async fn server_count(&self) -> PresenceOutcome {
        if self.radio.custom_presence() {
            return PresenceOutcome::Overridden;
        }

        // no listener count exists until the first record arrives
        let Some(now_playing) = self.radio.now_playing() else {
            return self.push(LOADING_TEXT.into()).await;
        };
        let guilds = match count_guilds(self.shards.as_ref()).await {
            Ok(guilds) => guilds,
            Err(why) => return PresenceOutcome::Failed(why),
        };

        self.push(server_count_text(now_playing.discord_listeners, guilds)).await
    }

    async fn song(&self) -> PresenceOutcome {
        if self.radio.custom_presence() {
            return PresenceOutcome::Overridden;
        }

        let now_playing = self.radio.now_playing();
        self.push(song_text(now_playing.as_deref())).await
    }

    async fn push(&self, text: String) -> PresenceOutcome {
        let url = self.radio.streaming().then_some(self.stream_url.as_str());

        match self.sink.set_presence(&text, url).await {
            Ok(()) => PresenceOutcome::Pushed(text),
            Err(why) => PresenceOutcome::Failed(why),
        }
    }

    /// Waits for the first refresh, then cycles forever. Every further refresh
    /// restarts the cycle at the server-count phase.
    pub async fn run(mut self) {
        let refresh = self.refresh.clone();
        refresh.notified().await;
        info!(shard = %self.shard, "PRESENCE: Cycle started");

        loop {
            let phase = self.phase();
            let (outcome, delay) = self.step().await;
            match outcome {
                PresenceOutcome::Pushed(text) => {
                    debug!(shard = %self.shard, ?phase, "PRESENCE: Set to {text:?}")
                }
                PresenceOutcome::Overridden => {}
                PresenceOutcome::Failed(why) => {
                    warn!(shard = %self.shard, ?phase, "PRESENCE: Update failed: {why}")
                }
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = refresh.notified() => self.phase = Phase::ServerCount,
            }
        }
    }

    pub fn spawn(self) -> TaskHandle {
        TaskHandle::spawn("presence", self.run())
    }
}
