use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Client as HttpClient;
use serenity::cache::Cache;
use serenity::gateway::ShardManager;
use serenity::prelude::{Context, TypeMapKey};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::Config;
use crate::listeners::{SerenityShards, ShardRpc};
use crate::presence::{PresenceSink, PresenceUpdater, ShardPresence};
use crate::radio::RadioState;
use crate::settings::Settings;
use crate::stream_status::StreamStatus;
use crate::task::TaskHandle;
use crate::voice::VoiceManager;
use crate::websocket_manager::{TungsteniteConnector, WebsocketManager};

/// Everything the event handler and the commands share.
pub struct Bot {
    pub config: Config,
    pub radio: Arc<RadioState>,
    pub settings: Arc<Settings>,
    pub voice: Arc<VoiceManager>,
    http: HttpClient,
    refresh: Arc<Notify>,
    tasks: Mutex<Vec<TaskHandle>>,
}

pub struct BotKey;

impl TypeMapKey for BotKey {
    type Value = Arc<Bot>;
}

pub struct ShardManagerKey;

impl TypeMapKey for ShardManagerKey {
    type Value = Arc<ShardManager>;
}

pub async fn bot(ctx: &Context) -> Option<Arc<Bot>> {
    ctx.data.read().await.get::<BotKey>().cloned()
}

pub fn shard_label(shard_count: u32) -> String {
    match shard_count {
        0 | 1 => "0".into(),
        n => format!("0-{}", n - 1),
    }
}

impl Bot {
    pub fn new(
        config: Config,
        settings: Arc<Settings>,
        voice: Arc<VoiceManager>,
        http: HttpClient,
    ) -> Self {
        let radio = Arc::new(RadioState::new());
        // the activity itself is set on every shard by the client builder
        radio.set_custom_presence(config.custom_presence.is_some());

        Self {
            config,
            radio,
            settings,
            voice,
            http,
            refresh: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts the feed client, the presence cycle and the stream poll.
    pub fn start(&self, cache: Arc<Cache>, shard_manager: Arc<ShardManager>) {
        let shards: Arc<dyn ShardRpc> =
            Arc::new(SerenityShards::new(cache.clone(), self.voice.clone()));
        let sink: Arc<dyn PresenceSink> = Arc::new(ShardPresence::new(shard_manager));
        let label = shard_label(cache.shard_count());
        self.voice.set_shard(label.clone());

        let mut tasks = Vec::new();

        let websocket = WebsocketManager::new(
            Arc::new(TungsteniteConnector::new(self.config.stream_info.clone())),
            self.radio.clone(),
            shards.clone(),
            self.refresh.clone(),
            label.clone(),
        );
        tasks.push(Arc::new(websocket).spawn());

        tasks.push(
            PresenceUpdater::new(
                self.radio.clone(),
                shards,
                sink,
                self.config.twitch_url(),
                self.refresh.clone(),
                label.clone(),
            )
            .spawn(),
        );

        match &self.config.twitch_client_id {
            Some(client_id) => tasks.push(
                StreamStatus::new(
                    self.http.clone(),
                    &self.config.twitch_channel,
                    client_id,
                    label,
                )
                .spawn(self.radio.clone()),
            ),
            None => info!("No TWITCH_CLIENT_ID set, stream status polling disabled"),
        }

        self.tasks.lock().extend(tasks);
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            if task.is_finished() {
                warn!("The {} task had already stopped", task.name());
            }
            task.cancel();
        }
    }
}
