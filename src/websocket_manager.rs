use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serenity::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::listeners::{count_listeners, ShardRpc};
use crate::radio::{FeedUpdate, NowPlaying, RadioState};
use crate::task::TaskHandle;

pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    Text(String),
    Close,
    /// Pings, pongs and binary frames.
    Other,
}

pub type FeedStream = BoxStream<'static, Result<FeedFrame>>;

/// Opens connections to the metadata feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn open(&self) -> Result<FeedStream>;
}

pub struct TungsteniteConnector {
    url: String,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl FeedConnector for TungsteniteConnector {
    async fn open(&self) -> Result<FeedStream> {
        let (ws, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| Error::Timeout(self.connect_timeout))??;

        Ok(ws
            .map(|msg| match msg {
                Ok(Message::Text(text)) => Ok(FeedFrame::Text(text)),
                Ok(Message::Close(_)) => Ok(FeedFrame::Close),
                Ok(_) => Ok(FeedFrame::Other),
                Err(why) => Err(why.into()),
            })
            .boxed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What became of one inbound frame.
#[derive(Debug)]
pub enum FeedOutcome {
    /// Empty payload.
    Ignored,
    Updated(Arc<NowPlaying>),
    Malformed(serde_json::Error),
    /// The listener count could not be gathered, the record was left alone.
    ShardQueryFailed(Error),
}

/// Keeps the now-playing record in sync with the radio's metadata websocket.
pub struct WebsocketManager {
    connector: Arc<dyn FeedConnector>,
    radio: Arc<RadioState>,
    shards: Arc<dyn ShardRpc>,
    refresh: Arc<Notify>,
    shard: String,
    state: Mutex<ConnectionState>,
    reconnect_delay: Duration,
}

impl WebsocketManager {
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        radio: Arc<RadioState>,
        shards: Arc<dyn ShardRpc>,
        refresh: Arc<Notify>,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            radio,
            shards,
            refresh,
            shard: shard.into(),
            state: Mutex::new(ConnectionState::Disconnected),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Opens a fresh connection and kicks the presence cycle. The caller drops
    /// any previous stream first, so frames are only ever handled once.
    pub async fn connect(&self) -> Result<FeedStream> {
        self.set_state(ConnectionState::Connecting);

        match self.connector.open().await {
            Ok(stream) => {
                self.set_state(ConnectionState::Connected);
                info!(shard = %self.shard, "WEBSOCKET: Connection A-OK!");
                self.refresh.notify_one();
                Ok(stream)
            }
            Err(why) => {
                self.set_state(ConnectionState::Disconnected);
                Err(why)
            }
        }
    }

    pub async fn handle_message(&self, payload: &str) -> FeedOutcome {
        if payload.trim().is_empty() {
            return FeedOutcome::Ignored;
        }

        let update = match FeedUpdate::parse(payload) {
            Ok(update) => update,
            Err(why) => return FeedOutcome::Malformed(why),
        };

        let discord_listeners = match count_listeners(self.shards.as_ref()).await {
            Ok(listeners) => listeners,
            Err(why) => return FeedOutcome::ShardQueryFailed(why),
        };

        FeedOutcome::Updated(
            self.radio
                .replace_now_playing(update.into_now_playing(discord_listeners)),
        )
    }

    /// Handles frames until the connection closes or errors.
    async fn listen(&self, mut stream: FeedStream) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(FeedFrame::Text(payload)) => match self.handle_message(&payload).await {
                    FeedOutcome::Ignored => {}
                    FeedOutcome::Updated(np) => debug!(
                        shard = %self.shard,
                        "WEBSOCKET: {} - {}", np.artist_name, np.song_name
                    ),
                    FeedOutcome::Malformed(why) => {
                        error!(shard = %self.shard, "WEBSOCKET: Malformed frame: {why}")
                    }
                    FeedOutcome::ShardQueryFailed(why) => {
                        error!(shard = %self.shard, "WEBSOCKET: Could not count listeners: {why}")
                    }
                },
                Ok(FeedFrame::Close) => break,
                Ok(FeedFrame::Other) => {}
                Err(why) => {
                    error!(shard = %self.shard, "WEBSOCKET: {why}");
                    break;
                }
            }
        }
    }

    /// Connects, listens, and reconnects after a fixed delay, forever.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connect().await {
                Ok(stream) => {
                    self.listen(stream).await;
                    self.set_state(ConnectionState::Disconnected);
                    warn!(shard = %self.shard, "WEBSOCKET: Connection closed, reconnecting...");
                }
                Err(why) => {
                    error!(shard = %self.shard, "WEBSOCKET: Failed to connect! {why}");
                }
            }

            sleep(self.reconnect_delay).await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> TaskHandle {
        TaskHandle::spawn("websocket", self.run())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures::stream;
    use tokio::time::Instant;

    use super::*;
    use crate::listeners::tests::FakeShards;

    const FRAME: &str = r#"{"song_name":"Kimi no Shiranai Monogatari","artist_name":"supercell","anime_name":"Bakemonogatari","listeners":512,"requested_by":"Crawl"}"#;

    enum Script {
        Fail,
        /// Frames then end of stream.
        Close(Vec<FeedFrame>),
        /// Frames then nothing, forever.
        Hang(Vec<FeedFrame>),
    }

    #[derive(Default)]
    struct ScriptedConnector {
        opens: Mutex<Vec<Instant>>,
        scripts: Mutex<VecDeque<Script>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                opens: Mutex::default(),
                scripts: Mutex::new(scripts.into()),
            }
        }

        fn opens(&self) -> Vec<Instant> {
            self.opens.lock().clone()
        }
    }

    #[async_trait]
    impl FeedConnector for ScriptedConnector {
        async fn open(&self) -> Result<FeedStream> {
            self.opens.lock().push(Instant::now());
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(Script::Hang(Vec::new()));

            match script {
                Script::Fail => Err(Error::Timeout(CONNECT_TIMEOUT)),
                Script::Close(frames) => Ok(stream::iter(frames.into_iter().map(Ok)).boxed()),
                Script::Hang(frames) => Ok(stream::iter(frames.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed()),
            }
        }
    }

    fn manager(
        connector: Arc<ScriptedConnector>,
        shards: FakeShards,
    ) -> (Arc<WebsocketManager>, Arc<RadioState>, Arc<Notify>) {
        let radio = Arc::new(RadioState::new());
        let refresh = Arc::new(Notify::new());
        let manager = WebsocketManager::new(
            connector,
            radio.clone(),
            Arc::new(shards),
            refresh.clone(),
            "0",
        );
        (Arc::new(manager), radio, refresh)
    }

    fn quiet_shards() -> FakeShards {
        FakeShards::new(Some(vec![0]), Some(vec![0]))
    }

    fn idle() -> (Arc<WebsocketManager>, Arc<RadioState>) {
        let (manager, radio, _) = manager(
            Arc::new(ScriptedConnector::default()),
            FakeShards::new(Some(vec![2, 3]), Some(vec![1])),
        );
        (manager, radio)
    }

    #[tokio::test]
    async fn well_formed_frame_replaces_record() {
        let (manager, radio) = idle();

        let outcome = manager.handle_message(FRAME).await;

        assert!(matches!(outcome, FeedOutcome::Updated(_)));
        assert_eq!(
            *radio.now_playing().unwrap(),
            NowPlaying {
                song_name: "Kimi no Shiranai Monogatari".into(),
                artist_name: "supercell".into(),
                anime_name: Some("Bakemonogatari".into()),
                listeners: 512,
                requested_by: Some("Crawl".into()),
                discord_listeners: 5,
            }
        );
    }

    #[tokio::test]
    async fn malformed_frames_leave_record_untouched() {
        let (manager, radio) = idle();
        manager.handle_message(FRAME).await;
        let before = radio.now_playing().unwrap();

        for payload in ["", "   ", "{", "null", "[1,2]", r#"{"song_name":"only"}"#] {
            let outcome = manager.handle_message(payload).await;
            assert!(
                matches!(outcome, FeedOutcome::Ignored | FeedOutcome::Malformed(_)),
                "{payload:?} gave {outcome:?}"
            );
            assert_eq!(radio.now_playing().unwrap(), before);
        }
    }

    #[tokio::test]
    async fn empty_payload_before_any_record_is_a_no_op() {
        let (manager, radio) = idle();

        assert!(matches!(manager.handle_message("").await, FeedOutcome::Ignored));
        assert!(radio.now_playing().is_none());
    }

    #[tokio::test]
    async fn shard_failure_skips_the_update() {
        let (manager, radio, _) = manager(
            Arc::new(ScriptedConnector::default()),
            FakeShards::new(None, None),
        );

        let outcome = manager.handle_message(FRAME).await;

        assert!(matches!(outcome, FeedOutcome::ShardQueryFailed(_)));
        assert!(radio.now_playing().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_reconnects_once_after_delay() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Close(vec![
            FeedFrame::Close,
        ])]));
        let (manager, _, _) = manager(connector.clone(), quiet_shards());
        let task = manager.clone().spawn();

        sleep(RECONNECT_DELAY - Duration::from_millis(1)).await;
        assert_eq!(connector.opens().len(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        sleep(Duration::from_millis(2)).await;
        let opens = connector.opens();
        assert_eq!(opens.len(), 2);
        assert!(opens[1] - opens[0] >= RECONNECT_DELAY);
        assert_eq!(manager.state(), ConnectionState::Connected);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens().len(), 2);

        task.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn open_failures_retry_at_fixed_delay() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Fail, Script::Fail]));
        let (manager, _, _) = manager(connector.clone(), quiet_shards());
        let task = manager.clone().spawn();

        sleep(Duration::from_secs(10)).await;
        let opens = connector.opens();
        assert_eq!(opens.len(), 3);
        assert_eq!(opens[1] - opens[0], RECONNECT_DELAY);
        assert_eq!(opens[2] - opens[1], RECONNECT_DELAY);
        assert_eq!(manager.state(), ConnectionState::Connected);

        task.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn frames_flow_into_the_record_and_refresh_fires() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Hang(vec![
            FeedFrame::Other,
            FeedFrame::Text(FRAME.into()),
            FeedFrame::Text("garbage".into()),
            FeedFrame::Text(String::new()),
        ])]));
        let (manager, radio, refresh) =
            manager(connector.clone(), FakeShards::new(Some(vec![4]), Some(vec![0])));
        let task = manager.clone().spawn();

        sleep(Duration::from_secs(1)).await;

        assert!(timeout(Duration::from_millis(1), refresh.notified()).await.is_ok());
        let np = radio.now_playing().unwrap();
        assert_eq!(np.artist_name, "supercell");
        assert_eq!(np.discord_listeners, 4);
        assert_eq!(connector.opens().len(), 1);

        task.cancel();
    }
}
