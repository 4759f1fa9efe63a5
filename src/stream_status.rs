use std::sync::Arc;
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde::Deserialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use crate::error::Result;
use crate::radio::RadioState;
use crate::task::TaskHandle;

pub const POLL_INTERVAL: Duration = Duration::from_millis(30_000);

const TWITCH_API: &str = "https://api.twitch.tv/kraken/streams/";

#[derive(Deserialize, Debug, Default)]
pub struct StreamsResponse {
    #[serde(default)]
    streams: Option<Vec<serde_json::Value>>,
}

impl StreamsResponse {
    pub fn is_live(&self) -> bool {
        self.streams.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// Polls Twitch to find out whether the radio's channel is live.
pub struct StreamStatus {
    http: HttpClient,
    api: String,
    channel: String,
    client_id: String,
    shard: String,
}

impl StreamStatus {
    pub fn new(
        http: HttpClient,
        channel: impl Into<String>,
        client_id: impl Into<String>,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api: TWITCH_API.into(),
            channel: channel.into(),
            client_id: client_id.into(),
            shard: shard.into(),
        }
    }

    pub async fn is_live(&self) -> Result<bool> {
        let res = self
            .http
            .get(&self.api)
            .query(&[("limit", "1"), ("channel", self.channel.as_str())])
            .header("Accept", "application/vnd.twitchtv.v3+json")
            .header("Client-ID", &self.client_id)
            .send()
            .await?
            .error_for_status()?
            .json::<StreamsResponse>()
            .await?;

        Ok(res.is_live())
    }

    /// Any failure counts as offline.
    pub async fn run(self, radio: Arc<RadioState>) {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately, the first check waits a full period
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let live = match self.is_live().await {
                Ok(live) => live,
                Err(why) => {
                    warn!(shard = %self.shard, "STREAM: Status check failed: {why}");
                    false
                }
            };
            radio.set_streaming(live);
        }
    }

    pub fn spawn(self, radio: Arc<RadioState>) -> TaskHandle {
        TaskHandle::spawn("stream status", self.run(radio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> StreamsResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn live_only_with_a_stream_listed() {
        assert!(parse(r#"{"_total":1,"streams":[{"channel":{"name":"listen_moe"}}]}"#).is_live());
        assert!(!parse(r#"{"_total":0,"streams":[]}"#).is_live());
        assert!(!parse(r#"{"streams":null}"#).is_live());
        assert!(!parse(r#"{"error":"Bad Request","status":400}"#).is_live());
    }

    #[tokio::test]
    async fn unreachable_api_is_an_error() {
        let mut status = StreamStatus::new(HttpClient::new(), "listen_moe", "client", "0");
        status.api = "http://127.0.0.1:9/kraken/streams/".into();

        assert!(status.is_live().await.is_err());
    }
}
