use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

/// What the radio is playing right now, as pushed by the metadata feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub song_name: String,
    pub artist_name: String,
    pub anime_name: Option<String>,
    pub listeners: u64,
    pub requested_by: Option<String>,
    pub discord_listeners: u64,
}

/// One decoded frame of the metadata feed.
#[derive(Deserialize, Debug)]
pub struct FeedUpdate {
    pub song_name: String,
    pub artist_name: String,
    #[serde(default)]
    pub anime_name: Option<String>,
    pub listeners: u64,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl FeedUpdate {
    pub fn parse(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    pub fn into_now_playing(self, discord_listeners: u64) -> NowPlaying {
        NowPlaying {
            song_name: self.song_name,
            artist_name: self.artist_name,
            anime_name: self.anime_name,
            listeners: self.listeners,
            requested_by: self.requested_by,
            discord_listeners,
        }
    }
}

/// State shared between the feed client, the presence loop, the stream poller
/// and the commands.
///
/// Each field has exactly one writer: `now_playing` is written by the feed
/// client, `streaming` by the stream poller and `custom_presence` once at
/// start-up. Readers may observe a stale value but never a half-written one.
#[derive(Debug, Default)]
pub struct RadioState {
    now_playing: RwLock<Option<Arc<NowPlaying>>>,
    streaming: AtomicBool,
    custom_presence: AtomicBool,
}

impl RadioState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_playing(&self) -> Option<Arc<NowPlaying>> {
        self.now_playing.read().clone()
    }

    pub fn replace_now_playing(&self, record: NowPlaying) -> Arc<NowPlaying> {
        let record = Arc::new(record);
        *self.now_playing.write() = Some(record.clone());
        record
    }

    pub fn streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Relaxed);
    }

    pub fn custom_presence(&self) -> bool {
        self.custom_presence.load(Ordering::Relaxed)
    }

    pub fn set_custom_presence(&self, custom: bool) {
        self.custom_presence.store(custom, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_feed_frame_and_ignores_extra_fields() {
        let payload = r#"{
            "song_id": 1234,
            "song_name": "Sobakasu",
            "artist_name": "Judy and Mary",
            "anime_name": "Rurouni Kenshin",
            "listeners": 412,
            "requested_by": "",
            "extended": {"queue": []}
        }"#;

        let record = FeedUpdate::parse(payload).unwrap().into_now_playing(7);

        assert_eq!(
            record,
            NowPlaying {
                song_name: "Sobakasu".into(),
                artist_name: "Judy and Mary".into(),
                anime_name: Some("Rurouni Kenshin".into()),
                listeners: 412,
                requested_by: Some(String::new()),
                discord_listeners: 7,
            }
        );
    }

    #[test]
    fn nullable_fields_may_be_null_or_missing() {
        let record = FeedUpdate::parse(
            r#"{"song_name":"a","artist_name":"b","anime_name":null,"listeners":0}"#,
        )
        .unwrap()
        .into_now_playing(0);

        assert!(record.anime_name.is_none());
        assert!(record.requested_by.is_none());
    }

    #[test]
    fn rejects_frames_without_the_required_shape() {
        assert!(FeedUpdate::parse("").is_err());
        assert!(FeedUpdate::parse("not json").is_err());
        assert!(FeedUpdate::parse("[]").is_err());
        assert!(FeedUpdate::parse(r#"{"song_name":"a","listeners":1}"#).is_err());
        assert!(
            FeedUpdate::parse(r#"{"song_name":"a","artist_name":"b","listeners":-1}"#).is_err()
        );
    }

    #[test]
    fn replacing_the_record_is_wholesale() {
        let state = RadioState::new();
        assert!(state.now_playing().is_none());

        let first = FeedUpdate::parse(r#"{"song_name":"a","artist_name":"b","listeners":1}"#)
            .unwrap()
            .into_now_playing(2);
        state.replace_now_playing(first.clone());
        let held = state.now_playing().unwrap();

        let second = FeedUpdate::parse(r#"{"song_name":"c","artist_name":"d","listeners":3}"#)
            .unwrap()
            .into_now_playing(4);
        state.replace_now_playing(second.clone());

        assert_eq!(*held, first);
        assert_eq!(*state.now_playing().unwrap(), second);
    }
}
