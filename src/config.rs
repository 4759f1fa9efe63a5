use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use serenity::model::id::UserId;

use crate::error::{Error, Result};

pub const DEFAULT_PREFIX: &str = "~~";
pub const DEFAULT_TWITCH_CHANNEL: &str = "listen_moe";
pub const DEFAULT_SETTINGS_PATH: &str = "settings.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    /// HTTP audio stream relayed into every voice connection.
    pub stream: String,
    /// Websocket pushing now-playing metadata.
    pub stream_info: String,
    pub owners: HashSet<UserId>,
    pub prefix: String,
    pub settings_path: PathBuf,
    pub twitch_client_id: Option<String>,
    pub twitch_channel: String,
    pub custom_presence: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup, empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| Error::Config(format!("Expected {key} in the environment")))
        };

        let owners = match get("OWNERS") {
            Some(raw) => parse_owners(&raw)?,
            None => HashSet::new(),
        };

        Ok(Self {
            token: required("DISCORD_TOKEN")?,
            stream: required("STREAM_URL")?,
            stream_info: required("STREAM_INFO_URL")?,
            owners,
            prefix: get("COMMAND_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.into()),
            settings_path: get("SETTINGS_PATH")
                .unwrap_or_else(|| DEFAULT_SETTINGS_PATH.into())
                .into(),
            twitch_client_id: get("TWITCH_CLIENT_ID"),
            twitch_channel: get("TWITCH_CHANNEL").unwrap_or_else(|| DEFAULT_TWITCH_CHANNEL.into()),
            custom_presence: get("CUSTOM_PRESENCE"),
        })
    }

    pub fn twitch_url(&self) -> String {
        format!("https://twitch.tv/{}", self.twitch_channel)
    }
}

fn parse_owners(raw: &str) -> Result<HashSet<UserId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .ok()
                .filter(|id| *id != 0)
                .map(UserId::new)
                .ok_or_else(|| Error::Config(format!("Invalid owner id: {s}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn required_values_and_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "token"),
            ("STREAM_URL", "https://listen.moe/stream"),
            ("STREAM_INFO_URL", "wss://listen.moe/api/v2/socket"),
        ]))
        .unwrap();

        assert_eq!(config.prefix, "~~");
        assert_eq!(config.settings_path, PathBuf::from("settings.json"));
        assert_eq!(config.twitch_url(), "https://twitch.tv/listen_moe");
        assert!(config.owners.is_empty());
        assert!(config.twitch_client_id.is_none());
        assert!(config.custom_presence.is_none());
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = Config::from_lookup(lookup(&[
            ("STREAM_URL", "https://listen.moe/stream"),
            ("STREAM_INFO_URL", "wss://listen.moe/api/v2/socket"),
        ]))
        .unwrap_err();

        assert!(err.to_string().contains("DISCORD_TOKEN"));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "token"),
            ("STREAM_URL", "a"),
            ("STREAM_INFO_URL", "b"),
            ("COMMAND_PREFIX", "  "),
            ("TWITCH_CLIENT_ID", ""),
        ]))
        .unwrap();

        assert_eq!(config.prefix, "~~");
        assert!(config.twitch_client_id.is_none());
    }

    #[test]
    fn owners_are_parsed() {
        let owners = parse_owners("81440962496172032, 83700966167150592,").unwrap();
        assert_eq!(owners.len(), 2);
        assert!(owners.contains(&UserId::new(81440962496172032)));
        assert!(parse_owners("crawl").is_err());
    }
}
