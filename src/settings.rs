use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use serenity::model::id::{ChannelId, GuildId};
use tracing::{info, warn};

use crate::error::Result;

pub const PREFIX: &str = "prefix";
pub const IGNORED_CHANNELS: &str = "ignoredChannels";
pub const VOICE_CHANNEL: &str = "voiceChannel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Guild(GuildId),
}

impl Scope {
    fn key(&self) -> String {
        match self {
            Scope::Global => "global".into(),
            Scope::Guild(guild_id) => guild_id.to_string(),
        }
    }
}

impl From<GuildId> for Scope {
    fn from(guild_id: GuildId) -> Self {
        Scope::Guild(guild_id)
    }
}

type Store = HashMap<String, Map<String, Value>>;

/// Per-guild settings kept in a JSON file, written through on every change.
pub struct Settings {
    path: PathBuf,
    data: RwLock<Store>,
}

impl Settings {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Store::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Store::new()
        };

        info!("Loaded settings for {} scopes from {}", data.len(), path.display());
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<T: DeserializeOwned>(&self, scope: impl Into<Scope>, key: &str) -> Option<T> {
        let scope: Scope = scope.into();
        let data = self.data.read();
        let value = data.get(&scope.key())?.get(key)?;

        match serde_json::from_value(value.clone()) {
            Ok(value) => Some(value),
            Err(why) => {
                warn!("Ignoring unreadable setting {key} for {}: {why}", scope.key());
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, scope: impl Into<Scope>, key: &str, value: T) -> Result<()> {
        let scope: Scope = scope.into();
        let value = serde_json::to_value(value)?;
        let mut data = self.data.write();
        data.entry(scope.key())
            .or_default()
            .insert(key.into(), value);
        self.persist(&data)
    }

    pub fn remove(&self, scope: impl Into<Scope>, key: &str) -> Result<Option<Value>> {
        let scope: Scope = scope.into();
        let mut data = self.data.write();
        let removed = data
            .get_mut(&scope.key())
            .and_then(|settings| settings.remove(key));

        if removed.is_some() {
            self.persist(&data)?;
        }
        Ok(removed)
    }

    pub fn clear(&self, scope: impl Into<Scope>) -> Result<()> {
        let scope: Scope = scope.into();
        let mut data = self.data.write();
        if data.remove(&scope.key()).is_some() {
            self.persist(&data)?;
        }
        Ok(())
    }

    fn persist(&self, data: &Store) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn prefix(&self, guild_id: GuildId) -> Option<String> {
        self.get(guild_id, PREFIX)
    }

    pub fn ignored_channels(&self, guild_id: GuildId) -> Vec<ChannelId> {
        self.get(guild_id, IGNORED_CHANNELS).unwrap_or_default()
    }

    pub fn is_ignored(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        self.ignored_channels(guild_id).contains(&channel_id)
    }

    pub fn voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.get(guild_id, VOICE_CHANNEL)
    }
}
