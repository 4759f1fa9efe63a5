use std::sync::Arc;

use serenity::async_trait;
use serenity::cache::Cache;
use serenity::model::guild::Guild;
use serenity::model::id::{ChannelId, GuildId};
use serenity::model::voice::VoiceState;

use crate::error::Result;
use crate::voice::VoiceManager;

/// Requests broadcast to every shard, one result per shard in shard order.
#[async_trait]
pub trait ShardRpc: Send + Sync {
    /// Listening members in the voice channel the bot occupies, per shard.
    async fn voice_occupancy(&self) -> Result<Vec<u64>>;

    /// Guilds handled, per shard.
    async fn guild_counts(&self) -> Result<Vec<u64>>;
}

/// Sum of listeners across every shard. Never cached, a failing shard fails the whole count.
pub async fn count_listeners(shards: &dyn ShardRpc) -> Result<u64> {
    Ok(shards.voice_occupancy().await?.into_iter().sum())
}

pub async fn count_guilds(shards: &dyn ShardRpc) -> Result<u64> {
    Ok(shards.guild_counts().await?.into_iter().sum())
}

/// A member sitting in the bot's voice channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Occupant {
    pub bot: bool,
    pub deaf: bool,
    pub self_deaf: bool,
}

impl Occupant {
    pub fn is_listening(&self) -> bool {
        !(self.bot || self.self_deaf || self.deaf)
    }
}

pub fn occupancy<'a>(occupants: impl IntoIterator<Item = &'a Occupant>) -> u64 {
    occupants.into_iter().filter(|o| o.is_listening()).count() as u64
}

/// Discord's shard routing formula.
pub fn shard_for(guild_id: u64, shard_count: u32) -> usize {
    ((guild_id >> 22) % u64::from(shard_count.max(1))) as usize
}

/// Buckets per-guild listener counts into per-shard totals. A guild that is
/// not in the cache (an outage, or still loading) counts as nobody.
pub fn per_shard(
    shard_count: u32,
    guilds: impl IntoIterator<Item = (GuildId, Option<u64>)>,
) -> Vec<u64> {
    let mut counts = vec![0; shard_count.max(1) as usize];
    for (guild_id, listeners) in guilds {
        counts[shard_for(guild_id.get(), shard_count)] += listeners.unwrap_or(0);
    }
    counts
}

/// Answers shard queries for every shard run by this process from the shared
/// serenity cache and the voice relay's live calls.
pub struct SerenityShards {
    cache: Arc<Cache>,
    voice: Arc<VoiceManager>,
}

impl SerenityShards {
    pub fn new(cache: Arc<Cache>, voice: Arc<VoiceManager>) -> Self {
        Self { cache, voice }
    }

    fn shard_count(&self) -> u32 {
        self.cache.shard_count().max(1)
    }

    fn occupants(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<Vec<Occupant>> {
        let guild = self.cache.guild(guild_id)?;

        Some(
            guild
                .voice_states
                .values()
                .filter(|vs| vs.channel_id == Some(channel_id))
                .map(|vs| Occupant {
                    bot: is_bot(&guild, vs),
                    deaf: vs.deaf,
                    self_deaf: vs.self_deaf,
                })
                .collect(),
        )
    }
}

fn is_bot(guild: &Guild, voice_state: &VoiceState) -> bool {
    voice_state
        .member
        .as_ref()
        .or_else(|| guild.members.get(&voice_state.user_id))
        .map(|member| member.user.bot)
        .unwrap_or(false)
}

#[async_trait]
impl ShardRpc for SerenityShards {
    async fn voice_occupancy(&self) -> Result<Vec<u64>> {
        let guilds = self
            .voice
            .live_channels()
            .into_iter()
            .map(|(guild_id, channel_id)| {
                let listeners = self
                    .occupants(guild_id, channel_id)
                    .map(|occupants| occupancy(&occupants));
                (guild_id, listeners)
            });

        Ok(per_shard(self.shard_count(), guilds))
    }

    async fn guild_counts(&self) -> Result<Vec<u64>> {
        let guilds = self.cache.guilds().into_iter().map(|guild_id| (guild_id, Some(1)));

        Ok(per_shard(self.shard_count(), guilds))
    }
}
