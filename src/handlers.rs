use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use poise::serenity_prelude::{
    self as serenity, ConnectionStage, Context, EventHandler, GuildId, Ready, ResumedEvent,
    ShardStageUpdateEvent,
};
use tracing::{info, warn};

use crate::EVENT_TARGET;

/// Gateway event handler. Keeps the shared ready flag in step with the shard.
pub struct Handler {
    ready: Arc<AtomicBool>,
}

impl Handler {
    pub fn new(ready: Arc<AtomicBool>) -> Self {
        Self { ready }
    }

    fn set_stage(&self, stage: ConnectionStage) {
        let connected = matches!(stage, ConnectionStage::Connected);
        let was_connected = self.ready.swap(connected, Ordering::SeqCst);
        if was_connected && !connected {
            warn!(target: EVENT_TARGET, stage = ?stage, "Gateway connection lost, pausing sweeps");
        }
    }
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        self.ready.store(true, Ordering::SeqCst);
        info!(target: EVENT_TARGET, "Connected as {user_name}, shard {shard_id}");
    }

    async fn resume(&self, _ctx: Context, _event: ResumedEvent) {
        self.ready.store(true, Ordering::SeqCst);
        info!(target: EVENT_TARGET, "Gateway session resumed");
    }

    async fn shard_stage_update(&self, _ctx: Context, event: ShardStageUpdateEvent) {
        self.set_stage(event.new);
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!(target: EVENT_TARGET, "Cache ready! The bot is in {guild_count} guild(s)");
    }
}
