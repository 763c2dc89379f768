//! Discord enforcement backend
//!
//! Communities are guilds, mutes are a role, and the audit reason is passed
//! through to the guild audit log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use poise::serenity_prelude::{GuildId, Http, RoleId, UserId, UserPagination};
use tracing::{debug, info};

use crate::moderation::{BackendError, BackendResult, EnforcementBackend};

const NOT_FOUND: u16 = 404;

/// `EnforcementBackend` over the Discord REST API
#[derive(Clone)]
pub struct SerenityBackend {
    http: Arc<Http>,
    ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for SerenityBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerenityBackend")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl SerenityBackend {
    /// `ready` is shared with the gateway event handler, which flips it as the
    /// shard connects and disconnects.
    pub fn new(http: Arc<Http>, ready: Arc<AtomicBool>) -> Self {
        Self { http, ready }
    }

    fn guild(community_id: u64) -> BackendResult<GuildId> {
        if community_id == 0 {
            return Err(BackendError::Unresolvable("guild ID 0".to_string()));
        }
        Ok(GuildId::new(community_id))
    }

    fn user(user_id: u64) -> BackendResult<UserId> {
        if user_id == 0 {
            return Err(BackendError::Unresolvable("user ID 0".to_string()));
        }
        Ok(UserId::new(user_id))
    }

    fn role(role_id: u64) -> BackendResult<RoleId> {
        if role_id == 0 {
            return Err(BackendError::Unresolvable("role ID 0".to_string()));
        }
        Ok(RoleId::new(role_id))
    }
}

/// A 404 from Discord means the guild, member, ban or role is gone
fn platform_error(what: String, error: poise::serenity_prelude::Error) -> BackendError {
    let status = match &error {
        poise::serenity_prelude::Error::Http(e) => e.status_code().map(|s| s.as_u16()),
        _ => None,
    };
    classify(status, what, error)
}

fn classify(status: Option<u16>, what: String, error: poise::serenity_prelude::Error) -> BackendError {
    if status == Some(NOT_FOUND) {
        BackendError::Unresolvable(format!("{what}: {error}"))
    } else {
        BackendError::from(error)
    }
}

#[async_trait]
impl EnforcementBackend for SerenityBackend {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn resolve_community(&self, community_id: u64) -> BackendResult<()> {
        let guild_id = Self::guild(community_id)?;
        guild_id
            .to_partial_guild(self.http.as_ref())
            .await
            .map_err(|e| platform_error(format!("Failed to get guild {guild_id}"), e))?;
        Ok(())
    }

    async fn resolve_member(&self, community_id: u64, user_id: u64) -> BackendResult<()> {
        let guild_id = Self::guild(community_id)?;
        let user_id = Self::user(user_id)?;
        guild_id
            .member(self.http.as_ref(), user_id)
            .await
            .map_err(|e| {
                platform_error(
                    format!("Failed to get member {user_id} in guild {guild_id}"),
                    e,
                )
            })?;
        Ok(())
    }

    async fn is_banned(&self, community_id: u64, user_id: u64) -> BackendResult<bool> {
        let guild_id = Self::guild(community_id)?;
        let user_id = Self::user(user_id)?;

        let mut after = None;
        loop {
            let page = guild_id
                .bans(self.http.as_ref(), after, None)
                .await
                .map_err(|e| platform_error(format!("Failed to list bans in guild {guild_id}"), e))?;
            if page.iter().any(|ban| ban.user.id == user_id) {
                return Ok(true);
            }
            match page.last() {
                Some(last) => after = Some(UserPagination::After(last.user.id)),
                None => return Ok(false),
            }
        }
    }

    async fn apply_ban(&self, community_id: u64, user_id: u64, reason: &str) -> BackendResult<()> {
        let guild_id = Self::guild(community_id)?;
        let user_id = Self::user(user_id)?;
        info!("Banning user {user_id} in guild {guild_id}");

        guild_id
            .ban_with_reason(self.http.as_ref(), user_id, 0, reason)
            .await
            .map_err(|e| platform_error(format!("Failed to ban {user_id} in guild {guild_id}"), e))?;
        Ok(())
    }

    async fn revoke_ban(
        &self,
        community_id: u64,
        user_id: u64,
        reason: &str,
    ) -> BackendResult<()> {
        let guild_id = Self::guild(community_id)?;
        let user_id = Self::user(user_id)?;
        info!("Unbanning user {user_id} in guild {guild_id}");

        self.http
            .remove_ban(guild_id, user_id, Some(reason))
            .await
            .map_err(|e| {
                platform_error(format!("Failed to unban {user_id} in guild {guild_id}"), e)
            })?;
        Ok(())
    }

    async fn apply_mute(
        &self,
        community_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> BackendResult<()> {
        let guild_id = Self::guild(community_id)?;
        let user_id = Self::user(user_id)?;
        let role_id = Self::role(role_id)?;
        debug!("Adding role {role_id} to user {user_id} in guild {guild_id}");

        self.http
            .add_member_role(guild_id, user_id, role_id, Some(reason))
            .await
            .map_err(|e| {
                platform_error(
                    format!("Failed to add role {role_id} to {user_id} in guild {guild_id}"),
                    e,
                )
            })?;
        Ok(())
    }

    async fn revoke_mute(
        &self,
        community_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> BackendResult<()> {
        let guild_id = Self::guild(community_id)?;
        let user_id = Self::user(user_id)?;
        let role_id = Self::role(role_id)?;
        debug!("Removing role {role_id} from user {user_id} in guild {guild_id}");

        self.http
            .remove_member_role(guild_id, user_id, role_id, Some(reason))
            .await
            .map_err(|e| {
                platform_error(
                    format!("Failed to remove role {role_id} from {user_id} in guild {guild_id}"),
                    e,
                )
            })?;
        Ok(())
    }

    async fn kick(&self, community_id: u64, user_id: u64, reason: &str) -> BackendResult<()> {
        let guild_id = Self::guild(community_id)?;
        let user_id = Self::user(user_id)?;
        info!("Kicking user {user_id} from guild {guild_id}");

        guild_id
            .kick_with_reason(self.http.as_ref(), user_id, reason)
            .await
            .map_err(|e| platform_error(format!("Failed to kick {user_id} from guild {guild_id}"), e))?;
        Ok(())
    }
}
