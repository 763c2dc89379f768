//! Enforcement backend
//!
//! The core never touches the chat platform directly. It asks an
//! `EnforcementBackend` to apply or reverse a sanction and to tell whether a
//! community or member can still be reached.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::moderation::{BackendError, BackendResult, Case, CaseKind};

/// Applies and reverses sanctions on the managed platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnforcementBackend: Send + Sync {
    /// Whether the platform connection is live
    fn is_ready(&self) -> bool;

    /// Check that the community still exists and is reachable
    async fn resolve_community(&self, community_id: u64) -> BackendResult<()>;

    /// Check that a user is a member of the community
    async fn resolve_member(&self, community_id: u64, user_id: u64) -> BackendResult<()>;

    /// Whether the user is currently banned from the community
    async fn is_banned(&self, community_id: u64, user_id: u64) -> BackendResult<bool>;

    async fn apply_ban(&self, community_id: u64, user_id: u64, reason: &str) -> BackendResult<()>;

    async fn revoke_ban(&self, community_id: u64, user_id: u64, reason: &str)
    -> BackendResult<()>;

    async fn apply_mute(
        &self,
        community_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> BackendResult<()>;

    async fn revoke_mute(
        &self,
        community_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> BackendResult<()>;

    async fn kick(&self, community_id: u64, user_id: u64, reason: &str) -> BackendResult<()>;
}

/// Run a backend call, turning an overrun into `BackendError::TimedOut`
pub(crate) async fn within<T>(
    limit: Duration,
    call: impl Future<Output = BackendResult<T>>,
) -> BackendResult<T> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(BackendError::TimedOut(limit)))
}

/// Reverse the platform effect of a time-bounded case
///
/// Bans are lifted, the mute role is removed. Other kinds have nothing to reverse.
pub(crate) async fn lift_sanction(
    backend: &dyn EnforcementBackend,
    case: &Case,
    reason: &str,
    limit: Duration,
) -> BackendResult<()> {
    match case.kind {
        CaseKind::Ban => {
            within(
                limit,
                backend.revoke_ban(case.community_id, case.subject_id, reason),
            )
            .await
        }
        CaseKind::Mute => {
            let role_id = case.attributes.muted_role_id.ok_or_else(|| {
                BackendError::Failed(format!("mute case {} has no role to remove", case.id))
            })?;
            within(
                limit,
                backend.revoke_mute(case.community_id, case.subject_id, role_id, reason),
            )
            .await
        }
        CaseKind::Unban | CaseKind::Unmute | CaseKind::Warn | CaseKind::Kick => Ok(()),
    }
}

/// Put the platform effect of a ban or mute back in place
///
/// Used when a case was extended while its sanction was being lifted.
pub(crate) async fn impose_sanction(
    backend: &dyn EnforcementBackend,
    case: &Case,
    reason: &str,
    limit: Duration,
) -> BackendResult<()> {
    match case.kind {
        CaseKind::Ban => {
            within(
                limit,
                backend.apply_ban(case.community_id, case.subject_id, reason),
            )
            .await
        }
        CaseKind::Mute => {
            let role_id = case.attributes.muted_role_id.ok_or_else(|| {
                BackendError::Failed(format!("mute case {} has no role to add", case.id))
            })?;
            within(
                limit,
                backend.apply_mute(case.community_id, case.subject_id, role_id, reason),
            )
            .await
        }
        CaseKind::Unban | CaseKind::Unmute | CaseKind::Warn | CaseKind::Kick => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_within_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        };
        let result = within(Duration::from_secs(1), slow).await;
        assert!(matches!(result, Err(BackendError::TimedOut(d)) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_within_passes_result_through() {
        let result = within(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);

        let result: BackendResult<()> = within(Duration::from_secs(1), async {
            Err(BackendError::Unresolvable("gone".into()))
        })
        .await;
        assert!(result.unwrap_err().is_unresolvable());
    }

    #[tokio::test]
    async fn test_lift_mute_without_role_fails() {
        let case = Case::new(CaseKind::Mute, 1, 2, 3, "spam")
            .with_duration(Some(Duration::from_secs(60)))
            .unwrap();
        let backend = MockEnforcementBackend::new();

        let result = lift_sanction(&backend, &case, "expired", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BackendError::Failed(_))));
    }

    #[tokio::test]
    async fn test_lift_warn_is_noop() {
        let case = Case::new(CaseKind::Warn, 1, 2, 3, "rude");
        let backend = MockEnforcementBackend::new();
        lift_sanction(&backend, &case, "expired", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_impose_ban_reapplies() {
        let case = Case::new(CaseKind::Ban, 1, 2, 3, "raid")
            .with_duration(Some(Duration::from_secs(60)))
            .unwrap();
        let mut backend = MockEnforcementBackend::new();
        backend
            .expect_apply_ban()
            .withf(|community, user, reason| *community == 1 && *user == 3 && reason == "extended")
            .times(1)
            .returning(|_, _, _| Ok(()));

        impose_sanction(&backend, &case, "extended", Duration::from_secs(1))
            .await
            .unwrap();
    }
}
