//! Moderator service
//!
//! The command surface of the moderation core: sanction commands, `end`,
//! `edit` and `delete`, plus the startup sequence that loads the registry and
//! starts the expiration sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::config::ModeratorConfig;
use crate::moderation::backend::{lift_sanction, within};
use crate::moderation::{
    BackendResult, Case, CaseAttributes, CaseId, CaseKind, CaseListener, CaseRegistry, CaseStore,
    EnforcementBackend, EventNotifier, JsonFileStore, ModerationError, ModerationResult,
    SweepReport, Sweeper, SweeperHandle,
};

/// Input to a sanction command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanctionRequest {
    pub community_id: u64,
    pub actor_id: u64,
    pub subject_id: u64,
    /// How long a ban or mute lasts; `None` or zero means until lifted by hand
    pub duration: Option<Duration>,
    pub reason: Option<String>,
    /// Role used to mute; required for mute and unmute
    pub muted_role_id: Option<u64>,
    /// How the actor is named in the platform's audit log
    pub actor_tag: Option<String>,
}

impl SanctionRequest {
    #[must_use]
    pub fn new(community_id: u64, actor_id: u64, subject_id: u64) -> Self {
        Self {
            community_id,
            actor_id,
            subject_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn muted_role(mut self, role_id: u64) -> Self {
        self.muted_role_id = Some(role_id);
        self
    }

    #[must_use]
    pub fn actor_tag(mut self, tag: impl Into<String>) -> Self {
        self.actor_tag = Some(tag.into());
        self
    }
}

/// Changes applied by [`Moderator::edit`]
///
/// `add_time_ms` is applied before `set_end_timestamp`, so when both are given
/// the explicit timestamp wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseEdit {
    pub actor_id: Option<u64>,
    pub reason: Option<String>,
    /// Milliseconds added to the current expiry; negative values shorten the case
    pub add_time_ms: Option<i64>,
    pub set_end_timestamp: Option<DateTime<Utc>>,
}

impl CaseEdit {
    fn is_empty(&self) -> bool {
        self.actor_id.is_none()
            && self.reason.is_none()
            && self.add_time_ms.is_none()
            && self.set_end_timestamp.is_none()
    }

    fn apply(&self, old: &Case) -> ModerationResult<Case> {
        let mut next = old.clone();

        if let Some(actor_id) = self.actor_id {
            next.actor_id = actor_id;
        }
        if let Some(reason) = self.reason.as_deref() {
            if reason.trim().is_empty() {
                return Err(ModerationError::Validation("reason must not be empty".to_string()));
            }
            next.reason = reason.to_string();
        }
        if let Some(add_time_ms) = self.add_time_ms {
            let expires_at = next.expires_at.ok_or_else(|| {
                ModerationError::Validation(format!("case {} has no expiry to move", old.id))
            })?;
            next.expires_at = Some(
                chrono::Duration::try_milliseconds(add_time_ms)
                    .and_then(|delta| expires_at.checked_add_signed(delta))
                    .ok_or_else(|| {
                        ModerationError::Validation(format!("addTime {add_time_ms} is out of range"))
                    })?,
            );
        }
        if let Some(end) = self.set_end_timestamp {
            next.expires_at = Some(end.trunc_subsecs(3));
        }

        if next.expires_at.is_some_and(|end| end < next.created_at) {
            return Err(ModerationError::Validation(format!(
                "case {} cannot end before it was created",
                old.id
            )));
        }
        Ok(next)
    }
}

/// Audit details for [`Moderator::delete`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub actor_id: Option<u64>,
    pub reason: Option<String>,
}

/// Sanction lifecycle manager
pub struct Moderator {
    config: ModeratorConfig,
    store: Arc<dyn CaseStore>,
    backend: Arc<dyn EnforcementBackend>,
    notifier: Arc<EventNotifier>,
    registry: OnceCell<Arc<CaseRegistry>>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl std::fmt::Debug for Moderator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Moderator")
            .field("config", &self.config)
            .field("registry", &self.registry.get())
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl Moderator {
    /// Moderator persisting to the JSON document named in `config`
    pub fn new(config: ModeratorConfig, backend: Arc<dyn EnforcementBackend>) -> Self {
        let store = Arc::new(JsonFileStore::new(config.storage_path.clone()));
        Self::with_store(config, store, backend)
    }

    pub fn with_store(
        config: ModeratorConfig,
        store: Arc<dyn CaseStore>,
        backend: Arc<dyn EnforcementBackend>,
    ) -> Self {
        Self {
            config,
            store,
            backend,
            notifier: Arc::new(EventNotifier::new()),
            registry: OnceCell::new(),
            sweeper: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ModeratorConfig {
        &self.config
    }

    /// Register a listener for caseCreate, caseUpdate and caseDelete
    pub fn subscribe(&self, listener: Arc<dyn CaseListener>) {
        self.notifier.subscribe(listener);
    }

    /// Whether `init` has completed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.registry.initialized()
    }

    /// Load the registry from storage and start the expiration sweep.
    /// Calling it again after a successful init does nothing.
    ///
    /// # Errors
    /// `StorageCorrupt` or `StorageIo` if the case document cannot be loaded.
    /// The sweep is not started in that case.
    pub async fn init(&self) -> ModerationResult<()> {
        let store = Arc::clone(&self.store);
        let registry = self
            .registry
            .get_or_try_init(|| async move { CaseRegistry::load(store).await.map(Arc::new) })
            .await?;

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_none() {
            *sweeper = Some(self.build_sweeper(Arc::clone(registry)).spawn());
            info!(cases = registry.len(), "Moderator ready");
        }
        Ok(())
    }

    /// Stop the expiration sweep. Persistence is synchronous, so nothing needs flushing.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.shutdown().await;
        }
    }

    /// Run one expiration sweep as if the current time were `now`
    ///
    /// # Errors
    /// `NotReady` before `init`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ModerationResult<SweepReport> {
        let registry = Arc::clone(self.registry()?);
        Ok(self.build_sweeper(registry).tick_at(now).await)
    }

    /// Ask the running sweep loop to tick now
    pub async fn sweep_now(&self) {
        if let Some(handle) = self.sweeper.lock().await.as_ref() {
            handle.sweep_now().await;
        }
    }

    /// # Errors
    /// `NotReady`, `NotFound`.
    pub fn find(&self, id: &CaseId) -> ModerationResult<Case> {
        self.registry()?.find(id)
    }

    /// Every case, oldest first
    ///
    /// # Errors
    /// `NotReady`.
    pub fn cases(&self) -> ModerationResult<Vec<Case>> {
        Ok(self.registry()?.all())
    }

    /// Cases recorded against one member of a community, oldest first
    ///
    /// # Errors
    /// `NotReady`.
    pub fn cases_for(&self, community_id: u64, subject_id: u64) -> ModerationResult<Vec<Case>> {
        Ok(self.registry()?.for_subject(community_id, subject_id))
    }

    /// Ban a member, for `request.duration` or permanently
    ///
    /// The case is recorded even if the platform ban fails.
    ///
    /// # Errors
    /// See [`Self::sanction`].
    pub async fn ban(&self, request: SanctionRequest) -> ModerationResult<Case> {
        self.sanction(CaseKind::Ban, request).await
    }

    /// Lift a ban. Fails with `Validation` if the user is not banned.
    ///
    /// # Errors
    /// See [`Self::sanction`].
    pub async fn unban(&self, request: SanctionRequest) -> ModerationResult<Case> {
        self.sanction(CaseKind::Unban, request).await
    }

    /// Give a member the mute role, for `request.duration` or permanently
    ///
    /// # Errors
    /// See [`Self::sanction`].
    pub async fn mute(&self, request: SanctionRequest) -> ModerationResult<Case> {
        self.sanction(CaseKind::Mute, request).await
    }

    /// Remove the mute role from a member
    ///
    /// # Errors
    /// See [`Self::sanction`].
    pub async fn unmute(&self, request: SanctionRequest) -> ModerationResult<Case> {
        self.sanction(CaseKind::Unmute, request).await
    }

    /// Record a warning. A reason is required.
    ///
    /// # Errors
    /// See [`Self::sanction`].
    pub async fn warn(&self, request: SanctionRequest) -> ModerationResult<Case> {
        self.sanction(CaseKind::Warn, request).await
    }

    /// Kick a member. A reason is required; the case is recorded even if the kick fails.
    ///
    /// # Errors
    /// See [`Self::sanction`].
    pub async fn kick(&self, request: SanctionRequest) -> ModerationResult<Case> {
        self.sanction(CaseKind::Kick, request).await
    }

    /// Create path shared by every sanction command
    ///
    /// # Errors
    /// - `Validation` for missing fields or an actor/subject that cannot be resolved
    /// - `NotReady` before `init`
    /// - `Enforcement`/`UnresolvableTarget` if the platform action fails (not for ban and kick)
    /// - `StorageIo` if the case could not be persisted
    async fn sanction(&self, kind: CaseKind, request: SanctionRequest) -> ModerationResult<Case> {
        let reason = self.reason_for(kind, request.reason.as_deref())?;
        let attributes = match kind {
            CaseKind::Mute | CaseKind::Unmute => {
                let role_id = request.muted_role_id.ok_or_else(|| {
                    ModerationError::Validation(format!("a {kind} needs the muted role ID"))
                })?;
                CaseAttributes::muted_role(role_id)
            }
            _ => CaseAttributes::default(),
        };

        self.check_member(request.community_id, request.actor_id, "actor")
            .await?;
        if kind == CaseKind::Unban {
            let banned = self
                .call(self.backend.is_banned(request.community_id, request.subject_id))
                .await?;
            if !banned {
                return Err(ModerationError::Validation(format!(
                    "user {} is not banned",
                    request.subject_id
                )));
            }
        } else {
            self.check_member(request.community_id, request.subject_id, "subject")
                .await?;
        }

        let registry = self.registry()?;

        let case = Case::new(
            kind,
            request.community_id,
            request.actor_id,
            request.subject_id,
            reason,
        )
        .with_duration(request.duration)?
        .with_attributes(attributes);

        let actor = request
            .actor_tag
            .clone()
            .unwrap_or_else(|| request.actor_id.to_string());
        if let Err(e) = self.apply(&case, &case.audit_reason(&actor)).await {
            if matches!(kind, CaseKind::Ban | CaseKind::Kick) {
                warn!(
                    case_id = %case.id,
                    kind = %kind,
                    subject_id = case.subject_id,
                    error = %e,
                    "Platform action failed, recording case anyway"
                );
            } else {
                return Err(e.into());
            }
        }

        let case = registry.create(case).await?;
        info!(
            case_id = %case.id,
            kind = %case.kind,
            community_id = case.community_id,
            actor_id = case.actor_id,
            subject_id = case.subject_id,
            expires_at = ?case.expires_at,
            "Case created"
        );
        self.notifier.case_create(&case);
        Ok(case)
    }

    /// End an active case, lifting its ban or mute
    ///
    /// The community, the actor and (for a mute) the subject must still be
    /// reachable, otherwise nothing changes. A mute whose role cannot be removed
    /// is still ended; a ban that cannot be lifted stays active so it can be retried.
    ///
    /// # Errors
    /// `NotReady`, `NotFound`, `AlreadyEnded`, `UnresolvableTarget` if the community
    /// or actor is gone, `Enforcement` if the platform action fails, `StorageIo`.
    pub async fn end(&self, id: &CaseId) -> ModerationResult<Case> {
        let registry = self.registry()?;
        let case = registry.find(id)?;
        if case.ended {
            return Err(ModerationError::AlreadyEnded(id.clone()));
        }

        self.call(self.backend.resolve_community(case.community_id))
            .await?;
        self.call(self.backend.resolve_member(case.community_id, case.actor_id))
            .await?;

        let reason = format!("Case {} ended", case.id);
        match case.kind {
            CaseKind::Mute => {
                self.call(self.backend.resolve_member(case.community_id, case.subject_id))
                    .await?;
                if let Err(e) = self.lift(&case, &reason).await {
                    warn!(case_id = %id, error = %e, "Failed to unmute, ending case anyway");
                    if let Some(ended) = registry.end_if_active(id).await? {
                        self.notifier.case_delete(&ended);
                    }
                    return Err(e.into());
                }
            }
            _ => self.lift(&case, &reason).await?,
        }

        let ended = registry
            .end_if_active(id)
            .await?
            .ok_or_else(|| ModerationError::AlreadyEnded(id.clone()))?;
        info!(case_id = %id, kind = %ended.kind, "Case ended");
        self.notifier.case_delete(&ended);
        Ok(ended)
    }

    /// Edit an active case, returning the new snapshot
    ///
    /// # Errors
    /// `NotReady`, `NotFound`, `AlreadyEnded`, `Validation` for an empty or
    /// out-of-range edit, `UnresolvableTarget` if the community is gone, `StorageIo`.
    pub async fn edit(&self, id: &CaseId, edit: CaseEdit) -> ModerationResult<Case> {
        let registry = self.registry()?;
        if edit.is_empty() {
            return Err(ModerationError::Validation("nothing to edit".to_string()));
        }

        let case = registry.find(id)?;
        if case.ended {
            return Err(ModerationError::AlreadyEnded(id.clone()));
        }
        self.call(self.backend.resolve_community(case.community_id))
            .await?;

        let (old, new) = registry.update(id, |old| edit.apply(old)).await?;
        info!(
            case_id = %id,
            expires_at = ?new.expires_at,
            reason = %new.reason,
            "Case edited"
        );
        self.notifier.case_update(&old, &new);
        Ok(new)
    }

    /// Delete a case. An active case is lifted first (best effort) and always ended.
    ///
    /// # Errors
    /// `NotReady`, `NotFound`, `StorageIo`.
    pub async fn delete(&self, id: &CaseId, options: DeleteOptions) -> ModerationResult<Case> {
        let registry = self.registry()?;
        let case = registry.find(id)?;

        if !case.ended {
            let reason = format!("Case {} deleted", case.id);
            if let Err(e) = self.lift(&case, &reason).await {
                warn!(case_id = %id, error = %e, "Failed to lift sanction of deleted case");
            }
        }

        let removed = registry.remove(id).await?;
        info!(
            case_id = %id,
            deleted_by = ?options.actor_id,
            reason = ?options.reason,
            "Case deleted"
        );
        self.notifier.case_delete(&removed);
        Ok(removed)
    }

    fn registry(&self) -> ModerationResult<&Arc<CaseRegistry>> {
        self.registry.get().ok_or(ModerationError::NotReady)
    }

    fn build_sweeper(&self, registry: Arc<CaseRegistry>) -> Sweeper {
        Sweeper::new(
            registry,
            Arc::clone(&self.backend),
            Arc::clone(&self.notifier),
            self.config.sweep_interval(),
            self.config.backend_timeout(),
        )
    }

    fn reason_for(&self, kind: CaseKind, reason: Option<&str>) -> ModerationResult<String> {
        match reason.map(str::trim).filter(|r| !r.is_empty()) {
            Some(reason) => Ok(reason.to_string()),
            None if matches!(kind, CaseKind::Warn | CaseKind::Kick) => Err(
                ModerationError::Validation(format!("a {kind} needs a reason")),
            ),
            None => Ok(self.config.default_reason.clone()),
        }
    }

    async fn check_member(&self, community_id: u64, user_id: u64, role: &str) -> ModerationResult<()> {
        match self.call(self.backend.resolve_member(community_id, user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_unresolvable() => Err(ModerationError::Validation(format!(
                "{role} {user_id} is not a member of community {community_id}: {e}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(&self, case: &Case, reason: &str) -> BackendResult<()> {
        let (community_id, user_id) = (case.community_id, case.subject_id);
        match case.kind {
            CaseKind::Ban => self.call(self.backend.apply_ban(community_id, user_id, reason)).await,
            CaseKind::Unban => {
                self.call(self.backend.revoke_ban(community_id, user_id, reason))
                    .await
            }
            CaseKind::Kick => self.call(self.backend.kick(community_id, user_id, reason)).await,
            CaseKind::Mute | CaseKind::Unmute => {
                let role_id = case.attributes.muted_role_id.unwrap_or_default();
                if case.kind == CaseKind::Mute {
                    self.call(self.backend.apply_mute(community_id, user_id, role_id, reason))
                        .await
                } else {
                    self.call(self.backend.revoke_mute(community_id, user_id, role_id, reason))
                        .await
                }
            }
            CaseKind::Warn => Ok(()),
        }
    }

    async fn lift(&self, case: &Case, reason: &str) -> BackendResult<()> {
        lift_sanction(
            self.backend.as_ref(),
            case,
            reason,
            self.config.backend_timeout(),
        )
        .await
    }

    async fn call<T>(&self, call: impl Future<Output = BackendResult<T>>) -> BackendResult<T> {
        within(self.config.backend_timeout(), call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::backend::MockEnforcementBackend;
    use crate::moderation::notifier::RecordingListener;
    use crate::moderation::{BackendError, MemoryStore};
    use chrono::Duration as ChronoDuration;

    fn config() -> ModeratorConfig {
        ModeratorConfig {
            sweep_interval_ms: 3_600_000,
            ..ModeratorConfig::default()
        }
    }

    /// Backend on which every lookup succeeds
    fn resolving_backend() -> MockEnforcementBackend {
        let mut backend = MockEnforcementBackend::new();
        backend.expect_is_ready().return_const(true);
        backend.expect_resolve_community().returning(|_| Ok(()));
        backend.expect_resolve_member().returning(|_, _| Ok(()));
        backend
    }

    struct Harness {
        moderator: Moderator,
        store: Arc<MemoryStore>,
        listener: Arc<RecordingListener>,
    }

    async fn harness(backend: MockEnforcementBackend) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let moderator = Moderator::with_store(config(), store.clone(), Arc::new(backend));
        let listener = Arc::new(RecordingListener::default());
        moderator.subscribe(listener.clone());
        moderator.init().await.unwrap();
        Harness {
            moderator,
            store,
            listener,
        }
    }

    fn mute_request(duration: Duration) -> SanctionRequest {
        SanctionRequest::new(1, 11, 21)
            .duration(duration)
            .reason("spam")
            .muted_role(77)
    }

    #[tokio::test]
    async fn test_timed_mute_expires_after_sweep() {
        let mut backend = resolving_backend();
        backend
            .expect_apply_mute()
            .withf(|community, user, role, reason| {
                *community == 1 && *user == 21 && *role == 77 && reason == "Muted by 11 for spam."
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        backend
            .expect_revoke_mute()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let h = harness(backend).await;

        let case = h.moderator.mute(mute_request(Duration::from_millis(1000))).await.unwrap();
        let found = h.moderator.find(&case.id).unwrap();
        assert!(!found.ended);
        assert_eq!(found.reason, "spam");
        assert!(found.remaining_time(case.created_at).unwrap() > ChronoDuration::zero());

        let report = h
            .moderator
            .sweep_at(case.created_at + ChronoDuration::milliseconds(1001))
            .await
            .unwrap();
        assert_eq!(report.entries.len(), 1);
        assert!(h.moderator.find(&case.id).unwrap().ended);
        assert_eq!(
            h.listener.events(),
            vec![format!("create:{}", case.id), format!("delete:{}", case.id)]
        );
    }

    #[tokio::test]
    async fn test_end_twice() {
        let mut backend = resolving_backend();
        backend.expect_apply_mute().returning(|_, _, _, _| Ok(()));
        backend
            .expect_revoke_mute()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let h = harness(backend).await;
        let case = h.moderator.mute(mute_request(Duration::from_secs(600))).await.unwrap();

        let ended = h.moderator.end(&case.id).await.unwrap();
        assert!(ended.ended);
        assert!(h.listener.events().contains(&format!("delete:{}", case.id)));

        let second = h.moderator.end(&case.id).await;
        assert!(matches!(second, Err(ModerationError::AlreadyEnded(_))));
        assert_eq!(
            h.listener
                .events()
                .iter()
                .filter(|e| e.starts_with("delete:"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_edit_add_time() {
        let mut backend = resolving_backend();
        backend.expect_apply_ban().returning(|_, _, _| Ok(()));
        backend.expect_revoke_ban().returning(|_, _, _| Ok(()));
        let h = harness(backend).await;
        let case = h
            .moderator
            .ban(SanctionRequest::new(1, 11, 21).duration(Duration::from_secs(3600)))
            .await
            .unwrap();
        let original_end = case.expires_at.unwrap();

        let edited = h
            .moderator
            .edit(
                &case.id,
                CaseEdit {
                    add_time_ms: Some(-10_000),
                    reason: Some("misunderstanding".to_string()),
                    ..CaseEdit::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            edited.expires_at.unwrap(),
            original_end - ChronoDuration::milliseconds(10_000)
        );
        assert_eq!(edited.reason, "misunderstanding");
        assert_eq!(h.moderator.find(&case.id).unwrap(), edited);
        assert!(h.listener.events().contains(&format!("update:{}", case.id)));

        h.moderator.end(&case.id).await.unwrap();
        let result = h
            .moderator
            .edit(
                &case.id,
                CaseEdit {
                    add_time_ms: Some(-10_000),
                    ..CaseEdit::default()
                },
            )
            .await;
        assert!(matches!(result, Err(ModerationError::AlreadyEnded(_))));
    }

    #[tokio::test]
    async fn test_edit_set_end_timestamp_wins() {
        let mut backend = resolving_backend();
        backend.expect_apply_ban().returning(|_, _, _| Ok(()));
        let h = harness(backend).await;
        let case = h
            .moderator
            .ban(SanctionRequest::new(1, 11, 21).duration(Duration::from_secs(3600)))
            .await
            .unwrap();
        let end = case.created_at + ChronoDuration::seconds(42);

        let edited = h
            .moderator
            .edit(
                &case.id,
                CaseEdit {
                    add_time_ms: Some(60_000),
                    set_end_timestamp: Some(end),
                    ..CaseEdit::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(edited.expires_at, Some(end));
    }

    #[tokio::test]
    async fn test_edit_rejects_end_before_creation() {
        let mut backend = resolving_backend();
        backend.expect_apply_ban().returning(|_, _, _| Ok(()));
        let h = harness(backend).await;
        let case = h
            .moderator
            .ban(SanctionRequest::new(1, 11, 21).duration(Duration::from_secs(5)))
            .await
            .unwrap();

        let result = h
            .moderator
            .edit(
                &case.id,
                CaseEdit {
                    add_time_ms: Some(-10_000),
                    ..CaseEdit::default()
                },
            )
            .await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));
        assert_eq!(h.moderator.find(&case.id).unwrap(), case);

        let result = h.moderator.edit(&case.id, CaseEdit::default()).await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_corrupt_storage_aborts_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cases.json");
        std::fs::write(&path, r#"{"cases": []}"#).unwrap();

        let mut backend = MockEnforcementBackend::new();
        backend.expect_is_ready().times(0);
        let moderator = Moderator::new(
            ModeratorConfig {
                storage_path: path,
                ..config()
            },
            Arc::new(backend),
        );

        let result = moderator.init().await;
        assert!(matches!(result, Err(ModerationError::StorageCorrupt(_))));
        assert!(!moderator.is_ready());
        assert!(moderator.sweeper.lock().await.is_none());
        assert!(matches!(
            moderator.sweep_at(Utc::now()).await,
            Err(ModerationError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_commands_before_init_are_not_ready() {
        let store = Arc::new(MemoryStore::new());
        let moderator =
            Moderator::with_store(config(), store.clone(), Arc::new(resolving_backend()));

        let result = moderator
            .warn(SanctionRequest::new(1, 11, 21).reason("rude"))
            .await;
        assert!(matches!(result, Err(ModerationError::NotReady)));
        assert!(matches!(moderator.cases(), Err(ModerationError::NotReady)));
        assert!(matches!(
            moderator.end(&CaseId::generate()).await,
            Err(ModerationError::NotReady)
        ));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let h = harness(resolving_backend()).await;
        h.moderator.init().await.unwrap();
        assert!(h.moderator.is_ready());
        h.moderator.shutdown().await;
        assert!(h.moderator.sweeper.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_mute_failure_records_nothing() {
        let mut backend = resolving_backend();
        backend
            .expect_apply_mute()
            .returning(|_, _, _, _| Err(BackendError::Failed("missing permissions".into())));
        let h = harness(backend).await;

        let result = h.moderator.mute(mute_request(Duration::from_secs(60))).await;
        assert!(matches!(result, Err(ModerationError::Enforcement(_))));
        assert!(h.moderator.cases().unwrap().is_empty());
        assert_eq!(h.store.write_count(), 0);
        assert!(h.listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_kick_failure_is_still_recorded() {
        let mut backend = resolving_backend();
        backend
            .expect_kick()
            .returning(|_, _, _| Err(BackendError::Failed("hierarchy".into())));
        let h = harness(backend).await;

        let case = h
            .moderator
            .kick(SanctionRequest::new(1, 11, 21).reason("ads"))
            .await
            .unwrap();
        assert!(case.ended);
        assert_eq!(h.store.saved(), vec![case]);
    }

    #[tokio::test]
    async fn test_permanent_ban_is_created_ended() {
        let mut backend = resolving_backend();
        backend
            .expect_apply_ban()
            .withf(|_, _, reason| reason == "Banned by mod#1 for No reason specified.")
            .returning(|_, _, _| Ok(()));
        let h = harness(backend).await;

        let case = h
            .moderator
            .ban(SanctionRequest::new(1, 11, 21).actor_tag("mod#1"))
            .await
            .unwrap();
        assert!(case.ended);
        assert!(case.expires_at.is_none());
        assert_eq!(case.reason, crate::moderation::DEFAULT_REASON);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        // No backend expectation: validation must fail before any platform call
        let h = harness(MockEnforcementBackend::new()).await;

        let result = h.moderator.warn(SanctionRequest::new(1, 11, 21)).await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));

        let result = h
            .moderator
            .kick(SanctionRequest::new(1, 11, 21).reason("   "))
            .await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));

        let result = h
            .moderator
            .mute(SanctionRequest::new(1, 11, 21).duration(Duration::from_secs(60)))
            .await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));

        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_member_is_validation_error() {
        let mut backend = MockEnforcementBackend::new();
        backend.expect_is_ready().return_const(true);
        backend.expect_resolve_member().returning(|_, user| {
            if user == 21 {
                Err(BackendError::Unresolvable("unknown member".into()))
            } else {
                Ok(())
            }
        });
        let h = harness(backend).await;

        let result = h
            .moderator
            .warn(SanctionRequest::new(1, 11, 21).reason("rude"))
            .await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unban() {
        let mut backend = resolving_backend();
        backend
            .expect_is_banned()
            .returning(|_, user| Ok(user == 21));
        backend
            .expect_revoke_ban()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let h = harness(backend).await;

        let result = h.moderator.unban(SanctionRequest::new(1, 11, 22)).await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));

        let case = h.moderator.unban(SanctionRequest::new(1, 11, 21)).await.unwrap();
        assert_eq!(case.kind, CaseKind::Unban);
        assert!(case.ended);
    }

    #[tokio::test]
    async fn test_warn_and_unmute_are_instantaneous() {
        let mut backend = resolving_backend();
        backend
            .expect_revoke_mute()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let h = harness(backend).await;

        let warn = h
            .moderator
            .warn(SanctionRequest::new(1, 11, 21).reason("rude"))
            .await
            .unwrap();
        let unmute = h
            .moderator
            .unmute(SanctionRequest::new(1, 11, 21).muted_role(77))
            .await
            .unwrap();

        assert!(warn.ended && unmute.ended);
        assert_eq!(h.moderator.cases_for(1, 21).unwrap(), vec![warn, unmute]);
        assert!(h.moderator.cases_for(2, 21).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_ban_failure_keeps_case_active() {
        let mut backend = resolving_backend();
        backend.expect_apply_ban().returning(|_, _, _| Ok(()));
        backend
            .expect_revoke_ban()
            .returning(|_, _, _| Err(BackendError::Failed("rate limited".into())));
        let h = harness(backend).await;
        let case = h
            .moderator
            .ban(SanctionRequest::new(1, 11, 21).duration(Duration::from_secs(60)))
            .await
            .unwrap();

        let result = h.moderator.end(&case.id).await;
        assert!(matches!(result, Err(ModerationError::Enforcement(_))));
        assert!(!h.moderator.find(&case.id).unwrap().ended);
    }

    #[tokio::test]
    async fn test_end_mute_failure_still_ends_case() {
        let mut backend = resolving_backend();
        backend.expect_apply_mute().returning(|_, _, _, _| Ok(()));
        backend
            .expect_revoke_mute()
            .returning(|_, _, _, _| Err(BackendError::Failed("role is managed".into())));
        let h = harness(backend).await;
        let case = h.moderator.mute(mute_request(Duration::from_secs(60))).await.unwrap();

        let result = h.moderator.end(&case.id).await;
        assert!(matches!(result, Err(ModerationError::Enforcement(_))));
        assert!(h.moderator.find(&case.id).unwrap().ended);
        assert!(h.listener.events().contains(&format!("delete:{}", case.id)));
    }

    #[tokio::test]
    async fn test_end_mute_with_departed_subject_changes_nothing() {
        let mut backend = MockEnforcementBackend::new();
        backend.expect_is_ready().return_const(true);
        backend.expect_resolve_community().returning(|_| Ok(()));
        backend.expect_apply_mute().returning(|_, _, _, _| Ok(()));
        // Subject 21 resolves while the mute is applied, then leaves
        let calls = std::sync::atomic::AtomicUsize::new(0);
        backend.expect_resolve_member().returning(move |_, user| {
            if user == 21 && calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                Err(BackendError::Unresolvable("unknown member".into()))
            } else {
                Ok(())
            }
        });
        backend.expect_revoke_mute().times(0);
        let h = harness(backend).await;
        let case = h.moderator.mute(mute_request(Duration::from_secs(60))).await.unwrap();

        let result = h.moderator.end(&case.id).await;
        assert!(matches!(result, Err(ModerationError::UnresolvableTarget(_))));
        assert!(!h.moderator.find(&case.id).unwrap().ended);
        assert_eq!(h.listener.events(), vec![format!("create:{}", case.id)]);
    }

    #[tokio::test]
    async fn test_end_with_unresolvable_community() {
        let mut backend = MockEnforcementBackend::new();
        backend.expect_is_ready().return_const(true);
        backend.expect_resolve_member().returning(|_, _| Ok(()));
        backend.expect_apply_ban().returning(|_, _, _| Ok(()));
        backend
            .expect_resolve_community()
            .returning(|_| Err(BackendError::Unresolvable("left guild".into())));
        backend.expect_revoke_ban().times(0);
        let h = harness(backend).await;
        let case = h
            .moderator
            .ban(SanctionRequest::new(1, 11, 21).duration(Duration::from_secs(60)))
            .await
            .unwrap();

        let result = h.moderator.end(&case.id).await;
        assert!(matches!(result, Err(ModerationError::UnresolvableTarget(_))));
        assert!(!h.moderator.find(&case.id).unwrap().ended);
    }

    #[tokio::test]
    async fn test_delete_lifts_and_removes() {
        let mut backend = resolving_backend();
        backend.expect_apply_ban().returning(|_, _, _| Ok(()));
        backend
            .expect_revoke_ban()
            .times(1)
            .returning(|_, _, _| Err(BackendError::Failed("already unbanned".into())));
        let h = harness(backend).await;
        let case = h
            .moderator
            .ban(SanctionRequest::new(1, 11, 21).duration(Duration::from_secs(60)))
            .await
            .unwrap();

        let removed = h
            .moderator
            .delete(
                &case.id,
                DeleteOptions {
                    actor_id: Some(11),
                    reason: Some("duplicate".to_string()),
                },
            )
            .await
            .unwrap();
        assert!(removed.ended);
        assert!(matches!(
            h.moderator.find(&case.id),
            Err(ModerationError::NotFound(_))
        ));
        assert!(h.store.saved().is_empty());
        assert_eq!(
            h.listener.events(),
            vec![format!("create:{}", case.id), format!("delete:{}", case.id)]
        );
    }

    #[tokio::test]
    async fn test_storage_failure_fails_command() {
        let h = harness(resolving_backend()).await;
        h.store.set_fail_writes(true);

        let result = h
            .moderator
            .warn(SanctionRequest::new(1, 11, 21).reason("rude"))
            .await;
        assert!(matches!(result, Err(ModerationError::StorageIo { .. })));
        assert!(h.moderator.cases().unwrap().is_empty());
        assert!(h.listener.events().is_empty());
    }
}
