//! Expiration sweeper
//!
//! Periodically walks the active cases, reverses the ones whose deadline has
//! passed and marks them ended. Cases are handled one after the other; a
//! failure on one case never stops the rest of the tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::moderation::backend::{impose_sanction, lift_sanction, within};
use crate::moderation::{
    BackendResult, Case, CaseId, CaseRegistry, EnforcementBackend, EventNotifier, now_millis,
};

/// Requests accepted by a running sweeper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepRequest {
    /// Run a tick right away
    SweepNow,
    /// Stop the sweep loop
    Shutdown,
}

/// What a tick did with one case
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The sanction was lifted and the case ended
    Reversed,
    /// Lifting the sanction failed; the case was ended anyway
    ReversalFailed(String),
    /// The community or member is gone; the case was ended without a reversal
    Unresolvable(String),
    /// The case could not be marked ended and will be retried next tick
    StorageFailed(String),
    /// The case was extended while its sanction was being lifted; the
    /// sanction was put back and the case stays active
    Extended,
    /// The case was extended during the lift but the sanction could not be
    /// put back; the case stays active
    ReapplyFailed(String),
}

impl SweepOutcome {
    /// Whether the tick ended the case
    #[must_use]
    pub fn ends_case(&self) -> bool {
        matches!(
            self,
            Self::Reversed | Self::ReversalFailed(_) | Self::Unresolvable(_)
        )
    }
}

/// Result of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Set when the tick did nothing because the platform was not ready or there were no cases
    pub skipped: bool,
    pub entries: Vec<(CaseId, SweepOutcome)>,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn outcome(&self, id: &CaseId) -> Option<&SweepOutcome> {
        self.entries
            .iter()
            .find(|(case_id, _)| case_id == id)
            .map(|(_, outcome)| outcome)
    }

    /// Number of cases this tick ended
    #[must_use]
    pub fn ended_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, outcome)| outcome.ends_case())
            .count()
    }
}

/// Handle to a spawned sweep loop
#[derive(Debug)]
pub struct SweeperHandle {
    tx: Sender<SweepRequest>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Ask the loop to run a tick now
    pub async fn sweep_now(&self) {
        if let Err(e) = self.tx.send(SweepRequest::SweepNow).await {
            error!("Failed to send sweep request: {e}");
        }
    }

    /// Stop the loop and wait for it to finish its current tick
    pub async fn shutdown(self) {
        if self.tx.send(SweepRequest::Shutdown).await.is_err() {
            warn!("Sweep loop already stopped");
        }
        if let Err(e) = self.task.await {
            error!("Sweep loop ended abnormally: {e}");
        }
    }
}

/// Periodic task that ends expired cases
#[derive(Clone)]
pub struct Sweeper {
    registry: Arc<CaseRegistry>,
    backend: Arc<dyn EnforcementBackend>,
    notifier: Arc<EventNotifier>,
    interval: Duration,
    backend_timeout: Duration,
}

impl Sweeper {
    pub fn new(
        registry: Arc<CaseRegistry>,
        backend: Arc<dyn EnforcementBackend>,
        notifier: Arc<EventNotifier>,
        interval: Duration,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            notifier,
            interval: interval.max(Duration::from_millis(1)),
            backend_timeout,
        }
    }

    /// Spawn the sweep loop on the current runtime
    #[must_use]
    pub fn spawn(self) -> SweeperHandle {
        let (tx, rx) = mpsc::channel::<SweepRequest>(16);
        let task = tokio::spawn(async move {
            self.run(rx).await;
        });
        SweeperHandle { tx, task }
    }

    /// Run one tick against the current time
    pub async fn tick(&self) -> SweepReport {
        self.tick_at(now_millis()).await
    }

    /// Run one tick as if the current time were `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> SweepReport {
        if !self.backend.is_ready() || self.registry.is_empty() {
            return SweepReport::skipped();
        }

        let mut report = SweepReport::default();
        for case in self.registry.active() {
            if let Some(outcome) = self.sweep_case(&case, now).await {
                report.entries.push((case.id.clone(), outcome));
            }
        }
        report
    }

    async fn sweep_case(&self, case: &Case, now: DateTime<Utc>) -> Option<SweepOutcome> {
        let community = within(
            self.backend_timeout,
            self.backend.resolve_community(case.community_id),
        )
        .await;

        match community {
            Err(e) if e.is_unresolvable() => {
                warn!(
                    case_id = %case.id,
                    community_id = case.community_id,
                    error = %e,
                    "Community no longer reachable, ending case without reversal"
                );
                return Some(self.finish_unresolvable(case, e.to_string()).await);
            }
            Err(e) if !case.is_due(now) => {
                warn!(case_id = %case.id, error = %e, "Could not check community of active case");
                return None;
            }
            _ => {}
        }

        if !case.is_due(now) {
            return None;
        }

        // Earlier cases in this tick may have taken a while; an edit could
        // have extended or ended this one since the tick started
        let case = match self.registry.find(&case.id) {
            Ok(current) if current.is_due(now) => current,
            _ => return None,
        };
        let case = &case;

        let outcome = match self.reverse(case).await {
            Ok(()) => SweepOutcome::Reversed,
            Err(e) if e.is_unresolvable() => {
                warn!(case_id = %case.id, error = %e, "Sanction target gone, ending case");
                SweepOutcome::Unresolvable(e.to_string())
            }
            Err(e) => {
                error!(
                    case_id = %case.id,
                    kind = %case.kind,
                    subject_id = case.subject_id,
                    error = %e,
                    "Failed to reverse expired sanction, ending case anyway"
                );
                SweepOutcome::ReversalFailed(e.to_string())
            }
        };
        Some(self.finish(case, outcome).await)
    }

    async fn reverse(&self, case: &Case) -> BackendResult<()> {
        let reason = format!("Sanction expired (case {})", case.id);
        lift_sanction(self.backend.as_ref(), case, &reason, self.backend_timeout).await
    }

    async fn finish_unresolvable(&self, case: &Case, error: String) -> SweepOutcome {
        let outcome = SweepOutcome::Unresolvable(error);
        match self.registry.end_if_active(&case.id).await {
            Ok(Some(ended)) => {
                self.notify_ended(&ended);
                outcome
            }
            // Ended concurrently by a foreground command
            Ok(None) => outcome,
            Err(e) => {
                error!(case_id = %case.id, error = %e, "Failed to mark case as ended");
                SweepOutcome::StorageFailed(e.to_string())
            }
        }
    }

    /// End the case only if its expiry is still the one that was reversed
    async fn finish(&self, reversed: &Case, outcome: SweepOutcome) -> SweepOutcome {
        let ended = self
            .registry
            .end_if(&reversed.id, |current| {
                current.expires_at == reversed.expires_at
            })
            .await;

        match ended {
            Ok(Some(ended)) => {
                self.notify_ended(&ended);
                outcome
            }
            Ok(None) => match self.registry.find(&reversed.id) {
                Ok(current) if !current.ended => self.reinstate(&current, outcome).await,
                // Ended or deleted concurrently by a foreground command
                _ => outcome,
            },
            Err(e) => {
                error!(case_id = %reversed.id, error = %e, "Failed to mark expired case as ended");
                SweepOutcome::StorageFailed(e.to_string())
            }
        }
    }

    /// The case was extended while the lift was in flight; undo the lift
    async fn reinstate(&self, case: &Case, lifted: SweepOutcome) -> SweepOutcome {
        if lifted != SweepOutcome::Reversed {
            info!(case_id = %case.id, "Case extended during sweep, keeping it active");
            return SweepOutcome::Extended;
        }

        let reason = format!("Sanction extended (case {})", case.id);
        match impose_sanction(self.backend.as_ref(), case, &reason, self.backend_timeout).await {
            Ok(()) => {
                warn!(
                    case_id = %case.id,
                    expires_at = ?case.expires_at,
                    "Case extended while its sanction was lifted, sanction reapplied"
                );
                SweepOutcome::Extended
            }
            Err(e) => {
                error!(
                    case_id = %case.id,
                    kind = %case.kind,
                    subject_id = case.subject_id,
                    error = %e,
                    "Case extended while its sanction was lifted, failed to reapply"
                );
                SweepOutcome::ReapplyFailed(e.to_string())
            }
        }
    }

    fn notify_ended(&self, ended: &Case) {
        info!(case_id = %ended.id, kind = %ended.kind, "Expired case ended");
        self.notifier.case_delete(ended);
    }

    async fn run(self, mut rx: Receiver<SweepRequest>) {
        info!("Starting expiration sweep with {:?} interval", self.interval);

        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(SweepRequest::SweepNow) => {
                        info!("Received request to sweep now");
                        self.log_report(&self.tick().await);
                    }
                    Some(SweepRequest::Shutdown) | None => {
                        info!("Received shutdown request for expiration sweep");
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.log_report(&self.tick().await);
                }
            }
        }

        info!("Expiration sweep shut down");
    }

    fn log_report(&self, report: &SweepReport) {
        if !report.entries.is_empty() {
            info!(
                ended = report.ended_count(),
                kept = report.entries.len() - report.ended_count(),
                active = self.registry.active().len(),
                "Expiration sweep finished"
            );
        }
    }
}
