//! Case registry
//!
//! The authoritative in-memory case collection. Reads are served from snapshots;
//! every mutation runs under one lock, is persisted through the `CaseStore` and
//! only then becomes visible. A failed write leaves the registry untouched.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::moderation::{Case, CaseId, CaseStore, ModerationError, ModerationResult};

/// Registry of case snapshots keyed by ID
pub struct CaseRegistry {
    /// Committed snapshots
    cases: DashMap<CaseId, Case>,
    /// Durable copy
    store: Arc<dyn CaseStore>,
    /// Serializes every state transition with its write
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for CaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseRegistry")
            .field("cases", &self.cases.len())
            .finish_non_exhaustive()
    }
}

impl CaseRegistry {
    /// Load the registry from its store
    ///
    /// # Errors
    /// Propagates store errors. A document holding the same ID twice is `StorageCorrupt`.
    pub async fn load(store: Arc<dyn CaseStore>) -> ModerationResult<Self> {
        let loaded = store.load().await?;

        let mut seen = HashSet::with_capacity(loaded.len());
        if let Some(duplicate) = loaded.iter().find(|case| !seen.insert(case.id.clone())) {
            return Err(ModerationError::StorageCorrupt(format!(
                "case {} appears more than once",
                duplicate.id
            )));
        }

        let cases = DashMap::with_capacity(loaded.len());
        for case in loaded {
            cases.insert(case.id.clone(), case);
        }

        info!(count = cases.len(), "Case registry loaded");
        Ok(Self {
            cases,
            store,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Get the current snapshot of a case
    ///
    /// # Errors
    /// `NotFound` if no case has this ID.
    pub fn find(&self, id: &CaseId) -> ModerationResult<Case> {
        self.cases
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ModerationError::NotFound(id.clone()))
    }

    /// All cases, ordered by ID (creation order)
    #[must_use]
    pub fn all(&self) -> Vec<Case> {
        let mut cases: Vec<Case> = self.cases.iter().map(|e| e.value().clone()).collect();
        cases.sort_by(|a, b| a.id.cmp(&b.id));
        cases
    }

    /// Cases the sweep still has to watch
    #[must_use]
    pub fn active(&self) -> Vec<Case> {
        let mut cases: Vec<Case> = self
            .cases
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.value().clone())
            .collect();
        cases.sort_by(|a, b| a.id.cmp(&b.id));
        cases
    }

    /// All cases for a member of a community
    #[must_use]
    pub fn for_subject(&self, community_id: u64, subject_id: u64) -> Vec<Case> {
        self.all()
            .into_iter()
            .filter(|c| c.community_id == community_id && c.subject_id == subject_id)
            .collect()
    }

    /// Register a new case
    ///
    /// # Errors
    /// `DuplicateId` if the ID is taken, `StorageIo` if the write fails.
    pub async fn create(&self, case: Case) -> ModerationResult<Case> {
        let guard = self.write_lock.lock().await;
        if self.cases.contains_key(&case.id) {
            return Err(ModerationError::DuplicateId(case.id));
        }

        self.commit(&guard, Some(&case), None).await?;
        debug!(case_id = %case.id, kind = %case.kind, "Case created");
        Ok(case)
    }

    /// Replace a case with the snapshot computed by `mutate`
    ///
    /// Returns the previous and the new snapshot. Termination goes through
    /// [`Self::mark_ended`] instead; an ended case cannot be updated.
    ///
    /// # Errors
    /// `NotFound`, `AlreadyEnded`, `Validation` if `mutate` changes the ID or
    /// clears `ended`, `StorageIo` if the write fails.
    pub async fn update<F>(&self, id: &CaseId, mutate: F) -> ModerationResult<(Case, Case)>
    where
        F: FnOnce(&Case) -> ModerationResult<Case>,
    {
        let guard = self.write_lock.lock().await;
        let old = self.find(id)?;
        if old.ended {
            return Err(ModerationError::AlreadyEnded(id.clone()));
        }

        let new = mutate(&old)?;
        if new.id != old.id {
            return Err(ModerationError::Validation(format!(
                "an update cannot change the ID of case {id}"
            )));
        }

        self.commit(&guard, Some(&new), None).await?;
        debug!(case_id = %id, ended = new.ended, "Case updated");
        Ok((old, new))
    }

    /// End a case, returning the ended snapshot only if this call ended it
    ///
    /// # Errors
    /// `NotFound`, `StorageIo` if the write fails.
    pub async fn end_if_active(&self, id: &CaseId) -> ModerationResult<Option<Case>> {
        self.end_if(id, |_| true).await
    }

    /// End a case only if it is active and `still_applies` accepts its current
    /// snapshot. The check and the write happen under the mutation lock, so an
    /// edit committed in between is never overwritten.
    ///
    /// # Errors
    /// `NotFound`, `StorageIo` if the write fails.
    pub async fn end_if<F>(&self, id: &CaseId, still_applies: F) -> ModerationResult<Option<Case>>
    where
        F: FnOnce(&Case) -> bool,
    {
        let guard = self.write_lock.lock().await;
        let current = self.find(id)?;
        if current.ended || !still_applies(&current) {
            return Ok(None);
        }

        let ended = current.into_ended();
        self.commit(&guard, Some(&ended), None).await?;
        debug!(case_id = %id, "Case marked as ended");
        Ok(Some(ended))
    }

    /// End a case. Ending an already ended case is a no-op.
    ///
    /// # Errors
    /// `NotFound`, `StorageIo` if the write fails.
    pub async fn mark_ended(&self, id: &CaseId) -> ModerationResult<Case> {
        match self.end_if_active(id).await? {
            Some(ended) => Ok(ended),
            None => self.find(id),
        }
    }

    /// Force a case to ended, then delete it
    ///
    /// # Errors
    /// `NotFound`, `StorageIo` if either write fails.
    pub async fn remove(&self, id: &CaseId) -> ModerationResult<Case> {
        let guard = self.write_lock.lock().await;
        let mut removed = self.find(id)?;

        if !removed.ended {
            removed = removed.into_ended();
            self.commit(&guard, Some(&removed), None).await?;
        }

        self.commit(&guard, None, Some(id)).await?;
        debug!(case_id = %id, "Case removed");
        Ok(removed)
    }

    /// Persist the collection with `upsert`/`delete` applied, then apply it in memory.
    ///
    /// Callers must hold the write lock.
    async fn commit(
        &self,
        _guard: &MutexGuard<'_, ()>,
        upsert: Option<&Case>,
        delete: Option<&CaseId>,
    ) -> ModerationResult<()> {
        let mut next: Vec<Case> = self
            .all()
            .into_iter()
            .filter(|c| upsert.is_none_or(|u| u.id != c.id) && delete != Some(&c.id))
            .collect();
        if let Some(case) = upsert {
            next.push(case.clone());
            next.sort_by(|a, b| a.id.cmp(&b.id));
        }

        self.store.save_all(&next).await?;

        if let Some(case) = upsert {
            self.cases.insert(case.id.clone(), case.clone());
        }
        if let Some(id) = delete {
            self.cases.remove(id);
        }
        Ok(())
    }
}
