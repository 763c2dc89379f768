//! Case lifecycle notifications
//!
//! Listeners are called synchronously, after the mutation they describe has
//! been committed to storage.

use std::sync::{Arc, PoisonError, RwLock};

use crate::moderation::Case;

/// Receives case lifecycle notifications. Every method defaults to a no-op.
pub trait CaseListener: Send + Sync {
    /// A case was recorded
    fn case_create(&self, _case: &Case) {}

    /// A case was edited
    fn case_update(&self, _old: &Case, _new: &Case) {}

    /// A case was ended or deleted
    fn case_delete(&self, _case: &Case) {}
}

/// Fans notifications out to every subscribed listener
#[derive(Default)]
pub struct EventNotifier {
    listeners: RwLock<Vec<Arc<dyn CaseListener>>>,
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn CaseListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn case_create(&self, case: &Case) {
        for listener in self.snapshot() {
            listener.case_create(case);
        }
    }

    pub fn case_update(&self, old: &Case, new: &Case) {
        for listener in self.snapshot() {
            listener.case_update(old, new);
        }
    }

    pub fn case_delete(&self, case: &Case) {
        for listener in self.snapshot() {
            listener.case_delete(case);
        }
    }

    // Listeners run without the lock held so they may subscribe others
    fn snapshot(&self) -> Vec<Arc<dyn CaseListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Listener that keeps every notification, for tests
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub events: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl CaseListener for RecordingListener {
    fn case_create(&self, case: &Case) {
        self.events.lock().unwrap().push(format!("create:{}", case.id));
    }

    fn case_update(&self, old: &Case, new: &Case) {
        assert_eq!(old.id, new.id);
        self.events.lock().unwrap().push(format!("update:{}", new.id));
    }

    fn case_delete(&self, case: &Case) {
        self.events.lock().unwrap().push(format!("delete:{}", case.id));
    }
}
