//! Moderation case lifecycle
//!
//! Every sanction issued in a community is recorded as a case. Cases are kept
//! in a registry backed by a JSON document, time-bounded cases are lifted by a
//! periodic sweep, and lifecycle notifications go out to subscribed listeners.

mod backend;
mod case;
mod discord;
mod error;
mod notifier;
mod registry;
mod service;
mod storage;
mod sweeper;

pub use backend::EnforcementBackend;
pub use case::{Case, CaseAttributes, CaseId, CaseKind, DEFAULT_REASON, now_millis};
pub use discord::SerenityBackend;
pub use error::{BackendError, BackendResult, ModerationError, ModerationResult};
pub use notifier::{CaseListener, EventNotifier};
pub use registry::CaseRegistry;
pub use service::{CaseEdit, DeleteOptions, Moderator, SanctionRequest};
pub use storage::{CaseStore, JsonFileStore, MemoryStore};
pub use sweeper::{SweepOutcome, SweepReport, SweepRequest, Sweeper, SweeperHandle};

#[cfg(test)]
pub(crate) use backend::MockEnforcementBackend;
#[cfg(test)]
pub(crate) use notifier::RecordingListener;
