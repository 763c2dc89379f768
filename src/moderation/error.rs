//! Error types for the moderation core
//!
//! `ModerationError` is what callers of the registry and the command surface see.
//! `BackendError` is what an `EnforcementBackend` reports back to the core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::moderation::CaseId;

/// Errors that can occur during moderation operations
#[derive(Debug, Error)]
pub enum ModerationError {
    /// Bad or missing input to a command
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The registry has not finished loading from storage
    #[error("The moderator is not ready yet")]
    NotReady,

    /// Unknown case ID
    #[error("No case found with ID {0}")]
    NotFound(CaseId),

    /// A case with this ID is already registered
    #[error("A case with ID {0} already exists")]
    DuplicateId(CaseId),

    /// The case is already ended and cannot be changed
    #[error("Case with ID {0} is already ended")]
    AlreadyEnded(CaseId),

    /// Reading or writing the case document failed
    #[error("Storage I/O error on {}: {source}", path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The case document is not a well-formed array of cases
    #[error("Storage corrupt: {0}")]
    StorageCorrupt(String),

    /// The platform action failed
    #[error("Enforcement failed: {0}")]
    Enforcement(String),

    /// The community or member can no longer be reached
    #[error("Target unresolvable: {0}")]
    UnresolvableTarget(String),
}

impl ModerationError {
    pub(crate) fn storage_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageIo {
            path: path.into(),
            source,
        }
    }
}

/// Errors reported by an enforcement backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The community or member does not exist (any more) from the backend's view
    #[error("{0}")]
    Unresolvable(String),

    /// The action was attempted and refused or failed
    #[error("{0}")]
    Failed(String),

    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<poise::serenity_prelude::Error>),

    /// The backend did not answer in time
    #[error("Backend call timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<poise::serenity_prelude::Error> for BackendError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

impl BackendError {
    #[must_use]
    pub fn is_unresolvable(&self) -> bool {
        matches!(self, Self::Unresolvable(_))
    }
}

impl From<BackendError> for ModerationError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unresolvable(message) => Self::UnresolvableTarget(message),
            other => Self::Enforcement(other.to_string()),
        }
    }
}

/// Result type for moderation operations
pub type ModerationResult<T> = Result<T, ModerationError>;

/// Result type for backend calls
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id: CaseId = "01890a5d-ac96-774b-bcce-b302099a8057".parse().unwrap();

        let error = ModerationError::NotFound(id.clone());
        assert_eq!(
            error.to_string(),
            "No case found with ID 01890a5d-ac96-774b-bcce-b302099a8057"
        );

        let error = ModerationError::AlreadyEnded(id);
        assert_eq!(
            error.to_string(),
            "Case with ID 01890a5d-ac96-774b-bcce-b302099a8057 is already ended"
        );

        let error = ModerationError::NotReady;
        assert_eq!(error.to_string(), "The moderator is not ready yet");

        let error = ModerationError::storage_io(
            "cases.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(error.to_string(), "Storage I/O error on cases.json: denied");
    }

    #[test]
    fn test_backend_error_conversion() {
        let error: ModerationError = BackendError::Unresolvable("guild 7 is gone".into()).into();
        assert!(matches!(error, ModerationError::UnresolvableTarget(ref m) if m == "guild 7 is gone"));

        let error: ModerationError = BackendError::Failed("missing permissions".into()).into();
        assert!(matches!(error, ModerationError::Enforcement(ref m) if m == "missing permissions"));

        let error: ModerationError = BackendError::TimedOut(Duration::from_secs(2)).into();
        assert_eq!(error.to_string(), "Enforcement failed: Backend call timed out after 2s");
    }
}
