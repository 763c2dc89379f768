//! Case entity
//!
//! A `Case` is an immutable snapshot of one sanction record. Every change to a
//! case produces a new snapshot which replaces the old one by ID in the registry.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use derive_more::{Display, FromStr};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::moderation::{ModerationError, ModerationResult};

/// Reason stored when the issuer did not give one
pub const DEFAULT_REASON: &str = "No reason specified";

/// Unique case identifier. UUIDv7, so IDs sort by creation time.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, FromStr, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CaseId(Uuid);

impl CaseId {
    /// Generate a fresh ID, ordered after every ID generated before it in this process
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Kind of sanction a case records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseKind {
    Ban,
    Unban,
    Mute,
    Unmute,
    Warn,
    Kick,
}

impl CaseKind {
    /// Kinds whose effect is complete the moment they are applied
    #[must_use]
    pub fn is_instantaneous(self) -> bool {
        matches!(self, Self::Unban | Self::Unmute | Self::Warn | Self::Kick)
    }

    /// Past-tense verb used in platform audit log reasons
    #[must_use]
    pub fn audit_verb(self) -> &'static str {
        match self {
            Self::Ban => "Banned",
            Self::Unban => "Un-banned",
            Self::Mute => "Muted",
            Self::Unmute => "Un-muted",
            Self::Warn => "Warned",
            Self::Kick => "Kicked",
        }
    }
}

impl fmt::Display for CaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ban => write!(f, "ban"),
            Self::Unban => write!(f, "unban"),
            Self::Mute => write!(f, "mute"),
            Self::Unmute => write!(f, "unmute"),
            Self::Warn => write!(f, "warn"),
            Self::Kick => write!(f, "kick"),
        }
    }
}

/// Kind-specific data needed to reverse a sanction later
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseAttributes {
    /// Role granted by a mute
    #[serde(
        rename = "mutedRoleID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub muted_role_id: Option<u64>,
}

impl CaseAttributes {
    #[must_use]
    pub fn muted_role(role_id: u64) -> Self {
        Self {
            muted_role_id: Some(role_id),
        }
    }
}

fn default_reason() -> String {
    DEFAULT_REASON.to_string()
}

/// Current time at the millisecond precision cases are persisted with
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// One sanction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub kind: CaseKind,
    #[serde(rename = "createdAt", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "communityID")]
    pub community_id: u64,
    #[serde(rename = "actorID")]
    pub actor_id: u64,
    #[serde(rename = "subjectID")]
    pub subject_id: u64,
    /// `None` means the sanction never expires
    #[serde(
        rename = "expiresAt",
        with = "chrono::serde::ts_milliseconds_option",
        default
    )]
    pub expires_at: Option<DateTime<Utc>>,
    pub ended: bool,
    #[serde(default = "default_reason")]
    pub reason: String,
    #[serde(default)]
    pub attributes: CaseAttributes,
}

impl Case {
    /// Build a case without an expiry. It starts out ended, since nothing is left to reverse.
    pub fn new(
        kind: CaseKind,
        community_id: u64,
        actor_id: u64,
        subject_id: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: CaseId::generate(),
            kind,
            created_at: now_millis(),
            community_id,
            actor_id,
            subject_id,
            expires_at: None,
            ended: true,
            reason: reason.into(),
            attributes: CaseAttributes::default(),
        }
    }

    /// Bound the case by a duration counted from its creation.
    ///
    /// A zero or absent duration means "no expiry". Instantaneous kinds ignore
    /// the duration and stay ended.
    ///
    /// # Errors
    /// Returns a validation error if the duration cannot be represented.
    pub fn with_duration(mut self, duration: Option<std::time::Duration>) -> ModerationResult<Self> {
        let duration = duration.filter(|d| !d.is_zero());
        self.expires_at = match duration {
            Some(duration) if !self.kind.is_instantaneous() => {
                let duration = i64::try_from(duration.as_millis())
                    .ok()
                    .and_then(Duration::try_milliseconds)
                    .ok_or_else(|| {
                        ModerationError::Validation(format!("invalid duration: {duration:?}"))
                    })?;
                let expires_at = self.created_at.checked_add_signed(duration).ok_or_else(|| {
                    ModerationError::Validation("duration is out of range".to_string())
                })?;
                Some(expires_at)
            }
            _ => None,
        };
        self.ended = self.kind.is_instantaneous() || self.expires_at.is_none();
        Ok(self)
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: CaseAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Snapshot of this case with `ended` set
    #[must_use]
    pub fn into_ended(mut self) -> Self {
        self.ended = true;
        self
    }

    /// Time left before expiry, `None` when the case has no expiry
    #[must_use]
    pub fn remaining_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|expires_at| expires_at - now)
    }

    /// Whether the sweep still has to look at this case
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.ended && self.expires_at.is_some()
    }

    /// Whether the case is active and its deadline has passed
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active()
            && self
                .remaining_time(now)
                .is_some_and(|remaining| remaining <= Duration::zero())
    }

    /// Reason text handed to the platform's audit log
    #[must_use]
    pub fn audit_reason(&self, actor: &str) -> String {
        format!("{} by {actor} for {}.", self.kind.audit_verb(), self.reason)
    }
}
