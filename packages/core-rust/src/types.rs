use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque identifier of the member an action targets.
///
/// Used as the serialization key: at most one action per subject is in
/// flight at any instant. Carries no identity beyond the action's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub u64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SubjectId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of the moderator issuing an action. Recorded for audit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub u64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ActorId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// How disruptive an action is for the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Reversible or informational (warnings, notes, unbans).
    Low,
    /// Temporarily removes the subject or their content.
    Medium,
    /// Removes the subject from the community.
    High,
}

/// Policy-selection label for an action.
///
/// Every kind carries its own retry, breaker and timeout defaults; see
/// `modguard_executor::resilience::policy`. Labels arriving from the command
/// layer are parsed with [`FromStr`], which rejects anything not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Ban,
    Unban,
    Kick,
    Softban,
    Timeout,
    RemoveTimeout,
    Warn,
    Note,
    Purge,
    RoleUpdate,
    /// Direct-message or fallback-channel notice to the subject.
    Notification,
    /// Case record written to the persistence layer.
    CaseRecord,
    /// Any other call against the remote service's API.
    ExternalApi,
}

impl OperationKind {
    /// All kinds, in declaration order.
    pub const ALL: [OperationKind; 13] = [
        Self::Ban,
        Self::Unban,
        Self::Kick,
        Self::Softban,
        Self::Timeout,
        Self::RemoveTimeout,
        Self::Warn,
        Self::Note,
        Self::Purge,
        Self::RoleUpdate,
        Self::Notification,
        Self::CaseRecord,
        Self::ExternalApi,
    ];

    /// Stable snake_case label, also used as the metrics label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Unban => "unban",
            Self::Kick => "kick",
            Self::Softban => "softban",
            Self::Timeout => "timeout",
            Self::RemoveTimeout => "remove_timeout",
            Self::Warn => "warn",
            Self::Note => "note",
            Self::Purge => "purge",
            Self::RoleUpdate => "role_update",
            Self::Notification => "notification",
            Self::CaseRecord => "case_record",
            Self::ExternalApi => "external_api",
        }
    }

    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::Ban | Self::Softban => Severity::High,
            Self::Kick | Self::Timeout | Self::Purge | Self::RoleUpdate => Severity::Medium,
            Self::Unban
            | Self::RemoveTimeout
            | Self::Warn
            | Self::Note
            | Self::Notification
            | Self::CaseRecord
            | Self::ExternalApi => Severity::Low,
        }
    }

    /// Whether the action removes the subject or their standing.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Ban | Self::Softban | Self::Kick)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a label does not name any [`OperationKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation kind: {label}")]
pub struct UnknownOperationKind {
    pub label: String,
}

impl FromStr for OperationKind {
    type Err = UnknownOperationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownOperationKind {
                label: s.to_string(),
            })
    }
}
