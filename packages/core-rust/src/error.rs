//! Classification of failures surfaced by the remote moderation service.
//!
//! The remote service is opaque: its invoker reports each failure as a
//! [`RemoteError`] carrying an optional HTTP-like status and a
//! [`FailureClass`]. Retry and circuit-breaker decisions are made on the class
//! alone, never by inspecting the message.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What kind of failure the remote service reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class")]
pub enum FailureClass {
    /// The bot lacks permission for the action (403-class).
    Permission,
    /// The subject or resource no longer exists (404-class).
    NotFound,
    /// The remote service asked us to slow down (429-class).
    RateLimited {
        /// Wait hint supplied by the service, if any.
        #[serde(with = "opt_millis", default)]
        retry_after: Option<Duration>,
    },
    /// Server-side failure (5xx-class).
    Server,
    /// A remote failure that carried no usable status.
    Unclassified,
    /// A local fault in the invoker itself, not a signal about remote health.
    Internal,
}

impl FailureClass {
    /// Derive a class from an HTTP-like status code.
    #[must_use]
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::Permission,
            404 => Self::NotFound,
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::Server,
            _ => Self::Unclassified,
        }
    }

    /// Whether a failure of this class should ever be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Server | Self::Unclassified => true,
            Self::Permission | Self::NotFound | Self::Internal => false,
        }
    }

    /// Whether a failure of this class counts toward tripping a circuit breaker.
    ///
    /// Remote signals count, including permission and not-found responses.
    /// Local invoker faults propagate without touching breaker statistics.
    #[must_use]
    pub const fn counts_toward_breaker(&self) -> bool {
        match self {
            Self::Permission
            | Self::NotFound
            | Self::RateLimited { .. }
            | Self::Server
            | Self::Unclassified => true,
            Self::Internal => false,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server => "server",
            Self::Unclassified => "unclassified",
            Self::Internal => "internal",
        }
    }
}

/// A failure reported by the remote-action invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("remote {} error{}: {message}", .class.as_str(), .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct RemoteError {
    pub class: FailureClass,
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
        }
    }

    /// Build from a status code, classifying it with [`FailureClass::from_status`].
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::from_status(status, retry_after),
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::from_status(403, None, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::from_status(404, None, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::from_status(429, retry_after, message)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::from_status(status, None, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Internal, message)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            #[allow(clippy::cast_possible_truncation)]
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
