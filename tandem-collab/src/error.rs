use std::time::Duration;
use tandem_core::CoreError;
use thiserror::Error;
use uuid::Uuid;

use crate::participant::Permissions;

/// Errors surfaced by the session engine, its server and its client.
///
/// Hard-lock conflicts are not errors; they come back as
/// [`tandem_core::LockDecision::Denied`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    /// Transport dropped or unreachable. Retried with backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// The participant's role does not grant what the action needs.
    #[error("participant {participant} lacks {required:?}")]
    Permission {
        participant: Uuid,
        required: Permissions,
    },

    /// Malformed or inapplicable operation. Logged and dropped.
    #[error("invalid operation: {0}")]
    Validation(#[from] CoreError),

    #[error("session {session} is full ({max} participants)")]
    Capacity { session: Uuid, max: usize },

    #[error("range is hard-locked by {holder} (lock {lock})")]
    Locked { lock: Uuid, holder: Uuid },

    #[error("document {0} has no text content")]
    NoText(Uuid),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    TimedOut(Duration),
}

impl CollabError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    /// Worth retrying after a reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::TimedOut(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<std::io::Error> for CollabError {
    fn from(e: std::io::Error) -> Self {
        Self::Connection(e.to_string())
    }
}
