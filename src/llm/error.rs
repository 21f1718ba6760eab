//! LLM error types, including `RemoteUnknown` — the signal that triggers
//! Session recovery and is never surfaced to an HTTP caller.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Transport, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::RateLimit, message)
    }

    pub fn remote_unknown(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::RemoteUnknown, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidRequest, message)
    }
}

/// Error classification: `{transport, rate_limit, remote_unknown,
/// invalid_request}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Transport,
    RateLimit,
    /// The backend no longer recognizes the session's `remote_id`. Consumed
    /// entirely by the Session component, which treats it as a trigger for
    /// `recover_context` — never surfaced to a caller.
    RemoteUnknown,
    InvalidRequest,
}

impl LlmErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport | Self::RateLimit)
    }
}
