use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::promotion::PromotionState;

/// Broad error category used for user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Input rejected locally before any network call.
    Validation,
    /// Referenced room or message is absent.
    NotFound,
    /// Backend call failed or answered `success: false`.
    Remote,
    /// Push channel failure.
    Subscription,
    /// A bounded wait or request ran out of time.
    Timeout,
    /// Engine bug or invariant break.
    Internal,
}

/// Stable engine error payload surfaced to collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds, when the backend supplied one.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    /// Construct a new engine error.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Remote, code, message)
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Subscription, "subscription_failed", message)
    }

    pub fn room_not_found(room_id: &str) -> Self {
        Self::new(
            ErrorCategory::NotFound,
            "room_not_found",
            format!("room not found: {room_id}"),
        )
    }

    /// Build a standard invalid-state-transition error for room promotion.
    pub fn invalid_state(current: &PromotionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while provisional room is in state {current:?}"),
        )
    }

    /// A call finished after `clear()` started a new session.
    pub fn session_reset(operation: &str) -> Self {
        Self::new(
            ErrorCategory::Internal,
            "session_reset",
            format!("{operation} finished after the engine was cleared"),
        )
    }

    pub(crate) fn poisoned() -> Self {
        Self::new(
            ErrorCategory::Internal,
            "state_poisoned",
            "engine state lock was poisoned",
        )
    }

    /// `true` for errors raised before any I/O happened.
    pub fn is_validation(&self) -> bool {
        self.category == ErrorCategory::Validation
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        404 => ErrorCategory::NotFound,
        408 | 504 => ErrorCategory::Timeout,
        400..=599 => ErrorCategory::Remote,
        _ => ErrorCategory::Internal,
    }
}
