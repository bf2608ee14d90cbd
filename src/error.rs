//! Error taxonomy, client-visible envelope, and fault classification (C12,
//! spec.md §7). Reformulates the "exceptions as control flow" pattern in
//! the original as plain `Result` values at component boundaries; this
//! module is the single place a fault becomes a client-visible shape or a
//! recovery action.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, client-visible error codes (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    RateLimited,
    PermissionDenied,
    NotFound,
    Conflict,
    Internal,
    ConnectionError,
    SessionError,
    RoomStateError,
    NetworkError,
}

/// The wire shape of `{ error: { code, message, details?, retryAfter? } }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Internal fault kinds (spec.md §7). Not serialized to clients directly —
/// each maps to an [`ErrorEnvelope`] and a [`RecoveryAction`] via
/// [`classify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    NamespaceConnection,
    SessionManagement,
    RoomState,
    Validation,
    RateLimit,
    Permission,
    Database,
    Network,
    Unknown,
}

#[derive(Error, Debug, Clone)]
pub enum RoomFabricError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("room state error: {0}")]
    RoomState(String),
    #[error("namespace/connection error: {0}")]
    NamespaceConnection(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RoomFabricError {
    pub fn kind(&self) -> FaultKind {
        match self {
            RoomFabricError::Validation(_) => FaultKind::Validation,
            RoomFabricError::RateLimited { .. } => FaultKind::RateLimit,
            RoomFabricError::Permission(_) => FaultKind::Permission,
            RoomFabricError::NotFound(_) | RoomFabricError::Conflict(_) => FaultKind::RoomState,
            RoomFabricError::Session(_) => FaultKind::SessionManagement,
            RoomFabricError::RoomState(_) => FaultKind::RoomState,
            RoomFabricError::NamespaceConnection(_) => FaultKind::NamespaceConnection,
            RoomFabricError::Network(_) => FaultKind::Network,
            RoomFabricError::Internal(_) => FaultKind::Unknown,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        match self {
            RoomFabricError::Validation(msg) => {
                ErrorEnvelope::new(ErrorCode::ValidationError, msg.clone())
            }
            RoomFabricError::RateLimited { retry_after_secs } => {
                ErrorEnvelope::new(ErrorCode::RateLimited, "rate limit exceeded")
                    .with_retry_after(*retry_after_secs)
            }
            RoomFabricError::Permission(msg) => {
                ErrorEnvelope::new(ErrorCode::PermissionDenied, msg.clone())
            }
            RoomFabricError::NotFound(msg) => ErrorEnvelope::new(ErrorCode::NotFound, msg.clone()),
            RoomFabricError::Conflict(msg) => ErrorEnvelope::new(ErrorCode::Conflict, msg.clone()),
            RoomFabricError::Session(msg) => {
                ErrorEnvelope::new(ErrorCode::SessionError, msg.clone())
            }
            RoomFabricError::RoomState(msg) => {
                ErrorEnvelope::new(ErrorCode::RoomStateError, msg.clone())
            }
            RoomFabricError::NamespaceConnection(msg) => {
                ErrorEnvelope::new(ErrorCode::ConnectionError, msg.clone())
            }
            RoomFabricError::Network(msg) => {
                ErrorEnvelope::new(ErrorCode::NetworkError, msg.clone()).with_retry_after(5)
            }
            RoomFabricError::Internal(msg) => ErrorEnvelope::new(ErrorCode::Internal, msg.clone()),
        }
    }
}

/// What the dispatcher/transport layer should do about a fault, once
/// classified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    SendErrorResponse,
    CleanupSession,
    ResetRoomState,
    DisconnectSocket,
    LogOnly,
}

/// Patterns that force teardown regardless of flood suppression, per
/// spec.md §7.
const CRITICAL_PATTERNS: &[&str] = &[
    "out of memory",
    "stack overflow",
    "database connection lost",
    "server shutting down",
];

pub fn is_critical(message: &str) -> bool {
    let lower = message.to_lowercase();
    CRITICAL_PATTERNS.iter().any(|p| lower.contains(p))
}

fn recovery_action_for(kind: FaultKind) -> RecoveryAction {
    match kind {
        FaultKind::Validation | FaultKind::RateLimit | FaultKind::Permission => {
            RecoveryAction::SendErrorResponse
        }
        FaultKind::SessionManagement => RecoveryAction::CleanupSession,
        FaultKind::RoomState => RecoveryAction::ResetRoomState,
        FaultKind::NamespaceConnection | FaultKind::Network => RecoveryAction::SendErrorResponse,
        FaultKind::Database => RecoveryAction::DisconnectSocket,
        FaultKind::Unknown => RecoveryAction::LogOnly,
    }
}

/// Per-kind per-minute counters feeding flood suppression (spec.md §7: a
/// kind above 10/min is logged only, not re-sent to clients).
pub struct FloodSuppressor {
    counters: Mutex<HashMap<FaultKind, (Instant, u32)>>,
    threshold_per_minute: u32,
}

impl Default for FloodSuppressor {
    fn default() -> Self {
        Self::new(10)
    }
}

impl FloodSuppressor {
    pub fn new(threshold_per_minute: u32) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            threshold_per_minute,
        }
    }

    /// Records one occurrence of `kind` and returns whether it should be
    /// suppressed (logged only, not surfaced to the client).
    pub fn record_and_check(&self, kind: FaultKind) -> bool {
        let mut counters = self.counters.lock().unwrap();
        let now = Instant::now();
        let entry = counters
            .entry(kind)
            .or_insert_with(|| (now, 0));

        if now.duration_since(entry.0) > Duration::from_secs(60) {
            *entry = (now, 0);
        }

        entry.1 += 1;
        entry.1 > self.threshold_per_minute
    }
}

/// The outcome of classifying a fault: envelope to send (if any) plus the
/// action the caller must take.
pub struct Classification {
    pub envelope: Option<ErrorEnvelope>,
    pub action: RecoveryAction,
    pub force_teardown: bool,
}

/// Pure classifier: given an error and the flood suppressor, decides what
/// the caller should do. Never performs I/O itself (see spec.md §9 —
/// "C12 becomes a pure classifier").
pub fn classify(err: &RoomFabricError, suppressor: &FloodSuppressor) -> Classification {
    let message = err.to_string();
    if is_critical(&message) {
        return Classification {
            envelope: Some(err.to_envelope()),
            action: RecoveryAction::DisconnectSocket,
            force_teardown: true,
        };
    }

    let kind = err.kind();
    let suppressed = suppressor.record_and_check(kind);
    let action = recovery_action_for(kind);

    Classification {
        envelope: if suppressed {
            None
        } else {
            Some(err.to_envelope())
        },
        action,
        force_teardown: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_surface_to_caller_without_disconnect() {
        let suppressor = FloodSuppressor::default();
        let err = RoomFabricError::Validation("bad payload".into());
        let classification = classify(&err, &suppressor);
        assert_eq!(classification.action, RecoveryAction::SendErrorResponse);
        assert!(classification.envelope.is_some());
        assert!(!classification.force_teardown);
    }

    #[test]
    fn critical_message_forces_teardown_even_if_validation_shaped() {
        let suppressor = FloodSuppressor::default();
        let err = RoomFabricError::Internal("database connection lost unexpectedly".into());
        let classification = classify(&err, &suppressor);
        assert!(classification.force_teardown);
        assert_eq!(classification.action, RecoveryAction::DisconnectSocket);
    }

    #[test]
    fn flood_suppression_kicks_in_after_ten_per_minute() {
        let suppressor = FloodSuppressor::default();
        let err = RoomFabricError::Validation("x".into());

        let mut suppressed_once = false;
        for _ in 0..15 {
            let classification = classify(&err, &suppressor);
            if classification.envelope.is_none() {
                suppressed_once = true;
            }
        }

        assert!(suppressed_once);
    }

    #[test]
    fn session_errors_trigger_cleanup() {
        let suppressor = FloodSuppressor::default();
        let err = RoomFabricError::Session("stale".into());
        let classification = classify(&err, &suppressor);
        assert_eq!(classification.action, RecoveryAction::CleanupSession);
    }
}
