//! Wire envelope shapes (spec.md §6).
//!
//! The teacher frames every message as a protobuf `Command`; since
//! SPEC_FULL.md mandates a JSON wire format instead, this is the
//! `{ event, payload }`/`{ error }` envelope pair every inbound and
//! outbound message is shaped as.

use serde::{Deserialize, Serialize};

use crate::error::ErrorEnvelope;

/// A client→server message: a named event with a JSON payload.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundMessage {
    pub event: String,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
}

fn default_payload() -> serde_json::Value {
    serde_json::json!({})
}

/// A server→client broadcast or reply.
#[derive(Clone, Debug, Serialize)]
pub struct OutboundMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// `{ error: { code, message, details?, retryAfter? } }` — the one shape
/// every error response takes, regardless of origin (spec.md §6).
#[derive(Clone, Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorEnvelope,
}

impl From<ErrorEnvelope> for ErrorResponse {
    fn from(error: ErrorEnvelope) -> Self {
        Self { error }
    }
}

/// Ping/pong heartbeat payloads (spec.md §6), distinct from the
/// transport-level WebSocket ping/pong frames actix-ws sends on its own
/// cadence — this is the application-level latency probe the client emits
/// explicitly.
#[derive(Clone, Debug, Deserialize)]
pub struct PingMeasurement {
    #[serde(rename = "pingId")]
    pub ping_id: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PingResponse {
    #[serde(rename = "pingId")]
    pub ping_id: String,
    pub timestamp: u64,
    #[serde(rename = "serverTimestamp")]
    pub server_timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_defaults_payload_to_empty_object() {
        let parsed: InboundMessage = serde_json::from_str(r#"{"event":"leave_room"}"#).unwrap();
        assert_eq!(parsed.event, "leave_room");
        assert_eq!(parsed.payload, serde_json::json!({}));
    }

    #[test]
    fn error_response_serializes_under_the_error_key() {
        let response: ErrorResponse =
            crate::error::ErrorEnvelope::new(crate::error::ErrorCode::ValidationError, "bad").into();
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("error").is_some());
        assert_eq!(value["error"]["code"], "VALIDATION_ERROR");
    }
}
