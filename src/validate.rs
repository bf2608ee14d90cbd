//! Declarative payload validation (C4).
//!
//! The teacher has no validation layer of its own (protobuf's type system
//! did that job); this generalizes the validation spec.md §4.4 calls for as
//! small per-event-kind functions operating on `serde_json::Value`, which
//! is the natural fit once the wire format is JSON (see SPEC_FULL.md). Each
//! validator rejects missing/mistyped required fields but tolerates
//! unknown extra fields, matching the "must not throw on unknown fields"
//! requirement.

use serde_json::Value;

use crate::error::RoomFabricError;

fn require_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, RoomFabricError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RoomFabricError::Validation(format!("missing or invalid field `{field}`")))
}

fn optional_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}

fn require_number(payload: &Value, field: &str) -> Result<f64, RoomFabricError> {
    payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| RoomFabricError::Validation(format!("missing or invalid field `{field}`")))
}

pub fn join_room(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "roomId")?;
    require_str(payload, "username")?;
    if let Some(role) = optional_str(payload, "role")
        && !["band_member", "audience"].contains(&role)
    {
        return Err(RoomFabricError::Validation("role must be band_member|audience".into()));
    }
    Ok(())
}

pub fn chat_message(payload: &Value) -> Result<(), RoomFabricError> {
    let text = require_str(payload, "message")?;
    if text.chars().count() > 2000 {
        return Err(RoomFabricError::Validation("message too long".into()));
    }
    Ok(())
}

pub fn transfer_ownership(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "targetUserId")?;
    Ok(())
}

pub fn member_action(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "targetUserId")?;
    Ok(())
}

pub fn metronome(payload: &Value) -> Result<(), RoomFabricError> {
    let bpm = require_number(payload, "bpm")?;
    if !(20.0..=400.0).contains(&bpm) {
        return Err(RoomFabricError::Validation("bpm out of range".into()));
    }
    Ok(())
}

pub fn create_room(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "name")?;
    require_str(payload, "username")?;
    if let Some(room_type) = optional_str(payload, "roomType")
        && !["perform", "arrange"].contains(&room_type)
    {
        return Err(RoomFabricError::Validation("roomType must be perform|arrange".into()));
    }
    Ok(())
}

pub fn approval_request(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "roomId")?;
    require_str(payload, "username")?;
    Ok(())
}

pub fn approval_response(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "connectionId")?;
    let decision = require_str(payload, "decision")?;
    if decision != "approve" && decision != "reject" {
        return Err(RoomFabricError::Validation(
            "decision must be approve|reject".into(),
        ));
    }
    Ok(())
}

pub fn approval_cancel(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "connectionId")?;
    Ok(())
}

pub fn analytics_session(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "roomId")?;
    Ok(())
}

pub fn lock_acquire(payload: &Value) -> Result<(), RoomFabricError> {
    require_str(payload, "elementId")?;
    let kind = require_str(payload, "type")?;
    if !["region", "track", "track_property"].contains(&kind) {
        return Err(RoomFabricError::Validation("unknown lock type".into()));
    }
    Ok(())
}

/// WebRTC-specific payload validation (spec.md §4.4). Separate from the
/// generic schema validator because the constraints are content-shaped
/// (SDP/ICE string limits, script-injection guards, nesting depth) rather
/// than structural.
pub struct VoicePayload<'a> {
    pub self_user_id: &'a str,
    pub target_user_id: &'a str,
    pub sdp_type: Option<&'a str>,
    pub sdp: Option<&'a str>,
    pub ice_candidate: Option<&'a str>,
    pub media_constraints: Option<&'a Value>,
}

const FORBIDDEN_SUBSTRINGS: &[&str] = &[
    "javascript:",
    "data:",
    "vbscript:",
    "<script",
    "onload=",
    "onerror=",
];

fn contains_forbidden(s: &str) -> bool {
    let lower = s.to_lowercase();
    FORBIDDEN_SUBSTRINGS.iter().any(|p| lower.contains(p))
}

fn json_nesting_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_nesting_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_nesting_depth).max().unwrap_or(0),
        _ => 0,
    }
}

pub fn voice(payload: &VoicePayload) -> Result<(), RoomFabricError> {
    if payload.self_user_id == payload.target_user_id {
        return Err(RoomFabricError::Validation(
            "cannot target self with voice signaling".into(),
        ));
    }

    if let Some(sdp_type) = payload.sdp_type
        && sdp_type != "offer"
        && sdp_type != "answer"
    {
        return Err(RoomFabricError::Validation(
            "sdp type must be offer|answer".into(),
        ));
    }

    if let Some(sdp) = payload.sdp {
        if sdp.chars().count() > 10_000 {
            return Err(RoomFabricError::Validation("sdp too long".into()));
        }
        if contains_forbidden(sdp) {
            return Err(RoomFabricError::Validation(
                "sdp contains forbidden content".into(),
            ));
        }
    }

    if let Some(candidate) = payload.ice_candidate {
        if candidate.chars().count() > 1_000 {
            return Err(RoomFabricError::Validation("ice candidate too long".into()));
        }
        if contains_forbidden(candidate) {
            return Err(RoomFabricError::Validation(
                "ice candidate contains forbidden content".into(),
            ));
        }
    }

    if let Some(constraints) = payload.media_constraints
        && json_nesting_depth(constraints) > 3
    {
        return Err(RoomFabricError::Validation(
            "media constraints nested too deeply".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_rejects_missing_fields() {
        assert!(join_room(&json!({})).is_err());
        assert!(join_room(&json!({"roomId": "r1", "username": "alice"})).is_ok());
    }

    #[test]
    fn join_room_tolerates_unknown_extra_fields() {
        assert!(
            join_room(&json!({"roomId": "r1", "username": "alice", "extra": 42})).is_ok()
        );
    }

    #[test]
    fn metronome_rejects_absurd_bpm() {
        assert!(metronome(&json!({"bpm": 1.0})).is_err());
        assert!(metronome(&json!({"bpm": 120.0})).is_ok());
    }

    #[test]
    fn voice_rejects_self_targeting() {
        let payload = VoicePayload {
            self_user_id: "alice",
            target_user_id: "alice",
            sdp_type: Some("offer"),
            sdp: Some("v=0"),
            ice_candidate: None,
            media_constraints: None,
        };
        assert!(voice(&payload).is_err());
    }

    #[test]
    fn voice_rejects_script_injection_in_sdp() {
        let payload = VoicePayload {
            self_user_id: "alice",
            target_user_id: "bob",
            sdp_type: Some("offer"),
            sdp: Some("v=0\r\n<script>alert(1)</script>"),
            ice_candidate: None,
            media_constraints: None,
        };
        assert!(voice(&payload).is_err());
    }

    #[test]
    fn voice_rejects_oversized_sdp() {
        let huge = "a".repeat(10_001);
        let payload = VoicePayload {
            self_user_id: "alice",
            target_user_id: "bob",
            sdp_type: Some("offer"),
            sdp: Some(&huge),
            ice_candidate: None,
            media_constraints: None,
        };
        assert!(voice(&payload).is_err());
    }

    #[test]
    fn voice_rejects_deeply_nested_media_constraints() {
        let nested = json!({"a": {"b": {"c": {"d": 1}}}});
        let payload = VoicePayload {
            self_user_id: "alice",
            target_user_id: "bob",
            sdp_type: None,
            sdp: None,
            ice_candidate: None,
            media_constraints: Some(&nested),
        };
        assert!(voice(&payload).is_err());
    }

    #[test]
    fn voice_accepts_well_formed_offer() {
        let payload = VoicePayload {
            self_user_id: "alice",
            target_user_id: "bob",
            sdp_type: Some("offer"),
            sdp: Some("v=0\r\no=- 1 1 IN IP4 127.0.0.1"),
            ice_candidate: None,
            media_constraints: Some(&json!({"audio": true})),
        };
        assert!(voice(&payload).is_ok());
    }

    #[test]
    fn create_room_rejects_unknown_room_type() {
        assert!(create_room(&json!({"name": "jam", "username": "alice", "roomType": "bogus"})).is_err());
        assert!(create_room(&json!({"name": "jam", "username": "alice", "roomType": "arrange"})).is_ok());
    }

    #[test]
    fn lock_acquire_rejects_unknown_type() {
        assert!(lock_acquire(&json!({"elementId": "r1", "type": "bogus"})).is_err());
        assert!(lock_acquire(&json!({"elementId": "r1", "type": "region"})).is_ok());
    }
}
