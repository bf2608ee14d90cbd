//! Room dispatcher: the event table. Centralizes "resolve session,
//! optionally validate+ratelimit, mutate state, fan out" for every event
//! kind.
//!
//! Grounded on the teacher's `Command` (`websocket/commands.rs`), which
//! centralizes permission-check → mutate → respond for its protobuf
//! command set; generalized here to JSON-named events dispatched by
//! string match on the event name sent over the wire.

mod arrange;

use std::sync::Arc;

use serde_json::json;

use crate::admission::{AdmissionDecision, QueueEntry, RejectReason};
use crate::app_state::{AppState, approval_path, room_path};
use crate::approval::{ApprovalSession, RequestOutcome};
use crate::error::RoomFabricError;
use crate::namespace::Envelope;
use crate::protocol::{InboundMessage, PingResponse};
use crate::rate_limit::LimitedEvent;
use crate::room::model::{Metronome, Room, RoomType, RoomUser, UserRole};
use crate::session::{NamespaceKind, Session};
use crate::validate;

pub use arrange::{dispatch_arrange_event, replace_project};

/// Everything a handler needs to act on one connection's event, without
/// reaching back into the transport layer.
pub struct DispatchContext<'a> {
    pub state: &'a Arc<AppState>,
    pub connection_id: &'a str,
}

impl<'a> DispatchContext<'a> {
    pub async fn session(&self) -> Option<Session> {
        self.state.sessions.get(self.connection_id).await
    }

    pub async fn reply(&self, event: &str, payload: serde_json::Value) {
        if let Some(session) = self.session().await {
            self.state
                .namespaces
                .emit_one(&session.namespace_path, self.connection_id, event, payload)
                .await;
        }
    }

    pub async fn reply_error(&self, err: RoomFabricError) {
        let classification = crate::error::classify(&err, &self.state.flood_suppressor);
        if let Some(envelope) = classification.envelope {
            self.reply("error", json!({ "error": envelope })).await;
        }
    }

    pub async fn broadcast_room(&self, room_id: &str, event: &str, payload: serde_json::Value) {
        self.state.namespaces.emit_to(&room_path(room_id), event, payload).await;
    }

    pub async fn broadcast_room_except_sender(
        &self,
        room_id: &str,
        event: &str,
        payload: serde_json::Value,
    ) {
        self.state
            .namespaces
            .emit_to_except(&room_path(room_id), self.connection_id, event, payload)
            .await;
    }
}

/// Top-level entry point: routes one inbound message for one connection.
pub async fn handle(ctx: &DispatchContext<'_>, message: InboundMessage) {
    let outcome = match message.event.as_str() {
        "create_room" => handle_create_room(ctx, &message.payload).await,
        "join_room" => handle_join_room(ctx, &message.payload).await,
        "leave_room" => handle_leave_room(ctx, &message.payload).await,
        "transfer_ownership" => handle_transfer_ownership(ctx, &message.payload).await,
        "play_note" => handle_rate_limited_broadcast(ctx, "play_note", &message.payload, LimitedEvent::PlayNote).await,
        "stop_all_notes" => handle_rate_limited_broadcast(ctx, "stop_all_notes", &message.payload, LimitedEvent::PlayNote).await,
        "change_instrument" => handle_change_instrument(ctx, &message.payload).await,
        "update_synth_params" => handle_update_synth_params(ctx, &message.payload).await,
        "request_synth_params" => handle_request_synth_params(ctx, &message.payload).await,
        "update_metronome" => handle_update_metronome(ctx, &message.payload).await,
        "request_metronome_state" => handle_request_metronome_state(ctx).await,
        "chat_message" => handle_chat_message(ctx, &message.payload).await,
        "ping_measurement" => handle_ping(ctx, &message.payload).await,
        "approval_response" => handle_approval_response(ctx, &message.payload).await,
        "approval_cancel" => handle_approval_cancel(ctx, &message.payload).await,
        event if event.starts_with("voice_") => handle_voice(ctx, event, &message.payload).await,
        event if event.starts_with("arrange:") => dispatch_arrange_event(ctx, event, &message.payload).await,
        _ => Err(RoomFabricError::Validation(format!("unknown event `{}`", message.event))),
    };

    if let Err(err) = outcome {
        ctx.reply_error(err).await;
    }
}

async fn require_membership(ctx: &DispatchContext<'_>) -> Result<Session, RoomFabricError> {
    ctx.session()
        .await
        .filter(|s| s.kind == NamespaceKind::Room)
        .ok_or_else(|| RoomFabricError::Session("not joined to a room".into()))
}

/// Creates a room (spec.md's "created by a create-room event") and seats
/// the creator as owner in the same step, so the client doesn't need a
/// separate `join_room` round trip for the room it just made.
async fn handle_create_room(ctx: &DispatchContext<'_>, payload: &serde_json::Value) -> Result<(), RoomFabricError> {
    validate::create_room(payload)?;
    if ctx.session().await.is_some() {
        return Err(RoomFabricError::Conflict("already in a room session".into()));
    }

    let decision = ctx.state.rate_limiter.check(ctx.connection_id, LimitedEvent::CreateRoom).await;
    if !decision.allowed {
        return Err(RoomFabricError::RateLimited { retry_after_secs: decision.retry_after_seconds });
    }

    let name = payload["name"].as_str().unwrap().to_owned();
    let username = payload["username"].as_str().unwrap().to_owned();
    let user_id = payload
        .get("userId")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| crate::id::mint("usr"));
    let room_type = match payload.get("roomType").and_then(|v| v.as_str()) {
        Some("perform") => RoomType::Perform,
        _ => RoomType::Arrange,
    };
    let is_private = payload.get("isPrivate").and_then(|v| v.as_bool()).unwrap_or(false);
    let is_hidden = payload.get("isHidden").and_then(|v| v.as_bool()).unwrap_or(false);

    let room_id = crate::id::mint_room_id();
    let room = Room {
        id: room_id.clone(),
        name,
        owner_user_id: user_id.clone(),
        is_private,
        is_hidden,
        created_at: crate::id::now_ms(),
        room_type,
        metronome: Metronome { bpm: 120.0, last_tick_ts: 0 },
        users: Vec::new(),
        pending_members: Vec::new(),
    };
    ctx.state.rooms.create(room.clone()).await;

    let path = room_path(&room_id);
    ctx.state.namespaces.ensure(&path).await;
    ctx.state
        .sessions
        .attach(
            ctx.connection_id,
            Session {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                namespace_path: path.clone(),
                kind: NamespaceKind::Room,
                joined_at: std::time::Instant::now(),
            },
        )
        .await;

    let owner = RoomUser {
        user_id: user_id.clone(),
        username: username.clone(),
        role: UserRole::RoomOwner,
        current_instrument: None,
        current_category: None,
        is_ready: false,
    };
    ctx.state.rooms.add_user(&room_id, owner.clone()).await;

    if room_type == RoomType::Arrange {
        ctx.state.room_state.init_state(&room_id).await;
    }

    ctx.reply("room_created", json!({ "room": room, "user": owner })).await;
    Ok(())
}

async fn handle_join_room(ctx: &DispatchContext<'_>, payload: &serde_json::Value) -> Result<(), RoomFabricError> {
    validate::join_room(payload)?;
    if ctx.session().await.is_some() {
        return Err(RoomFabricError::Conflict("already in a room session".into()));
    }

    let room_id = payload["roomId"].as_str().unwrap().to_owned();
    let username = payload["username"].as_str().unwrap().to_owned();
    let user_id = payload
        .get("userId")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| crate::id::mint("usr"));
    let requested_role = match payload.get("role").and_then(|v| v.as_str()) {
        Some("band_member") => UserRole::BandMember,
        _ => UserRole::Audience,
    };

    if !ctx.state.rooms.exists(&room_id).await {
        return Err(RoomFabricError::NotFound(format!("room {room_id} does not exist")));
    }

    // Grace re-join: the same user reconnecting within the grace window
    // skips the private-room approval gate and re-enters directly.
    let reentering = ctx.state.sessions.take_grace(&user_id, &room_id).await;

    let is_private = {
        let room = ctx.state.rooms.get(&room_id).await.expect("checked exists");
        room.is_private && !room.is_member(&user_id) && reentering.is_none()
    };

    if is_private {
        route_into_approval(ctx, &room_id, &user_id, &username, requested_role).await;
        return Ok(());
    }

    admit_into_room(ctx, &room_id, &user_id, &username, requested_role).await
}

async fn route_into_approval(
    ctx: &DispatchContext<'_>,
    room_id: &str,
    user_id: &str,
    username: &str,
    requested_role: UserRole,
) {
    let path = approval_path(room_id);
    ctx.state.namespaces.ensure(&path).await;
    ctx.state
        .sessions
        .attach(
            ctx.connection_id,
            Session {
                room_id: room_id.to_owned(),
                user_id: user_id.to_owned(),
                namespace_path: path.clone(),
                kind: NamespaceKind::Approval,
                joined_at: std::time::Instant::now(),
            },
        )
        .await;

    let owner_user_id = ctx
        .state
        .rooms
        .get(room_id)
        .await
        .map(|r| r.owner_user_id)
        .unwrap_or_default();

    let outcome = ctx
        .state
        .approvals
        .request(ApprovalSession {
            connection_id: ctx.connection_id.to_owned(),
            room_id: room_id.to_owned(),
            requester_user_id: user_id.to_owned(),
            requester_username: username.to_owned(),
            requested_role,
            owner_user_id: owner_user_id.clone(),
            requested_at: std::time::Instant::now(),
        })
        .await;

    if let RequestOutcome::Replaced { evicted_connection_id } = outcome {
        ctx.state
            .namespaces
            .emit_one(&path, &evicted_connection_id, "approval_timed_out", json!({}))
            .await;
    }

    let notice = json!({ "userId": user_id, "username": username, "ownerUserId": owner_user_id });

    // The approval namespace only ever has the requester in it (the owner
    // stays in the room namespace while triaging requests), so the owner
    // has to be reached directly by connection id rather than by broadcast.
    ctx.state.namespaces.emit_to(&path, "approval_requested", notice.clone()).await;
    if let Some(owner_connection_id) = ctx.state.sessions.connection_id_for_user(&owner_user_id).await {
        ctx.state.connections.send(&owner_connection_id, "approval_requested", notice).await;
    }
}

/// Attaches the Room-kind session, adds the member, lazily inits
/// arrangement state, and broadcasts `user_joined`. Shared by a direct
/// admission and by a queued connection's later promotion.
///
/// Registers the connection's sink into the room namespace itself, rather
/// than relying on the transport's post-dispatch sync: that sync only runs
/// for the connection whose own frame was just handled, which leaves a
/// queue-promoted or approval-admitted member's socket un-registered (and
/// deaf to room broadcasts) until they happen to send a frame of their own.
async fn finish_room_admission(
    state: &Arc<AppState>,
    connection_id: &str,
    room_id: &str,
    user_id: &str,
    username: &str,
    requested_role: UserRole,
) {
    let path = room_path(room_id);
    state.namespaces.ensure(&path).await;
    state
        .sessions
        .attach(
            connection_id,
            Session {
                room_id: room_id.to_owned(),
                user_id: user_id.to_owned(),
                namespace_path: path.clone(),
                kind: NamespaceKind::Room,
                joined_at: std::time::Instant::now(),
            },
        )
        .await;

    if let Some(sink) = state.connections.sink(connection_id).await {
        state.namespaces.join(&path, connection_id, sink).await;
    }

    let snapshot = crate::session::role_snapshot(user_id, username, requested_role);
    state.rooms.add_user(room_id, snapshot.clone()).await;

    if state.rooms.room_type(room_id).await == Some(RoomType::Arrange) {
        state.room_state.init_state(room_id).await;
    }

    state.namespaces.emit_to(&path, "user_joined", json!({ "user": snapshot })).await;
}

/// Completes a join for a connection that was previously queued and has
/// just been promoted by [`crate::admission::AdmissionController::release`].
pub async fn complete_queued_admission(state: &Arc<AppState>, room_id: &str, entry: QueueEntry) {
    let requested_role = entry.requested_role;
    finish_room_admission(state, &entry.connection_id, room_id, &entry.user_id, &entry.username, requested_role)
        .await;
    state.connections.send(&entry.connection_id, "connection_approved", json!({})).await;
}

async fn admit_into_room(
    ctx: &DispatchContext<'_>,
    room_id: &str,
    user_id: &str,
    username: &str,
    requested_role: UserRole,
) -> Result<(), RoomFabricError> {
    let decision = ctx
        .state
        .admission
        .should_allow(room_id, ctx.connection_id, user_id, username, requested_role)
        .await;
    match decision {
        AdmissionDecision::Allowed => {
            finish_room_admission(ctx.state, ctx.connection_id, room_id, user_id, username, requested_role).await;
            Ok(())
        }
        AdmissionDecision::Queued(position) => {
            ctx.state
                .connections
                .send(ctx.connection_id, "connection_queued", json!({ "position": position }))
                .await;
            Ok(())
        }
        AdmissionDecision::Rejected(reason) => {
            let reason = match reason {
                RejectReason::GlobalCap => "global_capacity",
                RejectReason::QueueFull => "queue_full",
            };
            ctx.state
                .connections
                .send(ctx.connection_id, "connection_rejected", json!({ "reason": reason }))
                .await;
            Ok(())
        }
    }
}

async fn handle_leave_room(ctx: &DispatchContext<'_>, payload: &serde_json::Value) -> Result<(), RoomFabricError> {
    let Some(session) = ctx.session().await else {
        // (I7) leaving twice is a no-op.
        return Ok(());
    };
    ctx.state.sessions.detach(ctx.connection_id).await;

    if session.kind != NamespaceKind::Room {
        return Ok(());
    }

    // Explicit `leave_room` frames are intended departures; `ws::teardown`
    // synthesizes this same event on an unintended socket drop and marks it
    // as such (spec.md §3's grace-entry `isIntendedLeave` flag).
    let intended = payload.get("intended").and_then(|v| v.as_bool()).unwrap_or(true);

    if let Some(room) = ctx.state.rooms.get(&session.room_id).await
        && let Some(user) = room.user(&session.user_id).cloned()
    {
        ctx.state
            .sessions
            .add_grace(&session.user_id, &session.room_id, user, intended)
            .await;
    }

    let released = ctx
        .state
        .room_state
        .release_user_locks(&session.room_id, &session.user_id)
        .await
        .unwrap_or_default();
    for element_id in &released {
        ctx.broadcast_room(&session.room_id, "lock_released", json!({ "elementId": element_id })).await;
    }

    let now_empty = ctx.state.rooms.remove_user(&session.room_id, &session.user_id).await;
    ctx.broadcast_room(&session.room_id, "user_left", json!({ "userId": session.user_id })).await;

    if let Some(promoted) = ctx.state.admission.release(&session.room_id).await {
        complete_queued_admission(ctx.state, &session.room_id, promoted).await;
    }

    // The room itself is NOT torn down here even when it just became empty:
    // spec.md §3 destroys a room "when empty beyond a short grace", and the
    // sole remaining member may reconnect within that window (§7, §8
    // scenario 4). `RoomRegistry::sweep_empty`, driven by C11's cleanup
    // cadence, reclaims it once the grace window actually elapses.
    if now_empty != Some(true)
        && let Some(next_owner) = next_owner_if_departing_owner(ctx, &session).await
    {
        ctx.state.rooms.transfer_ownership(&session.room_id, &next_owner).await;
        ctx.broadcast_room(
            &session.room_id,
            "ownership_transferred",
            json!({ "newOwnerUserId": next_owner }),
        )
        .await;
    }

    Ok(())
}

/// Owner-handoff decision (DESIGN.md open question): when the departing
/// user was the room's sole owner and other members remain, promote the
/// next eligible member automatically instead of leaving the room
/// ownerless.
async fn next_owner_if_departing_owner(ctx: &DispatchContext<'_>, session: &Session) -> Option<String> {
    if !ctx.state.rooms.is_owner(&session.room_id, &session.user_id).await {
        return None;
    }
    ctx.state.rooms.pick_next_owner(&session.room_id, &session.user_id).await
}

async fn handle_transfer_ownership(
    ctx: &DispatchContext<'_>,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    validate::transfer_ownership(payload)?;
    let session = require_membership(ctx).await?;

    if !ctx.state.rooms.is_owner(&session.room_id, &session.user_id).await {
        return Err(RoomFabricError::Permission("only the owner may transfer ownership".into()));
    }

    let target = payload["targetUserId"].as_str().unwrap();
    if !ctx.state.rooms.is_member(&session.room_id, target).await {
        return Err(RoomFabricError::NotFound("target is not a room member".into()));
    }

    ctx.state.rooms.transfer_ownership(&session.room_id, target).await;
    ctx.broadcast_room(&session.room_id, "ownership_transferred", json!({ "newOwnerUserId": target })).await;
    Ok(())
}

async fn handle_rate_limited_broadcast(
    ctx: &DispatchContext<'_>,
    event: &str,
    payload: &serde_json::Value,
    limited: LimitedEvent,
) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let decision = ctx.state.rate_limiter.check(&session.user_id, limited).await;
    if !decision.allowed {
        return Err(RoomFabricError::RateLimited { retry_after_secs: decision.retry_after_seconds });
    }
    ctx.broadcast_room(&session.room_id, event, payload.clone()).await;
    Ok(())
}

async fn handle_change_instrument(
    ctx: &DispatchContext<'_>,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let decision = ctx.state.rate_limiter.check(&session.user_id, LimitedEvent::ChangeInstrument).await;
    if !decision.allowed {
        return Err(RoomFabricError::RateLimited { retry_after_secs: decision.retry_after_seconds });
    }

    let instrument = payload.get("instrumentId").and_then(|v| v.as_str()).map(str::to_owned);
    let category = payload.get("instrumentCategory").and_then(|v| v.as_str()).map(str::to_owned);

    ctx.broadcast_room(
        &session.room_id,
        "change_instrument",
        json!({ "userId": session.user_id, "instrumentId": instrument, "instrumentCategory": category }),
    )
    .await;
    Ok(())
}

async fn handle_update_synth_params(
    ctx: &DispatchContext<'_>,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let decision = ctx.state.rate_limiter.check(&session.user_id, LimitedEvent::UpdateSynthParams).await;
    if !decision.allowed {
        return Err(RoomFabricError::RateLimited { retry_after_secs: decision.retry_after_seconds });
    }

    let track_id = payload.get("trackId").and_then(|v| v.as_str()).unwrap_or_default();
    let params = payload.get("params").cloned().unwrap_or_else(|| json!({}));
    ctx.state.room_state.update_synth_params(&session.room_id, track_id, params.clone()).await?;

    ctx.broadcast_room(
        &session.room_id,
        "synth_params_updated",
        json!({ "trackId": track_id, "params": params }),
    )
    .await;
    Ok(())
}

async fn handle_request_synth_params(
    ctx: &DispatchContext<'_>,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let state = ctx
        .state
        .room_state
        .get_state(&session.room_id)
        .await
        .ok_or_else(|| RoomFabricError::RoomState("arrangement state not initialized".into()))?;
    ctx.reply("synth_params_state", json!({ "synthStates": state.synth_states })).await;
    Ok(())
}

async fn handle_update_metronome(
    ctx: &DispatchContext<'_>,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    validate::metronome(payload)?;
    let session = require_membership(ctx).await?;
    let bpm = payload["bpm"].as_f64().unwrap();
    ctx.state.rooms.update_metronome(&session.room_id, bpm, crate::id::now_ms()).await;
    ctx.broadcast_room(&session.room_id, "metronome_updated", json!({ "bpm": bpm })).await;
    Ok(())
}

async fn handle_request_metronome_state(ctx: &DispatchContext<'_>) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let room = ctx
        .state
        .rooms
        .get(&session.room_id)
        .await
        .ok_or_else(|| RoomFabricError::NotFound("room no longer exists".into()))?;
    ctx.reply("metronome_state", json!({ "metronome": room.metronome })).await;
    Ok(())
}

async fn handle_chat_message(
    ctx: &DispatchContext<'_>,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    validate::chat_message(payload)?;
    let session = require_membership(ctx).await?;
    let decision = ctx.state.rate_limiter.check(&session.user_id, LimitedEvent::ChatMessage).await;
    if !decision.allowed {
        return Err(RoomFabricError::RateLimited { retry_after_secs: decision.retry_after_seconds });
    }

    let room = ctx.state.rooms.get(&session.room_id).await;
    let username = room
        .as_ref()
        .and_then(|r| r.user(&session.user_id))
        .map(|u| u.username.clone())
        .unwrap_or_default();

    ctx.broadcast_room(
        &session.room_id,
        "chat_message",
        json!({
            "userId": session.user_id,
            "username": username,
            "message": payload["message"].as_str().unwrap_or_default(),
        }),
    )
    .await;
    Ok(())
}

async fn handle_ping(ctx: &DispatchContext<'_>, payload: &serde_json::Value) -> Result<(), RoomFabricError> {
    let ping_id = payload.get("pingId").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
    let timestamp = payload.get("timestamp").and_then(|v| v.as_u64()).unwrap_or(0);
    let response = PingResponse { ping_id, timestamp, server_timestamp: crate::id::now_ms() };
    ctx.reply("ping_response", serde_json::to_value(response).unwrap()).await;
    Ok(())
}

async fn handle_voice(
    ctx: &DispatchContext<'_>,
    event: &str,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let target_user_id = payload
        .get("targetUserId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RoomFabricError::Validation("missing targetUserId".into()))?;

    let limited = match event {
        "voice_offer" => LimitedEvent::VoiceOffer,
        "voice_answer" => LimitedEvent::VoiceAnswer,
        "voice_ice_candidate" => LimitedEvent::VoiceIceCandidate,
        _ => return Err(RoomFabricError::Validation(format!("unknown voice event `{event}`"))),
    };
    let decision = ctx.state.rate_limiter.check(&session.user_id, limited).await;
    if !decision.allowed {
        return Err(RoomFabricError::RateLimited { retry_after_secs: decision.retry_after_seconds });
    }

    let voice_payload = validate::VoicePayload {
        self_user_id: &session.user_id,
        target_user_id,
        sdp_type: payload.get("sdpType").and_then(|v| v.as_str()),
        sdp: payload.get("sdp").and_then(|v| v.as_str()),
        ice_candidate: payload.get("iceCandidate").and_then(|v| v.as_str()),
        media_constraints: payload.get("mediaConstraints"),
    };
    validate::voice(&voice_payload)?;

    if !ctx.state.rooms.is_member(&session.room_id, target_user_id).await {
        return Err(RoomFabricError::NotFound("signaling target is not in this room".into()));
    }

    let target_session = ctx.state.sessions.get_by_user(target_user_id).await;
    let Some(target_session) = target_session else {
        return Err(RoomFabricError::NotFound("signaling target is not connected".into()));
    };

    let mut relayed = payload.clone();
    if let Some(obj) = relayed.as_object_mut() {
        obj.insert("fromUserId".into(), json!(session.user_id));
    }

    ctx.state
        .namespaces
        .emit_to(&target_session.namespace_path, event, relayed)
        .await;
    Ok(())
}

async fn handle_approval_response(
    ctx: &DispatchContext<'_>,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    validate::approval_response(payload)?;
    let session = ctx.session().await.ok_or_else(|| RoomFabricError::Session("no session".into()))?;

    if !ctx.state.rooms.is_owner(&session.room_id, &session.user_id).await {
        return Err(RoomFabricError::Permission("only the owner may respond to approvals".into()));
    }

    let requester_connection_id = payload["connectionId"].as_str().unwrap().to_owned();
    let decision = payload["decision"].as_str().unwrap();

    let Some(approval) = ctx.state.approvals.remove(&requester_connection_id).await else {
        return Err(RoomFabricError::NotFound("approval session not found".into()));
    };

    let approval_ns = approval_path(&approval.room_id);

    if decision == "approve" {
        ctx.state.sessions.detach(&requester_connection_id).await;
        let username = approval.requester_username.clone();
        let room_id = approval.room_id.clone();
        let user_id = approval.requester_user_id.clone();

        let requested_role = approval.requested_role;
        let admission_decision = ctx
            .state
            .admission
            .should_allow(&room_id, &requester_connection_id, &user_id, &username, requested_role)
            .await;
        match admission_decision {
            AdmissionDecision::Allowed => {
                finish_room_admission(
                    ctx.state,
                    &requester_connection_id,
                    &room_id,
                    &user_id,
                    &username,
                    requested_role,
                )
                .await;
            }
            AdmissionDecision::Queued(position) => {
                ctx.state
                    .connections
                    .send(&requester_connection_id, "connection_queued", json!({ "position": position }))
                    .await;
            }
            AdmissionDecision::Rejected(reason) => {
                let reason = match reason {
                    RejectReason::GlobalCap => "global_capacity",
                    RejectReason::QueueFull => "queue_full",
                };
                ctx.state
                    .connections
                    .send(&requester_connection_id, "connection_rejected", json!({ "reason": reason }))
                    .await;
            }
        }
    } else {
        ctx.state
            .namespaces
            .emit_one(&approval_ns, &requester_connection_id, "approval_denied", json!({}))
            .await;
    }

    Ok(())
}

async fn handle_approval_cancel(
    ctx: &DispatchContext<'_>,
    payload: &serde_json::Value,
) -> Result<(), RoomFabricError> {
    validate::approval_cancel(payload)?;
    let connection_id = payload["connectionId"].as_str().unwrap();
    ctx.state.approvals.remove(connection_id).await;
    Ok(())
}

/// Convenience for transport code that needs to write an [`Envelope`]
/// directly (heartbeat pings outside the dispatch table).
pub fn pong_envelope() -> Envelope {
    Envelope { event: "pong".to_owned(), payload: json!({}) }
}

/// Enforces the approval session's 30 s hard timeout (spec.md §4.9/§5):
/// expires overdue sessions, tells the requester directly, and gives the
/// owner a cancellation hint if they're still connected. Driven by a
/// dedicated timer (see `main::spawn_background_sweeps`), independent of
/// C11's namespace cleanup cadence.
pub async fn sweep_approval_timeouts(state: &Arc<AppState>) {
    for approval in state.approvals.expire_sweep().await {
        state.sessions.detach(&approval.connection_id).await;
        state
            .connections
            .send(&approval.connection_id, "approval_timed_out", json!({}))
            .await;

        if let Some(owner_connection_id) = state.sessions.connection_id_for_user(&approval.owner_user_id).await {
            state
                .connections
                .send(
                    &owner_connection_id,
                    "approval_request_cancelled",
                    json!({ "userId": approval.requester_user_id, "username": approval.requester_username, "reason": "timed_out" }),
                )
                .await;
        }
    }
}
