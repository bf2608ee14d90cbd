//! End-to-end scenario tests driving [`crate::dispatcher::handle`] directly,
//! one connection at a time, the way [`crate::ws`] would after parsing a
//! wire frame — without an actual socket. Complements the colocated
//! `#[cfg(test)]` unit tests already present in nearly every module; these
//! exercise the concrete flows spec.md §8 calls out (lock contention, grace
//! re-join, admission queueing, private-room approval) across several
//! components at once.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::app_state::AppState;
use crate::config::Config;
use crate::dispatcher::{self, DispatchContext};
use crate::namespace::Envelope;
use crate::protocol::InboundMessage;

/// Registers a fresh connection sink, mirroring what `ws::connect` does
/// before any message is dispatched.
async fn connect(state: &Arc<AppState>) -> (String, UnboundedReceiver<Envelope>) {
    let connection_id = crate::id::mint("conn");
    let (tx, rx) = mpsc::unbounded_channel();
    state.connections.register(&connection_id, tx).await;
    (connection_id, rx)
}

/// Dispatches one event and reconciles namespace membership afterward, the
/// same two steps `ws::handle_text`/`sync_namespace_membership` perform per
/// frame.
async fn send(state: &Arc<AppState>, connection_id: &str, current_namespace: &mut Option<String>, event: &str, payload: Value) {
    let ctx = DispatchContext { state, connection_id };
    dispatcher::handle(&ctx, InboundMessage { event: event.to_owned(), payload }).await;

    let wanted = state.sessions.get(connection_id).await.map(|s| s.namespace_path);
    if *current_namespace == wanted {
        return;
    }
    if let Some(old) = current_namespace.take() {
        state.namespaces.leave(&old, connection_id).await;
    }
    if let Some(new_path) = &wanted
        && let Some(sink) = state.connections.sink(connection_id).await
    {
        state.namespaces.join(new_path, connection_id, sink).await;
    }
    *current_namespace = wanted;
}

async fn drain(rx: &mut UnboundedReceiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}

async fn find_event<'a>(envelopes: &'a [Envelope], event: &str) -> Option<&'a Envelope> {
    envelopes.iter().find(|e| e.event == event)
}

#[tokio::test]
async fn lock_contention_is_rejected_and_broadcast_to_the_room() {
    let state = AppState::new(Config::test_defaults());
    let mut ns_a = None;
    let mut ns_b = None;

    let (owner_id, mut owner_rx) = connect(&state).await;
    send(&state, &owner_id, &mut ns_a, "create_room", json!({"name": "Jam", "username": "alice"})).await;
    let created = drain(&mut owner_rx).await;
    let room_id = find_event(&created, "room_created").await.unwrap().payload["room"]["id"]
        .as_str()
        .unwrap()
        .to_owned();

    let (member_id, mut member_rx) = connect(&state).await;
    send(&state, &member_id, &mut ns_b, "join_room", json!({"roomId": room_id, "username": "bob"})).await;
    drain(&mut member_rx).await;
    drain(&mut owner_rx).await;

    state.room_state.init_state(&room_id).await;
    let track_id = "track-1".to_owned();
    state
        .room_state
        .add_track(&room_id, crate::room::model::Track::new(track_id.clone(), "Synth".into(), crate::room::model::TrackType::Midi))
        .await
        .unwrap();

    send(
        &state,
        &owner_id,
        &mut ns_a,
        "arrange:lock_acquire",
        json!({"elementId": track_id, "type": "track"}),
    )
    .await;
    let owner_events = drain(&mut owner_rx).await;
    assert!(find_event(&owner_events, "lock_acquired").await.is_some(), "the first locker's acquisition broadcasts to the room");

    send(
        &state,
        &member_id,
        &mut ns_b,
        "arrange:lock_acquire",
        json!({"elementId": track_id, "type": "track"}),
    )
    .await;
    let member_events = drain(&mut member_rx).await;
    let conflict = find_event(&member_events, "lock_conflict").await.expect("second locker gets a lock_conflict reply");
    assert_eq!(conflict.payload["lockedBy"], "alice");

    // A failed lock attempt is a direct reply, not a room-wide broadcast.
    let owner_after = drain(&mut owner_rx).await;
    assert!(owner_after.is_empty());
}

#[tokio::test]
async fn grace_rejoin_skips_private_room_approval() {
    let state = AppState::new(Config::test_defaults());
    let mut ns_owner = None;
    let mut ns_member = None;

    let (owner_id, mut owner_rx) = connect(&state).await;
    send(
        &state,
        &owner_id,
        &mut ns_owner,
        "create_room",
        json!({"name": "Private Jam", "username": "alice", "isPrivate": true}),
    )
    .await;
    let created = drain(&mut owner_rx).await;
    let room_id = find_event(&created, "room_created").await.unwrap().payload["room"]["id"]
        .as_str()
        .unwrap()
        .to_owned();

    let (member_id, mut member_rx) = connect(&state).await;
    send(
        &state,
        &member_id,
        &mut ns_member,
        "join_room",
        json!({"roomId": room_id, "username": "bob", "userId": "bob"}),
    )
    .await;
    let approval_events = drain(&mut member_rx).await;
    assert!(approval_events.is_empty(), "a pending approval gets no direct reply yet");
    assert!(state.approvals.get(&member_id).await.is_some());

    let owner_notice = drain(&mut owner_rx).await;
    let request = find_event(&owner_notice, "approval_requested").await.expect("the owner is notified directly");
    assert_eq!(request.payload["username"], "bob");

    let owner_decision = json!({"connectionId": member_id, "decision": "approve"});
    send(&state, &owner_id, &mut ns_owner, "approval_response", owner_decision).await;
    drain(&mut owner_rx).await;

    // bob leaves and reconnects within the 30 s grace window.
    send(&state, &member_id, &mut ns_member, "leave_room", json!({})).await;
    drain(&mut owner_rx).await;
    assert!(state.sessions.is_in_grace("bob", &room_id).await);

    let (rejoin_id, mut rejoin_rx) = connect(&state).await;
    let mut ns_rejoin = None;
    send(
        &state,
        &rejoin_id,
        &mut ns_rejoin,
        "join_room",
        json!({"roomId": room_id, "username": "bob", "userId": "bob"}),
    )
    .await;

    // Re-entry during grace bypasses the approval gate entirely.
    assert!(state.approvals.get(&rejoin_id).await.is_none());
    let rejoin_events = drain(&mut rejoin_rx).await;
    assert!(rejoin_events.is_empty(), "direct admission gives no error back to the rejoining socket");
    assert!(state.rooms.is_member(&room_id, "bob").await);
}

#[tokio::test]
async fn join_room_honors_the_requested_band_member_role() {
    let state = AppState::new(Config::test_defaults());
    let mut ns_owner = None;
    let (owner_id, mut owner_rx) = connect(&state).await;
    send(&state, &owner_id, &mut ns_owner, "create_room", json!({"name": "Room", "username": "alice"})).await;
    let created = drain(&mut owner_rx).await;
    let room_id = find_event(&created, "room_created").await.unwrap().payload["room"]["id"]
        .as_str()
        .unwrap()
        .to_owned();

    let mut ns_member = None;
    let (member_id, mut member_rx) = connect(&state).await;
    send(
        &state,
        &member_id,
        &mut ns_member,
        "join_room",
        json!({"roomId": room_id, "username": "bob", "userId": "bob", "role": "band_member"}),
    )
    .await;
    drain(&mut member_rx).await;

    let room = state.rooms.get(&room_id).await.unwrap();
    assert_eq!(room.user("bob").unwrap().role, crate::room::model::UserRole::BandMember);
}

#[tokio::test]
async fn per_room_admission_cap_queues_the_next_joiner() {
    let mut config = Config::test_defaults();
    config.admission.max_connections_per_room = 1;
    let state = AppState::new(config);

    let mut ns_owner = None;
    let (owner_id, mut owner_rx) = connect(&state).await;
    send(&state, &owner_id, &mut ns_owner, "create_room", json!({"name": "Room", "username": "alice"})).await;
    let created = drain(&mut owner_rx).await;
    let room_id = find_event(&created, "room_created").await.unwrap().payload["room"]["id"]
        .as_str()
        .unwrap()
        .to_owned();

    let mut ns_b = None;
    let (first_id, mut first_rx) = connect(&state).await;
    send(&state, &first_id, &mut ns_b, "join_room", json!({"roomId": room_id, "username": "bob", "userId": "bob"})).await;
    let first_events = drain(&mut first_rx).await;
    assert!(first_events.is_empty(), "the owner's slot doesn't count against the cap, so bob is allowed directly");
    drain(&mut owner_rx).await;

    let mut ns_c = None;
    let (second_id, mut second_rx) = connect(&state).await;
    send(&state, &second_id, &mut ns_c, "join_room", json!({"roomId": room_id, "username": "carol", "userId": "carol"})).await;
    let queued = drain(&mut second_rx).await;
    assert!(find_event(&queued, "connection_queued").await.is_some());
    assert!(!state.rooms.is_member(&room_id, "carol").await);

    // bob leaving frees the slot and promotes carol from the FIFO queue.
    send(&state, &first_id, &mut ns_b, "leave_room", json!({})).await;
    let promotion = drain(&mut second_rx).await;
    assert!(find_event(&promotion, "connection_approved").await.is_some());
    assert!(state.rooms.is_member(&room_id, "carol").await);
}

#[tokio::test]
async fn chat_flood_past_the_per_minute_cap_returns_a_rate_limited_error() {
    let state = AppState::new(Config::test_defaults());
    let mut ns = None;
    let (connection_id, mut rx) = connect(&state).await;
    send(&state, &connection_id, &mut ns, "create_room", json!({"name": "Room", "username": "alice"})).await;
    drain(&mut rx).await;

    let mut last_events = Vec::new();
    for _ in 0..35 {
        send(&state, &connection_id, &mut ns, "chat_message", json!({"message": "hi"})).await;
        last_events = drain(&mut rx).await;
    }

    let error = find_event(&last_events, "error").await.expect("the 30/min cap must trip within 35 messages");
    assert_eq!(error.payload["error"]["code"], "RATE_LIMITED");
    assert!(error.payload["error"]["retryAfter"].is_number());
}

#[tokio::test]
async fn leaving_twice_in_a_row_is_a_silent_no_op() {
    let state = AppState::new(Config::test_defaults());
    let mut ns = None;
    let (connection_id, mut rx) = connect(&state).await;
    send(&state, &connection_id, &mut ns, "create_room", json!({"name": "Room", "username": "alice"})).await;
    drain(&mut rx).await;

    send(&state, &connection_id, &mut ns, "leave_room", json!({})).await;
    drain(&mut rx).await;
    send(&state, &connection_id, &mut ns, "leave_room", json!({})).await;
    let events = drain(&mut rx).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn sole_members_unintended_disconnect_keeps_the_room_joinable_within_grace() {
    let state = AppState::new(Config::test_defaults());
    let mut ns = None;
    let (connection_id, mut rx) = connect(&state).await;
    send(&state, &connection_id, &mut ns, "create_room", json!({"name": "Room", "username": "alice", "userId": "alice"})).await;
    let created = drain(&mut rx).await;
    let room_id = find_event(&created, "room_created").await.unwrap().payload["room"]["id"]
        .as_str()
        .unwrap()
        .to_owned();

    // An unintended drop (what `ws::teardown` synthesizes) empties the room,
    // but per spec.md §3/§7 it must not be destroyed on the spot.
    send(&state, &connection_id, &mut ns, "leave_room", json!({"intended": false})).await;
    assert!(state.rooms.exists(&room_id).await, "an emptied room survives its grace window");
    assert!(state.sessions.is_in_grace("alice", &room_id).await);

    let (rejoin_id, mut rejoin_rx) = connect(&state).await;
    let mut ns_rejoin = None;
    send(
        &state,
        &rejoin_id,
        &mut ns_rejoin,
        "join_room",
        json!({"roomId": room_id, "username": "alice", "userId": "alice"}),
    )
    .await;

    let rejoin_events = drain(&mut rejoin_rx).await;
    assert!(rejoin_events.is_empty(), "direct re-admission gives no error back to the rejoining socket");
    assert!(state.rooms.is_member(&room_id, "alice").await);
}
