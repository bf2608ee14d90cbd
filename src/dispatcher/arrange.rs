//! `arrange:*` event family (spec.md §4.8), split out of
//! [`super`] because it's the largest single slice of the event table and
//! the only one that touches [`crate::room::store::RoomStateStore`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::app_state::{AppState, room_path};
use super::{DispatchContext, require_membership};
use crate::error::RoomFabricError;
use crate::room::model::{
    LockInfo, LockType, Marker, MidiNote, Region, RegionCommon, RegionId, SustainEvent, Track,
    TimeSignature, TrackId, TrackType,
};

pub async fn dispatch_arrange_event(
    ctx: &DispatchContext<'_>,
    event: &str,
    payload: &Value,
) -> Result<(), RoomFabricError> {
    match event {
        "arrange:request_state" => request_state(ctx).await,
        "arrange:track_add" => track_add(ctx, payload).await,
        "arrange:track_update" => track_update(ctx, payload).await,
        "arrange:track_remove" => track_remove(ctx, payload).await,
        "arrange:track_reorder" => track_reorder(ctx, payload).await,
        "arrange:region_add" => region_add(ctx, payload).await,
        "arrange:region_update" => region_update(ctx, payload).await,
        "arrange:region_remove" => region_remove(ctx, payload).await,
        "arrange:region_dragged" => region_dragged(ctx, payload).await,
        "arrange:note_update" => note_update(ctx, payload).await,
        "arrange:bpm_changed" => bpm_changed(ctx, payload).await,
        "arrange:time_signature_changed" => time_signature_changed(ctx, payload).await,
        "arrange:selection_changed" => selection_changed(ctx, payload).await,
        "arrange:lock_acquire" => lock_acquire(ctx, payload).await,
        "arrange:lock_release" => lock_release(ctx, payload).await,
        "arrange:recording_preview" => {
            exclude_sender_broadcast(ctx, "arrange:recording_preview", payload).await
        }
        "arrange:recording_end" => exclude_sender_broadcast(ctx, "arrange:recording_end", payload).await,
        "arrange:broadcast_state" => exclude_sender_broadcast(ctx, "arrange:broadcast_state", payload).await,
        "arrange:broadcast_note" => exclude_sender_broadcast(ctx, "arrange:broadcast_note", payload).await,
        "arrange:marker_add" => marker_add(ctx, payload).await,
        "arrange:marker_update" => marker_update(ctx, payload).await,
        "arrange:marker_remove" => marker_remove(ctx, payload).await,
        _ => Err(RoomFabricError::Validation(format!("unknown event `{event}`"))),
    }
}

async fn request_state(ctx: &DispatchContext<'_>) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    if ctx.state.room_state.get_state(&session.room_id).await.is_none() {
        ctx.state.room_state.init_state(&session.room_id).await;
    }
    let state = ctx
        .state
        .room_state
        .get_state(&session.room_id)
        .await
        .expect("just initialized");

    let locks: Vec<Value> = state
        .locks
        .iter()
        .map(|(element_id, lock)| json!({ "elementId": element_id, "lock": lock }))
        .collect();

    ctx.reply(
        "state_sync",
        json!({
            "tracks": state.tracks,
            "regions": state.regions,
            "locks": locks,
            "selectedTrackId": state.selected_track_id,
            "selectedRegionIds": state.selected_region_ids,
            "bpm": state.bpm,
            "timeSignature": state.time_signature,
            "synthStates": state.synth_states,
            "markers": state.markers,
        }),
    )
    .await;
    Ok(())
}

fn track_type_from(payload: &Value) -> TrackType {
    match payload.get("type").and_then(Value::as_str) {
        Some("audio") => TrackType::Audio,
        _ => TrackType::Midi,
    }
}

async fn track_add(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let id = crate::id::mint_track_id();
    let name = payload.get("name").and_then(Value::as_str).unwrap_or("Track").to_owned();
    let track = Track::new(id, name, track_type_from(payload));

    ctx.state.room_state.add_track(&session.room_id, track.clone()).await?;
    ctx.broadcast_room(&session.room_id, "arrange:track_added", json!({ "track": track })).await;
    Ok(())
}

async fn track_update(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let track_id = require_str(payload, "trackId")?;

    if let Some(conflict) = lock_conflict(ctx, &session.room_id, track_id, &session.user_id).await {
        ctx.reply("lock_conflict", json!({ "elementId": track_id, "lockedBy": conflict })).await;
        return Ok(());
    }

    let patch = payload.get("updates").cloned().unwrap_or_else(|| json!({}));
    ctx.state
        .room_state
        .update_track(&session.room_id, track_id, |track| apply_track_patch(track, &patch))
        .await?;

    ctx.broadcast_room(
        &session.room_id,
        "arrange:track_updated",
        json!({ "trackId": track_id, "updates": patch }),
    )
    .await;
    Ok(())
}

fn apply_track_patch(track: &mut Track, patch: &Value) {
    if let Some(name) = patch.get("name").and_then(Value::as_str) {
        track.name = name.to_owned();
    }
    if let Some(volume) = patch.get("volume").and_then(Value::as_f64) {
        track.volume = volume;
    }
    if let Some(pan) = patch.get("pan").and_then(Value::as_f64) {
        track.pan = pan;
    }
    if let Some(mute) = patch.get("mute").and_then(Value::as_bool) {
        track.mute = mute;
    }
    if let Some(solo) = patch.get("solo").and_then(Value::as_bool) {
        track.solo = solo;
    }
    if let Some(color) = patch.get("color").and_then(Value::as_str) {
        track.color = Some(color.to_owned());
    }
    if let Some(instrument_id) = patch.get("instrumentId").and_then(Value::as_str) {
        track.instrument_id = Some(instrument_id.to_owned());
    }
    if let Some(instrument_category) = patch.get("instrumentCategory").and_then(Value::as_str) {
        track.instrument_category = Some(instrument_category.to_owned());
    }
}

async fn track_remove(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let track_id = require_str(payload, "trackId")?;

    let removed_regions = ctx.state.room_state.remove_track(&session.room_id, track_id).await?;
    unlink_orphaned_audio(ctx, &session.room_id, &removed_regions).await;

    ctx.broadcast_room(&session.room_id, "arrange:track_removed", json!({ "trackId": track_id })).await;
    Ok(())
}

async fn track_reorder(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let ordered_ids: Vec<String> = payload
        .get("trackIds")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        .unwrap_or_default();

    ctx.state.room_state.reorder_tracks(&session.room_id, ordered_ids.clone()).await?;
    ctx.broadcast_room(&session.room_id, "arrange:track_reordered", json!({ "trackIds": ordered_ids })).await;
    Ok(())
}

fn region_from_payload(payload: &Value, region_id: String) -> Result<Region, RoomFabricError> {
    let track_id = require_str(payload, "trackId")?.to_owned();
    let common = RegionCommon {
        id: region_id,
        track_id,
        name: payload.get("name").and_then(Value::as_str).unwrap_or("Region").to_owned(),
        start: payload.get("start").and_then(Value::as_f64).unwrap_or(0.0),
        length: payload.get("length").and_then(Value::as_f64).unwrap_or(4.0),
        loop_enabled: payload.get("loopEnabled").and_then(Value::as_bool).unwrap_or(false),
        loop_iterations: payload.get("loopIterations").and_then(Value::as_u64).unwrap_or(1) as u32,
        color: payload.get("color").and_then(Value::as_str).map(str::to_owned),
    };

    if payload.get("regionType").and_then(Value::as_str) == Some("audio") {
        Ok(Region::Audio {
            common,
            data: crate::room::model::AudioRegionData {
                audio_url: payload.get("audioUrl").and_then(Value::as_str).map(str::to_owned),
                trim_start: payload.get("trimStart").and_then(Value::as_f64),
                original_length: payload.get("originalLength").and_then(Value::as_f64),
                gain: payload.get("gain").and_then(Value::as_f64),
                fade_in_duration: payload.get("fadeInDuration").and_then(Value::as_f64),
                fade_out_duration: payload.get("fadeOutDuration").and_then(Value::as_f64),
                audio_file_id: payload.get("audioFileId").and_then(Value::as_str).map(str::to_owned),
            },
        })
    } else {
        Ok(Region::Midi {
            common,
            data: crate::room::model::MidiRegionData { notes: Vec::new(), sustain_events: Vec::new() },
        })
    }
}

async fn region_add(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let region_id = crate::id::mint_region_id();
    let region = region_from_payload(payload, region_id)?;

    ctx.state.room_state.add_region(&session.room_id, region.clone()).await?;
    ctx.broadcast_room(&session.room_id, "arrange:region_added", json!({ "region": region })).await;
    Ok(())
}

async fn region_update(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let region_id = require_str(payload, "regionId")?;

    if let Some(conflict) = lock_conflict(ctx, &session.room_id, region_id, &session.user_id).await {
        ctx.reply("lock_conflict", json!({ "elementId": region_id, "lockedBy": conflict })).await;
        return Ok(());
    }

    let updates = payload.get("updates").cloned().unwrap_or_else(|| json!({}));
    ctx.state
        .room_state
        .update_region(&session.room_id, region_id, |region| apply_region_patch(region, &updates))
        .await?;

    ctx.broadcast_room(
        &session.room_id,
        "arrange:region_updated",
        json!({ "regionId": region_id, "updates": updates }),
    )
    .await;
    Ok(())
}

fn apply_region_patch(region: &mut Region, patch: &Value) {
    let common = region.common_mut();
    if let Some(track_id) = patch.get("trackId").and_then(Value::as_str) {
        common.track_id = track_id.to_owned();
    }
    if let Some(name) = patch.get("name").and_then(Value::as_str) {
        common.name = name.to_owned();
    }
    if let Some(start) = patch.get("start").and_then(Value::as_f64) {
        common.start = start.max(0.0);
    }
    if let Some(length) = patch.get("length").and_then(Value::as_f64) {
        common.length = length;
    }
    if let Some(loop_enabled) = patch.get("loopEnabled").and_then(Value::as_bool) {
        common.loop_enabled = loop_enabled;
    }

    if let Region::Audio { data, .. } = region {
        if let Some(gain) = patch.get("gain").and_then(Value::as_f64) {
            data.gain = Some(gain);
        }
        if let Some(trim_start) = patch.get("trimStart").and_then(Value::as_f64) {
            data.trim_start = Some(trim_start);
        }
    }
}

async fn region_remove(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let region_id = require_str(payload, "regionId")?;

    let removed = ctx.state.room_state.remove_region(&session.room_id, region_id).await?;
    if let Some(region) = removed {
        unlink_orphaned_audio(ctx, &session.room_id, std::slice::from_ref(&region)).await;
    }

    ctx.broadcast_room(&session.room_id, "arrange:region_removed", json!({ "regionId": region_id })).await;
    Ok(())
}

/// Batch-applies a drag-move: skips ids whose `trackId` target is unknown,
/// clamps `start = max(0, newStart)`, and carries only the accepted
/// updates in the single fan-out (spec.md §4.8 `region_dragged`).
async fn region_dragged(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let updates = payload.get("updates").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut accepted = Vec::new();
    for update in updates {
        let Some(region_id) = update.get("regionId").and_then(Value::as_str) else {
            continue;
        };
        if lock_conflict(ctx, &session.room_id, region_id, &session.user_id).await.is_some() {
            continue;
        }

        let new_start = update.get("newStart").and_then(Value::as_f64).unwrap_or(0.0).max(0.0);
        let target_track_id = update.get("trackId").and_then(Value::as_str).map(str::to_owned);

        let state_before = ctx.state.room_state.get_state(&session.room_id).await;
        if let Some(track_id) = &target_track_id
            && let Some(state) = &state_before
            && state.track(track_id).is_none()
        {
            continue;
        }

        let applied = ctx
            .state
            .room_state
            .update_region(&session.room_id, region_id, |region| {
                region.common_mut().start = new_start;
                if let Some(track_id) = &target_track_id {
                    region.common_mut().track_id = track_id.clone();
                }
            })
            .await;

        if applied.is_ok() {
            accepted.push(json!({ "regionId": region_id, "newStart": new_start, "trackId": target_track_id }));
        }
    }

    ctx.broadcast_room(&session.room_id, "arrange:region_dragged", json!({ "updates": accepted })).await;
    Ok(())
}

async fn note_update(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let region_id = require_str(payload, "regionId")?;

    if let Some(conflict) = lock_conflict(ctx, &session.room_id, region_id, &session.user_id).await {
        ctx.reply("lock_conflict", json!({ "elementId": region_id, "lockedBy": conflict })).await;
        return Ok(());
    }

    let notes: Vec<MidiNote> = payload
        .get("notes")
        .and_then(Value::as_array)
        .map(|items| dedupe_notes_by_id(items.iter().filter_map(parse_note)))
        .unwrap_or_default();
    let sustain_events: Vec<SustainEvent> = payload
        .get("sustainEvents")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_sustain).collect())
        .unwrap_or_default();

    let mut applied = false;
    ctx.state
        .room_state
        .update_region(&session.room_id, region_id, |region| {
            if let Region::Midi { data, .. } = region {
                data.notes = notes.clone();
                data.sustain_events = sustain_events.clone();
                applied = true;
            }
        })
        .await?;

    if !applied {
        return Err(RoomFabricError::Validation("region is not a midi region".into()));
    }

    ctx.broadcast_room(
        &session.room_id,
        "arrange:note_updated",
        json!({ "regionId": region_id, "notes": notes, "sustainEvents": sustain_events }),
    )
    .await;
    Ok(())
}

/// Enforces invariant I2 (spec.md §8: "∀ MidiNote n in MidiRegion R: n.id is
/// unique within R") on a client-supplied notes list: last write for a given
/// id wins, kept at the position of that id's first occurrence.
fn dedupe_notes_by_id(notes: impl Iterator<Item = MidiNote>) -> Vec<MidiNote> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, MidiNote> = HashMap::new();
    for note in notes {
        if !by_id.contains_key(&note.id) {
            order.push(note.id.clone());
        }
        by_id.insert(note.id.clone(), note);
    }
    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

fn parse_note(value: &Value) -> Option<MidiNote> {
    Some(MidiNote {
        id: value.get("id")?.as_str()?.to_owned(),
        pitch: value.get("pitch")?.as_u64()? as u8,
        velocity: value.get("velocity")?.as_u64()? as u8,
        start: value.get("start")?.as_f64()?,
        length: value.get("length")?.as_f64()?,
    })
}

fn parse_sustain(value: &Value) -> Option<SustainEvent> {
    Some(SustainEvent {
        position: value.get("position")?.as_f64()?,
        value: value.get("value")?.as_bool()?,
    })
}

async fn bpm_changed(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let bpm = require_number(payload, "bpm")?;
    ctx.state.room_state.set_bpm(&session.room_id, bpm).await?;
    ctx.broadcast_room(&session.room_id, "arrange:bpm_changed", json!({ "bpm": bpm })).await;
    Ok(())
}

async fn time_signature_changed(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let numerator = payload.get("numerator").and_then(Value::as_u64).unwrap_or(4) as u8;
    let denominator = payload.get("denominator").and_then(Value::as_u64).unwrap_or(4) as u8;
    let time_signature = TimeSignature { numerator, denominator };

    ctx.state.room_state.set_time_signature(&session.room_id, time_signature).await?;
    ctx.broadcast_room(
        &session.room_id,
        "arrange:time_signature_changed",
        json!({ "numerator": numerator, "denominator": denominator }),
    )
    .await;
    Ok(())
}

async fn selection_changed(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;

    let selected_track_id = payload
        .get("selectedTrackId")
        .map(|v| v.as_str().map(str::to_owned));
    let selected_region_ids = payload.get("selectedRegionIds").and_then(Value::as_array).map(|items| {
        items.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect::<std::collections::HashSet<_>>()
    });

    ctx.state
        .room_state
        .update_selection(&session.room_id, selected_track_id.clone(), selected_region_ids.clone())
        .await?;

    let room = ctx.state.rooms.get(&session.room_id).await;
    let username = room.and_then(|r| r.user(&session.user_id).cloned()).map(|u| u.username).unwrap_or_default();

    ctx.broadcast_room_except_sender(
        &session.room_id,
        "arrange:selection_changed",
        json!({
            "userId": session.user_id,
            "username": username,
            "selectedTrackId": selected_track_id,
            "selectedRegionIds": selected_region_ids,
        }),
    )
    .await;
    Ok(())
}

async fn lock_acquire(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    crate::validate::lock_acquire(payload)?;
    let session = require_membership(ctx).await?;

    let element_id = payload["elementId"].as_str().unwrap().to_owned();
    let lock_type = match payload["type"].as_str().unwrap() {
        "track" => LockType::Track,
        "track_property" => LockType::TrackProperty,
        _ => LockType::Region,
    };

    let room = ctx.state.rooms.get(&session.room_id).await;
    let username = room.and_then(|r| r.user(&session.user_id).cloned()).map(|u| u.username).unwrap_or_default();

    let lock = LockInfo {
        user_id: session.user_id.clone(),
        username: username.clone(),
        lock_type,
        timestamp: crate::id::now_ms(),
    };

    let acquired = ctx.state.room_state.acquire_lock(&session.room_id, &element_id, lock).await?;
    if acquired {
        ctx.broadcast_room(
            &session.room_id,
            "lock_acquired",
            json!({ "elementId": element_id, "userId": session.user_id, "username": username }),
        )
        .await;
    } else {
        let locked_by = ctx
            .state
            .room_state
            .is_locked(&session.room_id, &element_id)
            .await?
            .map(|l| l.username)
            .unwrap_or_default();
        ctx.reply("lock_conflict", json!({ "elementId": element_id, "lockedBy": locked_by })).await;
    }
    Ok(())
}

async fn lock_release(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let element_id = require_str(payload, "elementId")?;

    let released = ctx.state.room_state.release_lock(&session.room_id, element_id, &session.user_id).await?;
    if released {
        ctx.broadcast_room(&session.room_id, "lock_released", json!({ "elementId": element_id })).await;
    }
    Ok(())
}

async fn exclude_sender_broadcast(
    ctx: &DispatchContext<'_>,
    event: &str,
    payload: &Value,
) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    ctx.broadcast_room_except_sender(&session.room_id, event, payload.clone()).await;
    Ok(())
}

async fn marker_add(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let marker = Marker {
        id: crate::id::mint_marker_id(),
        position: payload.get("position").and_then(Value::as_f64).unwrap_or(0.0),
        description: payload.get("description").and_then(Value::as_str).unwrap_or_default().to_owned(),
        color: payload.get("color").and_then(Value::as_str).map(str::to_owned),
    };

    ctx.state.room_state.add_marker(&session.room_id, marker.clone()).await?;
    ctx.broadcast_room(&session.room_id, "arrange:marker_added", json!({ "marker": marker })).await;
    Ok(())
}

async fn marker_update(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let marker_id = require_str(payload, "markerId")?;
    let updates = payload.get("updates").cloned().unwrap_or_else(|| json!({}));

    ctx.state
        .room_state
        .update_marker(&session.room_id, marker_id, |marker| {
            if let Some(position) = updates.get("position").and_then(Value::as_f64) {
                marker.position = position;
            }
            if let Some(description) = updates.get("description").and_then(Value::as_str) {
                marker.description = description.to_owned();
            }
            if let Some(color) = updates.get("color").and_then(Value::as_str) {
                marker.color = Some(color.to_owned());
            }
        })
        .await?;

    ctx.broadcast_room(
        &session.room_id,
        "arrange:marker_updated",
        json!({ "markerId": marker_id, "updates": updates }),
    )
    .await;
    Ok(())
}

async fn marker_remove(ctx: &DispatchContext<'_>, payload: &Value) -> Result<(), RoomFabricError> {
    let session = require_membership(ctx).await?;
    let marker_id = require_str(payload, "markerId")?;

    ctx.state.room_state.remove_marker(&session.room_id, marker_id).await?;
    ctx.broadcast_room(&session.room_id, "arrange:marker_removed", json!({ "markerId": marker_id })).await;
    Ok(())
}

/// Internal entry point for the project-upload collaborator (spec.md
/// §4.8, "state sync on project upload"): wholesale-replaces the
/// arrangement, rewrites audio URLs through the storage adapter to point
/// at this server's streaming path, and broadcasts `arrange:project_loaded`.
/// Not a wire event — there is no originating connection, so this takes
/// `AppState` directly rather than a [`DispatchContext`].
pub async fn replace_project(
    state: &Arc<AppState>,
    room_id: &str,
    tracks: Vec<Track>,
    mut regions: HashMap<RegionId, Region>,
    bpm: f64,
    time_signature: TimeSignature,
    synth_states: HashMap<TrackId, Value>,
) -> Result<(), RoomFabricError> {
    for region in regions.values_mut() {
        if let Region::Audio { data, .. } = region
            && let Some(key) = data
                .audio_file_id
                .clone()
                .or_else(|| data.audio_url.as_deref().map(crate::room::model::storage_id_from_url))
        {
            data.audio_url = Some(format!("/api/rooms/{room_id}/audio/regions/{key}"));
        }
    }

    state
        .room_state
        .replace_project(room_id, tracks, regions, bpm, time_signature, synth_states)
        .await?;

    let new_state = state
        .room_state
        .get_state(room_id)
        .await
        .ok_or_else(|| RoomFabricError::RoomState("room has no arrangement state".into()))?;

    state
        .namespaces
        .emit_to(
            &room_path(room_id),
            "arrange:project_loaded",
            json!({
                "tracks": new_state.tracks,
                "regions": new_state.regions,
                "bpm": new_state.bpm,
                "timeSignature": new_state.time_signature,
                "synthStates": new_state.synth_states,
            }),
        )
        .await;
    Ok(())
}

/// Audio blob lifecycle (spec.md §4.8): after removing audio regions,
/// invoke the storage adapter's delete only for ids with no surviving
/// cross-region reference (checked against the post-mutation region set).
async fn unlink_orphaned_audio(ctx: &DispatchContext<'_>, room_id: &str, removed: &[Region]) {
    let Some(state) = ctx.state.room_state.get_state(room_id).await else {
        return;
    };

    for region in removed {
        let Some(key) = region.audio_reference_key() else {
            continue;
        };
        let still_referenced = state.regions.values().any(|r| r.audio_reference_key().as_deref() == Some(&key));
        if !still_referenced {
            tracing::info!(room_id, storage_id = %key, "releasing orphaned audio region blob");
            if let Err(err) = ctx.state.storage.delete_region_audio(room_id, &key).await {
                tracing::warn!(room_id, storage_id = %key, error = %err, "failed to release audio region blob");
            }
        }
    }
}

fn require_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, RoomFabricError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| RoomFabricError::Validation(format!("missing field `{field}`")))
}

fn require_number(payload: &Value, field: &str) -> Result<f64, RoomFabricError> {
    payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| RoomFabricError::Validation(format!("missing field `{field}`")))
}

async fn lock_conflict(
    ctx: &DispatchContext<'_>,
    room_id: &str,
    element_id: &str,
    user_id: &str,
) -> Option<String> {
    let lock = ctx.state.room_state.is_locked(room_id, element_id).await.ok().flatten()?;
    (lock.user_id != user_id).then_some(lock.username)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, pitch: u8) -> MidiNote {
        MidiNote {
            id: id.to_owned(),
            pitch,
            velocity: 100,
            start: 0.0,
            length: 1.0,
        }
    }

    /// Invariant I2 (spec.md §8): a note id is unique within a region, even
    /// when the client payload that should have guaranteed that is wrong.
    #[test]
    fn dedupe_notes_by_id_keeps_last_write_and_drops_duplicate_ids() {
        let notes = vec![note("n1", 60), note("n2", 64), note("n1", 67)];
        let deduped = dedupe_notes_by_id(notes.into_iter());

        let ids: Vec<&str> = deduped.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
        assert_eq!(deduped.iter().find(|n| n.id == "n1").unwrap().pitch, 67);
    }
}
