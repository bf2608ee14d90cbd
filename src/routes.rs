//! HTTP surface: health/performance observability endpoints and the audio
//! region streaming route (spec.md §6).
//!
//! The teacher's routes are protobuf room-creation and Spotify PKCE
//! endpoints; room creation moved into the dispatcher's `create_room` event
//! (spec.md: "created by a create-room event"), so everything left in this
//! module is the HTTP-only surface the spec actually calls out: health,
//! performance snapshots, and the byte-range audio stream.

use std::sync::Arc;

use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse, get, post, web};
use serde_json::json;

use crate::app_state::AppState;

/// Resident set size in MiB, read from `/proc/self/statm`. Best-effort:
/// returns 0 outside Linux or if the file is unreadable, which only makes
/// memory-pressure cleanup strictly less aggressive, never incorrect.
pub(crate) fn resident_memory_mb() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let Some(resident_pages) = statm.split_whitespace().nth(1).and_then(|s| s.parse::<u64>().ok()) else {
        return 0;
    };
    let page_size_kb = 4;
    (resident_pages * page_size_kb) / 1024
}

#[get("/health")]
pub async fn health(state: web::Data<Arc<AppState>>) -> impl actix_web::Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "rooms": state.rooms.room_count().await,
        "connections": state.connections.count().await,
    }))
}

#[get("/performance/system")]
pub async fn performance_system(state: web::Data<Arc<AppState>>) -> impl actix_web::Responder {
    HttpResponse::Ok().json(json!({
        "memoryMb": resident_memory_mb(),
        "roomCount": state.rooms.room_count().await,
        "connectionCount": state.connections.count().await,
    }))
}

#[get("/performance/rooms")]
pub async fn performance_rooms(state: web::Data<Arc<AppState>>) -> impl actix_web::Responder {
    let rooms: Vec<_> = state
        .rooms
        .all()
        .await
        .into_iter()
        .map(|room| {
            json!({
                "id": room.id,
                "name": room.name,
                "roomType": room.room_type,
                "isPrivate": room.is_private,
                "isHidden": room.is_hidden,
                "userCount": room.users.len(),
                "pendingCount": room.pending_members.len(),
            })
        })
        .collect();
    HttpResponse::Ok().json(json!({ "rooms": rooms }))
}

#[get("/performance/connections/health")]
pub async fn performance_connections_health(state: web::Data<Arc<AppState>>) -> impl actix_web::Responder {
    let mut namespace_stats = Vec::new();
    for path in state.namespaces.all_paths().await {
        if let Some(stats) = state.namespaces.stats(&path).await {
            namespace_stats.push(json!({
                "path": path,
                "connectionCount": stats.connection_count,
                "ageSecs": stats.age.as_secs(),
                "idleSecs": stats.idle.as_secs(),
            }));
        }
    }
    HttpResponse::Ok().json(json!({
        "totalConnections": state.connections.count().await,
        "namespaces": namespace_stats,
    }))
}

#[get("/performance/connections/optimization")]
pub async fn performance_connections_optimization(state: web::Data<Arc<AppState>>) -> impl actix_web::Responder {
    let limits = state.admission.limits();
    HttpResponse::Ok().json(json!({
        "maxConnectionsPerRoom": limits.max_connections_per_room,
        "maxConnectionsGlobal": limits.max_connections_global,
        "queueSize": limits.queue_size,
        "connectionTimeoutSecs": limits.connection_timeout.as_secs(),
        "batchSize": limits.batch_size,
        "batchDelayMs": limits.batch_delay.as_millis(),
        "compressionEnabled": state.config.admission.compression_enabled,
        "batchingEnabled": state.config.admission.batching_enabled,
    }))
}

#[get("/performance/cleanup")]
pub async fn performance_cleanup(state: web::Data<Arc<AppState>>) -> impl actix_web::Responder {
    let heap_mb = resident_memory_mb();
    let metrics = state
        .cleanup
        .run_regular(
            &state.namespaces,
            &state.sessions,
            &state.approvals,
            &state.rate_limiter,
            &state.rooms,
            &state.room_state,
            heap_mb,
        )
        .await;
    HttpResponse::Ok().json(cleanup_metrics_json(&metrics))
}

#[post("/performance/cleanup/force")]
pub async fn performance_cleanup_force(state: web::Data<Arc<AppState>>) -> impl actix_web::Responder {
    let heap_mb = resident_memory_mb();
    let metrics = state.cleanup.run_aggressive(&state.namespaces, heap_mb).await;
    HttpResponse::Ok().json(cleanup_metrics_json(&metrics))
}

fn cleanup_metrics_json(metrics: &crate::cleanup::CleanupMetrics) -> serde_json::Value {
    json!({
        "namespacesChecked": metrics.namespaces_checked,
        "namespacesCleanedUp": metrics.namespaces_cleaned_up,
        "sessionsCleanedUp": metrics.sessions_cleaned_up,
        "memoryFreedEstimateBytes": metrics.memory_freed_estimate,
        "durationMs": metrics.duration.as_millis(),
    })
}

#[get("/performance/dashboard")]
pub async fn performance_dashboard(state: web::Data<Arc<AppState>>) -> impl actix_web::Responder {
    let limits = state.admission.limits();
    HttpResponse::Ok().json(json!({
        "system": {
            "memoryMb": resident_memory_mb(),
            "roomCount": state.rooms.room_count().await,
        },
        "connections": {
            "total": state.connections.count().await,
            "namespaceCount": state.namespaces.all_paths().await.len(),
        },
        "admission": {
            "maxConnectionsPerRoom": limits.max_connections_per_room,
            "maxConnectionsGlobal": limits.max_connections_global,
            "queueSize": limits.queue_size,
        },
    }))
}

/// Serves one audio region's blob, honoring `Range` requests the way a
/// `<audio>` element's seek bar expects (spec.md §6).
#[get("/api/rooms/{room_id}/audio/regions/{region_id}")]
pub async fn audio_region(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    state: web::Data<Arc<AppState>>,
) -> impl actix_web::Responder {
    let (room_id, region_id) = path.into_inner();

    let Some(arrange_state) = state.room_state.get_state(&room_id).await else {
        return HttpResponse::NotFound().finish();
    };
    let Some(region) = arrange_state.regions.get(&region_id) else {
        return HttpResponse::NotFound().finish();
    };
    let Some(storage_key) = region.audio_reference_key() else {
        return HttpResponse::NotFound().body("region has no audio data");
    };

    let key = format!("{room_id}/{storage_key}");
    let bytes = match state.storage.get_file(&key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return HttpResponse::NotFound().finish(),
        Err(err) => return HttpResponse::InternalServerError().body(err),
    };

    let total_len = bytes.len() as u64;
    let range = req.headers().get(header::RANGE).and_then(|v| v.to_str().ok()).and_then(parse_range_header);

    match range {
        Some((start, end)) if start < total_len => {
            let end = end.min(total_len.saturating_sub(1));
            let chunk = &bytes[start as usize..=end as usize];
            HttpResponse::PartialContent()
                .content_type("audio/ogg")
                .insert_header((header::ACCEPT_RANGES, "bytes"))
                .insert_header((header::CONTENT_RANGE, format!("bytes {start}-{end}/{total_len}")))
                .insert_header((header::CONTENT_LENGTH, chunk.len().to_string()))
                .body(chunk.to_vec())
        }
        _ => HttpResponse::Ok()
            .content_type("audio/ogg")
            .insert_header((header::ACCEPT_RANGES, "bytes"))
            .insert_header((header::CONTENT_LENGTH, total_len.to_string()))
            .body(bytes),
    }
}

#[derive(serde::Deserialize)]
pub struct ProjectUploadBody {
    tracks: Vec<crate::room::model::Track>,
    regions: Vec<crate::room::model::Region>,
    bpm: f64,
    #[serde(default)]
    time_signature: crate::room::model::TimeSignature,
    #[serde(default)]
    synth_states: std::collections::HashMap<String, serde_json::Value>,
}

/// Webhook the external project-upload collaborator calls once it has
/// finished writing a saved project's tracks/regions (spec.md §4.8,
/// "state sync on project upload"). Persistence of the project itself is
/// out of scope (§1); this only replaces the room's live arrangement and
/// notifies members.
#[post("/api/rooms/{room_id}/project")]
pub async fn project_loaded(
    path: web::Path<String>,
    body: web::Json<ProjectUploadBody>,
    state: web::Data<Arc<AppState>>,
) -> impl actix_web::Responder {
    let room_id = path.into_inner();
    let body = body.into_inner();
    let regions = body.regions.into_iter().map(|r| (r.id().to_owned(), r)).collect();

    match crate::dispatcher::replace_project(
        state.get_ref(),
        &room_id,
        body.tracks,
        regions,
        body.bpm,
        body.time_signature,
        body.synth_states,
    )
    .await
    {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => HttpResponse::NotFound().body(err.to_string()),
    }
}

/// Parses a single-range `Range: bytes=start-end` header. Multi-range
/// requests are not supported; callers fall back to a full 200 response.
fn parse_range_header(header: &str) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() { u64::MAX } else { end.parse().ok()? };
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_header_handles_open_ended_ranges() {
        assert_eq!(parse_range_header("bytes=0-"), Some((0, u64::MAX)));
        assert_eq!(parse_range_header("bytes=100-199"), Some((100, 199)));
        assert_eq!(parse_range_header("not-a-range"), None);
    }
}
