//! WebSocket transport: bridges one `actix-ws` socket to the dispatcher.
//!
//! Grounded on the teacher's `SharifyWsInstance` (`sharify/websocket/instance.rs`):
//! same `tokio::select! { biased; ... }` loop racing the message stream
//! against a heartbeat interval, the same "message has priority, so a
//! skipped heartbeat tick is safe" timeout math
//! (`USER_WS_TIMEOUT = 2 * HEARTBEAT_INTERVAL`), and the same
//! `actix_rt::spawn`-per-connection shape. Generalized from one room-scoped
//! URL (`/v1/{room_id}/{user_id}`) to a single connection-scoped endpoint,
//! since namespace membership here is decided by `join_room`/`create_room`
//! events rather than the upgrade URL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{HttpRequest, HttpResponse, web};
use actix_ws::{AggregatedMessage, AggregatedMessageStream, Session};
use tokio::sync::mpsc;

use crate::app_state::AppState;
use crate::dispatcher::{self, DispatchContext};
use crate::namespace::Envelope;
use crate::protocol::{InboundMessage, OutboundMessage};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// 2x the heartbeat interval: recv and heartbeat share one loop and a
/// message takes priority, so a single skipped tick is expected and safe.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(HEARTBEAT_INTERVAL.as_secs() * 2);

pub async fn connect(req: HttpRequest, body: web::Payload, state: web::Data<Arc<AppState>>) -> actix_web::Result<HttpResponse> {
    let (response, mut session, stream) = actix_ws::handle(&req, body)?;
    let stream = stream.max_frame_size(128 * 1024).aggregate_continuations();

    let connection_id = crate::id::mint("conn");
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    state.connections.register(&connection_id, outbound_tx.clone()).await;

    let state: Arc<AppState> = state.get_ref().clone();
    let mut outbound_session = session.clone();
    actix_rt::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let message = OutboundMessage::new(envelope.event, envelope.payload);
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if outbound_session.text(text).await.is_err() {
                break;
            }
        }
    });

    actix_rt::spawn(async move {
        run_connection(state, connection_id, session, stream).await;
    });

    Ok(response)
}

async fn run_connection(
    state: Arc<AppState>,
    connection_id: String,
    mut session: Session,
    mut stream: AggregatedMessageStream,
) {
    let mut heartbeat = Instant::now();
    let mut ticker = actix_rt::time::interval(HEARTBEAT_INTERVAL);
    let mut current_namespace: Option<String> = None;

    loop {
        tokio::select! {
            biased;

            frame = stream.recv() => {
                match frame {
                    Some(Ok(AggregatedMessage::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(AggregatedMessage::Pong(_))) => {
                        heartbeat = Instant::now();
                    }
                    Some(Ok(AggregatedMessage::Text(text))) => {
                        handle_text(&state, &connection_id, &text, &mut current_namespace).await;
                    }
                    Some(Ok(AggregatedMessage::Binary(_))) => {
                        // This protocol is JSON-over-text; binary frames are ignored
                        // rather than rejected, matching the "tolerate unknown" posture.
                    }
                    Some(Ok(AggregatedMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                }
            }
            _ = ticker.tick() => {
                if Instant::now().duration_since(heartbeat) > CONNECTION_TIMEOUT {
                    break;
                }
                if session.ping(b"ping").await.is_err() {
                    break;
                }
            }
        }
    }

    teardown(&state, &connection_id, current_namespace.as_deref()).await;
    let _ = session.close(None).await;
}

async fn handle_text(state: &Arc<AppState>, connection_id: &str, text: &str, current_namespace: &mut Option<String>) {
    let message: InboundMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => {
            state
                .connections
                .send(connection_id, "error", serde_json::json!({
                    "error": { "code": "VALIDATION_ERROR", "message": "malformed message envelope" }
                }))
                .await;
            return;
        }
    };

    let ctx = DispatchContext { state, connection_id };
    dispatcher::handle(&ctx, message).await;

    sync_namespace_membership(state, connection_id, current_namespace).await;
}

/// After every dispatched message, reconciles this connection's namespace
/// sink registration against its current session. `join_room`/`create_room`
/// attach a session with a namespace path but never register the socket's
/// sink directly (the dispatcher has no sink to register); `leave_room`
/// detaches the session. This is where the two get synced.
async fn sync_namespace_membership(state: &Arc<AppState>, connection_id: &str, current_namespace: &mut Option<String>) {
    let wanted = state.sessions.get(connection_id).await.map(|session| session.namespace_path);

    if *current_namespace == wanted {
        return;
    }

    if let Some(old_path) = current_namespace.take() {
        state.namespaces.leave(&old_path, connection_id).await;
    }

    if let Some(new_path) = &wanted
        && let Some(sink) = state.connections.sink(connection_id).await
    {
        state.namespaces.join(new_path, connection_id, sink).await;
    }

    *current_namespace = wanted;
}

/// Synthesizes a `leave_room` so grace/ownership-handoff/admission-release
/// logic runs the same way it would for an explicit leave, then unregisters
/// the connection everywhere it could still be referenced.
async fn teardown(state: &Arc<AppState>, connection_id: &str, namespace_path: Option<&str>) {
    let ctx = DispatchContext { state, connection_id };
    dispatcher::handle(
        &ctx,
        InboundMessage {
            event: "leave_room".to_owned(),
            payload: serde_json::json!({ "intended": false }),
        },
    )
    .await;

    if let Some(path) = namespace_path {
        state.namespaces.leave(path, connection_id).await;
    }
    state.approvals.remove(connection_id).await;
    state.connections.unregister(connection_id).await;
}
