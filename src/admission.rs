//! Connection admission, per-room/global caps, queueing, and batched emit.
//!
//! IP-bucketed admission itself is delegated to `actix-governor` at the
//! HTTP layer (kept from the teacher's `Governor` middleware in
//! `main.rs`); this module owns the room/global caps, the FIFO wait queue,
//! and the batched-emit buffer that governor has no notion of.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::namespace::{Envelope, NamespaceManager};
use crate::room::model::UserRole;

#[derive(Clone, Copy, Debug)]
pub struct AdmissionLimits {
    pub max_connections_per_room: usize,
    pub max_connections_global: usize,
    pub queue_size: usize,
    pub connection_timeout: Duration,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    GlobalCap,
    QueueFull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed,
    Rejected(RejectReason),
    Queued(usize),
}

pub struct QueueEntry {
    pub connection_id: String,
    pub user_id: String,
    pub username: String,
    pub requested_role: UserRole,
    queued_at: Instant,
}

struct RoomAdmission {
    active: usize,
    queue: VecDeque<QueueEntry>,
}

impl RoomAdmission {
    fn new() -> Self {
        Self {
            active: 0,
            queue: VecDeque::new(),
        }
    }
}

pub struct AdmissionController {
    limits: AdmissionLimits,
    rooms: Mutex<HashMap<String, RoomAdmission>>,
    global_active: Mutex<usize>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            rooms: Mutex::new(HashMap::new()),
            global_active: Mutex::new(0),
        }
    }

    pub async fn should_allow(
        &self,
        room_id: &str,
        connection_id: &str,
        user_id: &str,
        username: &str,
        requested_role: UserRole,
    ) -> AdmissionDecision {
        let global_active = *self.global_active.lock().await;
        if global_active >= self.limits.max_connections_global {
            return AdmissionDecision::Rejected(RejectReason::GlobalCap);
        }

        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(room_id.to_owned()).or_insert_with(RoomAdmission::new);

        if room.active < self.limits.max_connections_per_room {
            room.active += 1;
            drop(rooms);
            *self.global_active.lock().await += 1;
            return AdmissionDecision::Allowed;
        }

        if room.queue.len() >= self.limits.queue_size {
            return AdmissionDecision::Rejected(RejectReason::QueueFull);
        }

        room.queue.push_back(QueueEntry {
            connection_id: connection_id.to_owned(),
            user_id: user_id.to_owned(),
            username: username.to_owned(),
            requested_role,
            queued_at: Instant::now(),
        });
        AdmissionDecision::Queued(room.queue.len())
    }

    /// Call when a connection in `room_id` ends. Frees the slot and, if
    /// anyone is queued, promotes the FIFO head; returns its queue entry
    /// so the caller can complete the pending join and emit
    /// `connection_approved`.
    pub async fn release(&self, room_id: &str) -> Option<QueueEntry> {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return None;
        };
        room.active = room.active.saturating_sub(1);
        let mut global_active = self.global_active.lock().await;
        *global_active = global_active.saturating_sub(1);

        if let Some(next) = room.queue.pop_front() {
            room.active += 1;
            Some(next)
        } else {
            None
        }
    }

    /// Sweeps queued connections older than `connection_timeout`; returns
    /// their connection ids so the caller can emit `connection_timeout`
    /// and drop them.
    pub async fn sweep_queue_timeouts(&self) -> Vec<String> {
        let mut rooms = self.rooms.lock().await;
        let now = Instant::now();
        let mut timed_out = Vec::new();

        for room in rooms.values_mut() {
            let timeout = self.limits.connection_timeout;
            let mut remaining = VecDeque::with_capacity(room.queue.len());
            for entry in room.queue.drain(..) {
                if now.duration_since(entry.queued_at) >= timeout {
                    timed_out.push(entry.connection_id);
                } else {
                    remaining.push_back(entry);
                }
            }
            room.queue = remaining;
        }

        timed_out
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }
}

struct BatchGroup {
    items: Vec<serde_json::Value>,
    first_appended_at: Instant,
}

struct RoomBatches {
    groups: HashMap<String, BatchGroup>,
}

/// Batches fan-out by event name within a room, flushing on size or delay
/// thresholds.
pub struct BatchedEmitter {
    batch_size: usize,
    batch_delay: Duration,
    rooms: Mutex<HashMap<String, RoomBatches>>,
}

impl BatchedEmitter {
    pub fn new(batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            batch_size,
            batch_delay,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Appends one payload to the room/event's batch, or emits immediately
    /// when `immediate` is set. Returns the flushed events, if a flush was
    /// triggered, as `(event_name, payload)` pairs ready for
    /// [`NamespaceManager::emit_to`].
    pub async fn emit(
        &self,
        room_id: &str,
        event: &str,
        payload: serde_json::Value,
        immediate: bool,
    ) -> Vec<(String, serde_json::Value)> {
        if immediate {
            return vec![(event.to_owned(), payload)];
        }

        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| RoomBatches { groups: HashMap::new() });

        let group = room.groups.entry(event.to_owned()).or_insert_with(|| BatchGroup {
            items: Vec::new(),
            first_appended_at: Instant::now(),
        });
        group.items.push(payload);

        if group.items.len() >= self.batch_size {
            let group = room.groups.remove(event).expect("just inserted");
            return vec![flush_group(event, group)];
        }

        Vec::new()
    }

    /// Flushes any group in `room_id` whose delay has elapsed. Call on a
    /// timer tick.
    pub async fn flush_expired(&self, room_id: &str) -> Vec<(String, serde_json::Value)> {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return Vec::new();
        };

        let now = Instant::now();
        let expired: Vec<String> = room
            .groups
            .iter()
            .filter(|(_, group)| now.duration_since(group.first_appended_at) >= self.batch_delay)
            .map(|(event, _)| event.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|event| room.groups.remove(&event).map(|group| flush_group(&event, group)))
            .collect()
    }
}

fn flush_group(event: &str, group: BatchGroup) -> (String, serde_json::Value) {
    if group.items.len() == 1 {
        (event.to_owned(), group.items.into_iter().next().unwrap())
    } else {
        (format!("{event}_batch"), serde_json::json!(group.items))
    }
}

/// Delivers a batch of flushed `(event, payload)` pairs to a room's
/// namespace, honoring the fan-out-including-sender default.
pub async fn deliver_flushed(
    namespaces: &NamespaceManager,
    room_path: &str,
    flushed: Vec<(String, serde_json::Value)>,
) {
    for (event, payload) in flushed {
        namespaces.emit_to(room_path, &event, payload).await;
    }
}

/// One queued-connection timeout notification, ready to be written once
/// the caller has the connection's own sink.
pub fn connection_timeout_envelope() -> Envelope {
    Envelope {
        event: "connection_timeout".to_owned(),
        payload: serde_json::json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> AdmissionLimits {
        AdmissionLimits {
            max_connections_per_room: 2,
            max_connections_global: 1000,
            queue_size: 2,
            connection_timeout: Duration::from_secs(30),
            batch_size: 10,
            batch_delay: Duration::from_millis(100),
        }
    }

    async fn allow(controller: &AdmissionController, room_id: &str, connection_id: &str) -> AdmissionDecision {
        let user_id = format!("user-{connection_id}");
        let username = format!("User {connection_id}");
        controller
            .should_allow(room_id, connection_id, &user_id, &username, UserRole::Audience)
            .await
    }

    #[tokio::test]
    async fn room_fills_up_then_queues_then_rejects() {
        let controller = AdmissionController::new(limits());
        assert_eq!(allow(&controller, "r1", "c1").await, AdmissionDecision::Allowed);
        assert_eq!(allow(&controller, "r1", "c2").await, AdmissionDecision::Allowed);
        assert_eq!(allow(&controller, "r1", "c3").await, AdmissionDecision::Queued(1));
        assert_eq!(allow(&controller, "r1", "c4").await, AdmissionDecision::Queued(2));
        assert_eq!(
            allow(&controller, "r1", "c5").await,
            AdmissionDecision::Rejected(RejectReason::QueueFull)
        );
    }

    #[tokio::test]
    async fn releasing_a_slot_promotes_the_fifo_head() {
        let controller = AdmissionController::new(limits());
        allow(&controller, "r1", "c1").await;
        allow(&controller, "r1", "c2").await;
        allow(&controller, "r1", "c3").await;

        let promoted = controller.release("r1").await;
        assert_eq!(promoted.map(|e| e.connection_id), Some("c3".to_owned()));
    }

    #[tokio::test]
    async fn global_cap_rejects_even_with_room_capacity() {
        let mut tight = limits();
        tight.max_connections_global = 1;
        let controller = AdmissionController::new(tight);
        assert_eq!(allow(&controller, "r1", "c1").await, AdmissionDecision::Allowed);
        assert_eq!(
            allow(&controller, "r2", "c2").await,
            AdmissionDecision::Rejected(RejectReason::GlobalCap)
        );
    }

    #[tokio::test]
    async fn batch_flushes_a_multi_item_group_as_batch_event() {
        let emitter = BatchedEmitter::new(2, Duration::from_secs(60));
        let first = emitter.emit("r1", "play_note", serde_json::json!({"n": 1}), false).await;
        assert!(first.is_empty());

        let second = emitter.emit("r1", "play_note", serde_json::json!({"n": 2}), false).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, "play_note_batch");
        assert_eq!(second[0].1.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn single_item_flush_keeps_original_event_name() {
        let emitter = BatchedEmitter::new(10, Duration::from_millis(0));
        emitter.emit("r1", "chat_message", serde_json::json!({"m": "hi"}), false).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let flushed = emitter.flush_expired("r1").await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].0, "chat_message");
    }

    #[tokio::test]
    async fn immediate_emit_bypasses_batching() {
        let emitter = BatchedEmitter::new(10, Duration::from_secs(60));
        let result = emitter.emit("r1", "lock_conflict", serde_json::json!({}), true).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0, "lock_conflict");
    }
}
