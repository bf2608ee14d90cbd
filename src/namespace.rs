//! Namespace (channel-group) registry.
//!
//! Grounded on the teacher's `SharifyWsManager`, which keeps one map of
//! room-id to connected sinks and fans out by iterating it; generalized here
//! to arbitrary namespace paths (`/room/{id}`, `/approval/{id}`,
//! `/lobby-monitor`) so the approval sub-channel and the dispatcher's room
//! channel share one lifecycle/cleanup implementation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

pub const LOBBY_MONITOR_PATH: &str = "/lobby-monitor";

/// An outbound message ready to be written to one connection's socket.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub event: String,
    pub payload: serde_json::Value,
}

struct NamespaceRecord {
    created_at: Instant,
    last_activity: Instant,
    connections: HashMap<String, UnboundedSender<Envelope>>,
}

impl NamespaceRecord {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            last_activity: now,
            connections: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NamespaceStats {
    pub connection_count: usize,
    pub age: Duration,
    pub idle: Duration,
}

pub struct NamespaceManager {
    namespaces: RwLock<HashMap<String, NamespaceRecord>>,
}

impl Default for NamespaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceManager {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Creation is idempotent: a path that already has a handle is
    /// returned unchanged.
    pub async fn ensure(&self, path: &str) {
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(path.to_owned())
            .or_insert_with(|| NamespaceRecord::new(Instant::now()));
    }

    pub async fn join(&self, path: &str, connection_id: &str, sink: UnboundedSender<Envelope>) {
        let mut namespaces = self.namespaces.write().await;
        let record = namespaces
            .entry(path.to_owned())
            .or_insert_with(|| NamespaceRecord::new(Instant::now()));
        record.connections.insert(connection_id.to_owned(), sink);
        record.last_activity = Instant::now();
    }

    pub async fn leave(&self, path: &str, connection_id: &str) {
        let mut namespaces = self.namespaces.write().await;
        if let Some(record) = namespaces.get_mut(path) {
            record.connections.remove(connection_id);
            record.last_activity = Instant::now();
        }
    }

    /// Fans `event`/`payload` out to every connection in `path`, touching
    /// `lastActivity`. Dead sinks (receiver dropped) are pruned silently.
    pub async fn emit_to(&self, path: &str, event: &str, payload: serde_json::Value) {
        let mut namespaces = self.namespaces.write().await;
        let Some(record) = namespaces.get_mut(path) else {
            return;
        };
        record.last_activity = Instant::now();
        let envelope = Envelope {
            event: event.to_owned(),
            payload,
        };
        record
            .connections
            .retain(|_, sink| sink.send(envelope.clone()).is_ok());
    }

    /// Same as [`Self::emit_to`] but skips `excluded_connection_id` —
    /// used for the "exclude sender" broadcasts (broadcast preview/note,
    /// selection-change receipt).
    pub async fn emit_to_except(
        &self,
        path: &str,
        excluded_connection_id: &str,
        event: &str,
        payload: serde_json::Value,
    ) {
        let mut namespaces = self.namespaces.write().await;
        let Some(record) = namespaces.get_mut(path) else {
            return;
        };
        record.last_activity = Instant::now();
        let envelope = Envelope {
            event: event.to_owned(),
            payload,
        };
        record.connections.retain(|connection_id, sink| {
            if connection_id == excluded_connection_id {
                return true;
            }
            sink.send(envelope.clone()).is_ok()
        });
    }

    pub async fn emit_one(&self, path: &str, connection_id: &str, event: &str, payload: serde_json::Value) {
        let namespaces = self.namespaces.read().await;
        if let Some(record) = namespaces.get(path)
            && let Some(sink) = record.connections.get(connection_id)
        {
            let _ = sink.send(Envelope {
                event: event.to_owned(),
                payload,
            });
        }
    }

    pub async fn stats(&self, path: &str) -> Option<NamespaceStats> {
        let namespaces = self.namespaces.read().await;
        let record = namespaces.get(path)?;
        let now = Instant::now();
        Some(NamespaceStats {
            connection_count: record.connections.len(),
            age: now.duration_since(record.created_at),
            idle: now.duration_since(record.last_activity),
        })
    }

    pub async fn all_paths(&self) -> Vec<String> {
        self.namespaces.read().await.keys().cloned().collect()
    }

    /// Disconnects every connection in `path`, removes all listeners, and
    /// drops the record.
    pub async fn dispose(&self, path: &str) -> Option<NamespaceStats> {
        if path == LOBBY_MONITOR_PATH {
            return None;
        }
        let mut namespaces = self.namespaces.write().await;
        let record = namespaces.remove(path)?;
        let now = Instant::now();
        Some(NamespaceStats {
            connection_count: record.connections.len(),
            age: now.duration_since(record.created_at),
            idle: now.duration_since(record.last_activity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let manager = NamespaceManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.join("/room/r1", "a", tx).await;
        manager.ensure("/room/r1").await;
        // A second ensure() on an existing path must not reset its state.
        assert_eq!(manager.stats("/room/r1").await.unwrap().connection_count, 1);
    }

    #[tokio::test]
    async fn emit_to_reaches_all_but_excluded_connection() {
        let manager = NamespaceManager::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        manager.join("/room/r1", "a", tx_a).await;
        manager.join("/room/r1", "b", tx_b).await;

        manager
            .emit_to_except("/room/r1", "a", "note", serde_json::json!({"n": 1}))
            .await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn lobby_monitor_cannot_be_disposed() {
        let manager = NamespaceManager::new();
        manager.ensure(LOBBY_MONITOR_PATH).await;
        assert!(manager.dispose(LOBBY_MONITOR_PATH).await.is_none());
    }

    #[tokio::test]
    async fn dispose_removes_the_namespace() {
        let manager = NamespaceManager::new();
        manager.ensure("/approval/r1").await;
        let stats = manager.dispose("/approval/r1").await;
        assert!(stats.is_some());
        assert!(manager.stats("/approval/r1").await.is_none());
    }
}
