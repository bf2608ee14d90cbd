//! Connection-level sink registry, independent of namespace membership.
//!
//! A connection is registered here the moment its socket is accepted, before
//! it has joined (or been admitted into) any room/approval namespace. This
//! lets admission control deliver `connection_rejected`, `connection_approved`,
//! and `connection_timeout` to a socket that is still waiting in the FIFO
//! queue or was never let past the door. Grounded on the same
//! id-to-sink-map shape as [`crate::namespace::NamespaceManager`], split out
//! because namespace membership and raw connection existence have different
//! lifetimes: a queued connection has no namespace yet.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use crate::namespace::Envelope;

#[derive(Default)]
pub struct ConnectionRegistry {
    sinks: RwLock<HashMap<String, UnboundedSender<Envelope>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection_id: &str, sink: UnboundedSender<Envelope>) {
        self.sinks.write().await.insert(connection_id.to_owned(), sink);
    }

    pub async fn unregister(&self, connection_id: &str) {
        self.sinks.write().await.remove(connection_id);
    }

    /// Best-effort send; silently does nothing if the connection is gone.
    pub async fn send(&self, connection_id: &str, event: &str, payload: serde_json::Value) {
        let sinks = self.sinks.read().await;
        if let Some(sink) = sinks.get(connection_id) {
            let _ = sink.send(Envelope {
                event: event.to_owned(),
                payload,
            });
        }
    }

    pub async fn send_many(&self, connection_ids: &[String], event: &str, payload: serde_json::Value) {
        let sinks = self.sinks.read().await;
        for connection_id in connection_ids {
            if let Some(sink) = sinks.get(connection_id) {
                let _ = sink.send(Envelope {
                    event: event.to_owned(),
                    payload: payload.clone(),
                });
            }
        }
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.sinks.read().await.contains_key(connection_id)
    }

    pub async fn count(&self) -> usize {
        self.sinks.read().await.len()
    }

    /// A clone of the raw sink, for handing to [`crate::namespace::NamespaceManager::join`]
    /// once a connection's session gains a namespace path.
    pub async fn sink(&self, connection_id: &str) -> Option<UnboundedSender<Envelope>> {
        self.sinks.read().await.get(connection_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn send_reaches_a_registered_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c1", tx).await;

        registry.send("c1", "connection_approved", serde_json::json!({})).await;

        let envelope = rx.try_recv().expect("sent");
        assert_eq!(envelope.event, "connection_approved");
    }

    #[tokio::test]
    async fn send_to_unregistered_connection_is_a_silent_noop() {
        let registry = ConnectionRegistry::new();
        registry.send("ghost", "connection_rejected", serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn sink_returns_a_clone_of_the_registered_sender() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c1", tx).await;

        let sink = registry.sink("c1").await.expect("registered");
        sink.send(Envelope { event: "ping".into(), payload: serde_json::json!({}) }).unwrap();

        assert_eq!(rx.try_recv().unwrap().event, "ping");
    }

    #[tokio::test]
    async fn unregister_stops_further_delivery() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c1", tx).await;
        registry.unregister("c1").await;

        registry.send("c1", "connection_timeout", serde_json::json!({})).await;
        assert!(rx.try_recv().is_err());
    }
}
