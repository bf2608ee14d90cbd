//! Approval coordinator for private-room join requests (C9, spec.md §4.9).
//!
//! Grounded on [`crate::session::SessionRegistry`]'s "primary map keyed by
//! connection, secondary index by user, new entry evicts old" shape, reused
//! here for pending approvals instead of active sessions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::room::model::UserRole;

pub const APPROVAL_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct ApprovalSession {
    pub connection_id: String,
    pub room_id: String,
    pub requester_user_id: String,
    pub requester_username: String,
    pub requested_role: UserRole,
    pub owner_user_id: String,
    pub requested_at: Instant,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ApprovalStats {
    pub pending: usize,
}

#[derive(Default)]
struct Inner {
    /// connection_id -> session
    by_connection: HashMap<String, ApprovalSession>,
    /// (room_id, user_id) -> connection_id — a user has at most one
    /// pending approval; a new request evicts the old.
    by_user: HashMap<(String, String), String>,
}

pub enum RequestOutcome {
    Registered,
    /// A prior pending request from the same user in the same room was
    /// evicted; its connection id is returned so the caller can notify it.
    Replaced { evicted_connection_id: String },
}

pub struct ApprovalCoordinator {
    inner: RwLock<Inner>,
}

impl Default for ApprovalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalCoordinator {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn request(&self, session: ApprovalSession) -> RequestOutcome {
        let mut inner = self.inner.write().await;
        let key = (session.room_id.clone(), session.requester_user_id.clone());
        let connection_id = session.connection_id.clone();

        let evicted = inner.by_user.insert(key, connection_id.clone());
        inner.by_connection.insert(connection_id, session);

        match evicted {
            Some(prev) => RequestOutcome::Replaced {
                evicted_connection_id: prev,
            },
            None => RequestOutcome::Registered,
        }
    }

    pub async fn get(&self, connection_id: &str) -> Option<ApprovalSession> {
        self.inner.read().await.by_connection.get(connection_id).cloned()
    }

    /// Removes a session by connection id — used on owner response,
    /// explicit cancel, and requester disconnect-before-response.
    pub async fn remove(&self, connection_id: &str) -> Option<ApprovalSession> {
        let mut inner = self.inner.write().await;
        let session = inner.by_connection.remove(connection_id)?;
        let key = (session.room_id.clone(), session.requester_user_id.clone());
        if inner.by_user.get(&key) == Some(&connection_id.to_owned()) {
            inner.by_user.remove(&key);
        }
        Some(session)
    }

    /// Expires sessions older than [`APPROVAL_TTL`]; returns them so the
    /// caller can emit `approval_timed_out` to each requester and a
    /// cancellation hint to each owner.
    pub async fn expire_sweep(&self) -> Vec<ApprovalSession> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let expired: Vec<String> = inner
            .by_connection
            .iter()
            .filter(|(_, s)| now.duration_since(s.requested_at) >= APPROVAL_TTL)
            .map(|(id, _)| id.clone())
            .collect();

        let mut sessions = Vec::with_capacity(expired.len());
        for connection_id in expired {
            if let Some(session) = inner.by_connection.remove(&connection_id) {
                let key = (session.room_id.clone(), session.requester_user_id.clone());
                if inner.by_user.get(&key) == Some(&connection_id) {
                    inner.by_user.remove(&key);
                }
                sessions.push(session);
            }
        }
        sessions
    }

    /// Drops every pending approval for `room_id` — used when a stale
    /// `/approval/{roomId}` namespace is disposed (spec.md §4.11 rule 3).
    pub async fn cleanup_room(&self, room_id: &str) -> Vec<ApprovalSession> {
        let mut inner = self.inner.write().await;
        let to_remove: Vec<String> = inner
            .by_connection
            .iter()
            .filter(|(_, s)| s.room_id == room_id)
            .map(|(id, _)| id.clone())
            .collect();

        let mut sessions = Vec::with_capacity(to_remove.len());
        for connection_id in to_remove {
            if let Some(session) = inner.by_connection.remove(&connection_id) {
                let key = (session.room_id.clone(), session.requester_user_id.clone());
                inner.by_user.remove(&key);
                sessions.push(session);
            }
        }
        sessions
    }

    pub async fn stats(&self) -> ApprovalStats {
        ApprovalStats {
            pending: self.inner.read().await.by_connection.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(connection_id: &str, room_id: &str, user_id: &str) -> ApprovalSession {
        ApprovalSession {
            connection_id: connection_id.to_owned(),
            room_id: room_id.to_owned(),
            requester_user_id: user_id.to_owned(),
            requester_username: user_id.to_owned(),
            requested_role: UserRole::Audience,
            owner_user_id: "owner".to_owned(),
            requested_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn second_request_from_same_user_evicts_the_first() {
        let coordinator = ApprovalCoordinator::new();
        coordinator.request(session("conn-1", "r1", "alice")).await;
        let outcome = coordinator.request(session("conn-2", "r1", "alice")).await;

        match outcome {
            RequestOutcome::Replaced { evicted_connection_id } => {
                assert_eq!(evicted_connection_id, "conn-1");
            }
            RequestOutcome::Registered => panic!("expected eviction"),
        }
        assert!(coordinator.get("conn-1").await.is_none());
        assert!(coordinator.get("conn-2").await.is_some());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_clears_the_user_index() {
        let coordinator = ApprovalCoordinator::new();
        coordinator.request(session("conn-1", "r1", "alice")).await;
        assert!(coordinator.remove("conn-1").await.is_some());
        assert!(coordinator.remove("conn-1").await.is_none());

        // A fresh request for the same user must not be seen as an eviction.
        let outcome = coordinator.request(session("conn-2", "r1", "alice")).await;
        assert!(matches!(outcome, RequestOutcome::Registered));
    }

    #[tokio::test]
    async fn cleanup_room_drops_only_that_rooms_sessions() {
        let coordinator = ApprovalCoordinator::new();
        coordinator.request(session("conn-1", "r1", "alice")).await;
        coordinator.request(session("conn-2", "r2", "bob")).await;

        let dropped = coordinator.cleanup_room("r1").await;
        assert_eq!(dropped.len(), 1);
        assert!(coordinator.get("conn-1").await.is_none());
        assert!(coordinator.get("conn-2").await.is_some());
    }
}
