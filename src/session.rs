//! Session registry and grace-period table (C5).
//!
//! Grounded on the teacher's `SharifyWsManager`/`set_ws_user_state` pattern
//! (one map keyed by connection/user, replaced wholesale on reconnect), but
//! split into its own component per spec.md §9's "global mutable state"
//! redesign flag: this is an explicitly-constructed registry passed into
//! the dispatcher, not a module-level singleton.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::room::model::{RoomUser, UserRole};

pub const GRACE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceKind {
    Room,
    Approval,
    Lobby,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub room_id: String,
    pub user_id: String,
    pub namespace_path: String,
    pub kind: NamespaceKind,
    pub joined_at: Instant,
}

#[derive(Clone, Debug)]
pub struct GraceEntry {
    pub since: Instant,
    pub is_intended_leave: bool,
    pub snapshot: RoomUser,
}

#[derive(Default)]
struct Inner {
    /// connection_id -> session
    by_connection: HashMap<String, Session>,
    /// user_id -> connection_id, to enforce "at most one active room
    /// session per user; a new one evicts the old".
    by_user: HashMap<String, String>,
    /// (room_id, user_id) -> grace entry
    grace: HashMap<(String, String), GraceEntry>,
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Attaches a session for `connection_id`, evicting any prior session
    /// held by the same user (CAS-like replace, per spec.md §5).
    pub async fn attach(&self, connection_id: &str, session: Session) -> Option<String> {
        let mut inner = self.inner.write().await;
        let evicted = inner.by_user.insert(session.user_id.clone(), connection_id.to_owned());

        let evicted_connection = match evicted {
            Some(prev_connection) if prev_connection != connection_id => {
                inner.by_connection.remove(&prev_connection);
                Some(prev_connection)
            }
            _ => None,
        };

        inner.by_connection.insert(connection_id.to_owned(), session);
        evicted_connection
    }

    pub async fn detach(&self, connection_id: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;
        let session = inner.by_connection.remove(connection_id)?;
        if inner.by_user.get(&session.user_id) == Some(&connection_id.to_owned()) {
            inner.by_user.remove(&session.user_id);
        }
        Some(session)
    }

    pub async fn get(&self, connection_id: &str) -> Option<Session> {
        self.inner.read().await.by_connection.get(connection_id).cloned()
    }

    pub async fn get_by_user(&self, user_id: &str) -> Option<Session> {
        let inner = self.inner.read().await;
        let connection_id = inner.by_user.get(user_id)?;
        inner.by_connection.get(connection_id).cloned()
    }

    /// The connection id currently holding `user_id`'s session, if any —
    /// used to notify a user directly (e.g. the room owner) outside of any
    /// particular dispatch context.
    pub async fn connection_id_for_user(&self, user_id: &str) -> Option<String> {
        self.inner.read().await.by_user.get(user_id).cloned()
    }

    /// Detaches whatever session `user_id` currently holds, if any.
    pub async fn evict_user(&self, user_id: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;
        let connection_id = inner.by_user.remove(user_id)?;
        inner.by_connection.remove(&connection_id)
    }

    pub async fn sessions_in_namespace(&self, namespace_path: &str) -> Vec<(String, Session)> {
        self.inner
            .read()
            .await
            .by_connection
            .iter()
            .filter(|(_, s)| s.namespace_path == namespace_path)
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }

    pub async fn add_grace(
        &self,
        user_id: &str,
        room_id: &str,
        snapshot: RoomUser,
        intended: bool,
    ) {
        let mut inner = self.inner.write().await;
        inner.grace.insert(
            (room_id.to_owned(), user_id.to_owned()),
            GraceEntry {
                since: Instant::now(),
                is_intended_leave: intended,
                snapshot,
            },
        );
    }

    pub async fn is_in_grace(&self, user_id: &str, room_id: &str) -> bool {
        self.inner
            .read()
            .await
            .grace
            .contains_key(&(room_id.to_owned(), user_id.to_owned()))
    }

    pub async fn take_grace(&self, user_id: &str, room_id: &str) -> Option<GraceEntry> {
        self.inner
            .write()
            .await
            .grace
            .remove(&(room_id.to_owned(), user_id.to_owned()))
    }

    pub async fn clear_grace(&self, user_id: &str, room_id: &str) {
        self.inner
            .write()
            .await
            .grace
            .remove(&(room_id.to_owned(), user_id.to_owned()));
    }

    /// Expires grace entries older than [`GRACE_TTL`]; returns the set of
    /// room ids that lost at least one entry, per spec.md §4.5.
    pub async fn expire_sweep(&self) -> std::collections::HashSet<String> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let mut affected = std::collections::HashSet::new();

        inner.grace.retain(|(room_id, _), entry| {
            let expired = now.duration_since(entry.since) >= GRACE_TTL;
            if expired {
                affected.insert(room_id.clone());
            }
            !expired
        });

        affected
    }

    /// Stale-session sweep: detaches sessions older than `threshold`
    /// (default 60 min, per spec.md §4.5), run from C11.
    pub async fn sweep_stale(&self, threshold: Duration) -> usize {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let stale: Vec<String> = inner
            .by_connection
            .iter()
            .filter(|(_, s)| now.duration_since(s.joined_at) > threshold)
            .map(|(id, _)| id.clone())
            .collect();

        for connection_id in &stale {
            if let Some(session) = inner.by_connection.remove(connection_id)
                && inner.by_user.get(&session.user_id) == Some(connection_id)
            {
                inner.by_user.remove(&session.user_id);
            }
        }

        stale.len()
    }
}

/// Builds a fresh member snapshot with the role requested at join time
/// (spec.md §3's `role ∈ {room_owner, band_member, audience}`). `join_room`
/// and the approval flow both funnel through here so a `band_member`
/// request doesn't silently downgrade to `audience` on admission.
pub fn role_snapshot(user_id: &str, username: &str, role: UserRole) -> RoomUser {
    RoomUser {
        user_id: user_id.to_owned(),
        username: username.to_owned(),
        role,
        current_instrument: None,
        current_category: None,
        is_ready: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user_id: &str, room_id: &str) -> Session {
        Session {
            room_id: room_id.to_owned(),
            user_id: user_id.to_owned(),
            namespace_path: format!("/room/{room_id}"),
            kind: NamespaceKind::Room,
            joined_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn new_session_for_same_user_evicts_old_connection() {
        let registry = SessionRegistry::new();
        registry.attach("conn-1", session("alice", "room-1")).await;
        let evicted = registry.attach("conn-2", session("alice", "room-1")).await;

        assert_eq!(evicted.as_deref(), Some("conn-1"));
        assert!(registry.get("conn-1").await.is_none());
        assert!(registry.get("conn-2").await.is_some());
    }

    #[tokio::test]
    async fn grace_entry_is_present_until_cleared() {
        let registry = SessionRegistry::new();
        let snapshot = role_snapshot("alice", "alice", UserRole::Audience);
        registry.add_grace("alice", "room-1", snapshot, false).await;

        assert!(registry.is_in_grace("alice", "room-1").await);
        registry.clear_grace("alice", "room-1").await;
        assert!(!registry.is_in_grace("alice", "room-1").await);
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.attach("conn-1", session("alice", "room-1")).await;
        assert!(registry.detach("conn-1").await.is_some());
        assert!(registry.detach("conn-1").await.is_none());
    }
}
