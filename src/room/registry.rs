//! Room membership registry: the `Room` shell (owner, users, pending
//! members, metronome) as distinct from the arrangement payload in
//! [`crate::room::store`]. Grounded on the teacher's `RoomManager` (one
//! `HashMap<RoomID, Room>` behind a single `RwLock`) — membership churn is
//! much lower-volume than arrangement mutation, so one lock for the whole
//! map (rather than per-room, as in `RoomStateStore`) matches the
//! teacher's own tradeoff.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::room::model::{Room, RoomType, RoomUser, UserRole};

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    /// Rooms that lost their last member, keyed by when that happened.
    /// Spec.md §3 destroys a room "when empty beyond a short grace" rather
    /// than the instant it empties; [`Self::sweep_empty`] is what actually
    /// reclaims them, driven by C11's cleanup cadence.
    empty_since: RwLock<HashMap<String, Instant>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, room: Room) {
        self.rooms.write().await.insert(room.id.clone(), room);
    }

    pub async fn get(&self, room_id: &str) -> Option<Room> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn exists(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn remove(&self, room_id: &str) -> Option<Room> {
        self.rooms.write().await.remove(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn all_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn all(&self) -> Vec<Room> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .is_some_and(|room| room.is_member(user_id))
    }

    pub async fn is_owner(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .is_some_and(|room| room.owner_user_id == user_id)
    }

    pub async fn add_user(&self, room_id: &str, user: RoomUser) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        if !room.is_member(&user.user_id) {
            room.users.push(user);
        }
        drop(rooms);
        self.empty_since.write().await.remove(room_id);
        true
    }

    /// Removes a user and returns whether the room is now empty. An empty
    /// room is not destroyed here — it is timestamped so [`Self::sweep_empty`]
    /// can reclaim it once the grace window passes, giving the last member a
    /// chance to re-join (spec.md §3, §7).
    pub async fn remove_user(&self, room_id: &str, user_id: &str) -> Option<bool> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        room.users.retain(|u| u.user_id != user_id);
        let now_empty = room.users.is_empty();
        drop(rooms);

        if now_empty {
            self.empty_since.write().await.entry(room_id.to_owned()).or_insert_with(Instant::now);
        }
        Some(now_empty)
    }

    /// Reclaims rooms that have been empty past `threshold`; returns their
    /// ids so the caller can also clear their arrangement state and dispose
    /// their namespaces.
    pub async fn sweep_empty(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut empty_since = self.empty_since.write().await;
        let expired: Vec<String> = empty_since
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= threshold)
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return expired;
        }

        let mut rooms = self.rooms.write().await;
        for room_id in &expired {
            empty_since.remove(room_id);
            rooms.remove(room_id);
        }
        expired
    }

    pub async fn add_pending_member(&self, room_id: &str, user: RoomUser) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        if !room.pending_members.iter().any(|u| u.user_id == user.user_id) {
            room.pending_members.push(user);
        }
        true
    }

    pub async fn take_pending_member(&self, room_id: &str, user_id: &str) -> Option<RoomUser> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        let pos = room.pending_members.iter().position(|u| u.user_id == user_id)?;
        Some(room.pending_members.remove(pos))
    }

    /// Swaps ownership to `new_owner_user_id`, promoting them to
    /// `RoomOwner` if they weren't already a band member role.
    pub async fn transfer_ownership(&self, room_id: &str, new_owner_user_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        if !room.is_member(new_owner_user_id) {
            return false;
        }
        room.owner_user_id = new_owner_user_id.to_owned();
        if let Some(user) = room.user_mut(new_owner_user_id) {
            user.role = UserRole::RoomOwner;
        }
        true
    }

    /// True if `user_id` is the sole remaining member and the owner — used
    /// to decide whether departure should trigger room teardown instead of
    /// owner handoff (see DESIGN.md's owner-handoff decision).
    pub async fn is_sole_remaining_owner(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms.read().await.get(room_id).is_some_and(|room| {
            room.owner_user_id == user_id && room.users.len() == 1 && room.users[0].user_id == user_id
        })
    }

    /// Picks the next owner on departure of the current one: oldest
    /// remaining band member, falling back to any remaining member.
    pub async fn pick_next_owner(&self, room_id: &str, departing_user_id: &str) -> Option<String> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(room_id)?;
        room.users
            .iter()
            .filter(|u| u.user_id != departing_user_id)
            .find(|u| u.role == UserRole::BandMember)
            .or_else(|| room.users.iter().find(|u| u.user_id != departing_user_id))
            .map(|u| u.user_id.clone())
    }

    pub async fn update_metronome(&self, room_id: &str, bpm: f64, last_tick_ts: u64) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(room_id) {
            room.metronome.bpm = bpm;
            room.metronome.last_tick_ts = last_tick_ts;
        }
    }

    pub async fn room_type(&self, room_id: &str) -> Option<RoomType> {
        self.rooms.read().await.get(room_id).map(|r| r.room_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::model::Metronome;

    fn room(id: &str, owner: &str) -> Room {
        Room {
            id: id.to_owned(),
            name: "jam".into(),
            owner_user_id: owner.to_owned(),
            is_private: false,
            is_hidden: false,
            created_at: 0,
            room_type: RoomType::Arrange,
            metronome: Metronome { bpm: 120.0, last_tick_ts: 0 },
            users: Vec::new(),
            pending_members: Vec::new(),
        }
    }

    fn user(id: &str, role: UserRole) -> RoomUser {
        RoomUser {
            user_id: id.to_owned(),
            username: id.to_owned(),
            role,
            current_instrument: None,
            current_category: None,
            is_ready: false,
        }
    }

    #[tokio::test]
    async fn transfer_ownership_requires_membership() {
        let registry = RoomRegistry::new();
        registry.create(room("r1", "alice")).await;
        registry.add_user("r1", user("alice", UserRole::RoomOwner)).await;

        assert!(!registry.transfer_ownership("r1", "bob").await);

        registry.add_user("r1", user("bob", UserRole::BandMember)).await;
        assert!(registry.transfer_ownership("r1", "bob").await);
        assert!(registry.is_owner("r1", "bob").await);
    }

    #[tokio::test]
    async fn sole_remaining_owner_is_detected() {
        let registry = RoomRegistry::new();
        registry.create(room("r1", "alice")).await;
        registry.add_user("r1", user("alice", UserRole::RoomOwner)).await;

        assert!(registry.is_sole_remaining_owner("r1", "alice").await);

        registry.add_user("r1", user("bob", UserRole::BandMember)).await;
        assert!(!registry.is_sole_remaining_owner("r1", "alice").await);
    }

    #[tokio::test]
    async fn pick_next_owner_prefers_band_members() {
        let registry = RoomRegistry::new();
        registry.create(room("r1", "alice")).await;
        registry.add_user("r1", user("alice", UserRole::RoomOwner)).await;
        registry.add_user("r1", user("bob", UserRole::Audience)).await;
        registry.add_user("r1", user("carol", UserRole::BandMember)).await;

        let next = registry.pick_next_owner("r1", "alice").await;
        assert_eq!(next.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn all_ids_lists_every_created_room() {
        let registry = RoomRegistry::new();
        registry.create(room("r1", "alice")).await;
        registry.create(room("r2", "bob")).await;

        let mut ids = registry.all_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[tokio::test]
    async fn emptied_room_survives_until_swept_and_rejoin_clears_the_marker() {
        let registry = RoomRegistry::new();
        registry.create(room("r1", "alice")).await;
        registry.add_user("r1", user("alice", UserRole::RoomOwner)).await;

        assert_eq!(registry.remove_user("r1", "alice").await, Some(true));
        assert!(registry.exists("r1").await, "room must survive its grace window");

        assert_eq!(registry.sweep_empty(Duration::from_secs(300)).await, Vec::<String>::new());
        assert!(registry.exists("r1").await);

        registry.add_user("r1", user("alice", UserRole::RoomOwner)).await;
        assert_eq!(registry.sweep_empty(Duration::from_millis(0)).await, Vec::<String>::new());
        assert!(registry.exists("r1").await, "re-join must clear the empty marker");
    }

    #[tokio::test]
    async fn empty_room_past_threshold_is_reclaimed() {
        let registry = RoomRegistry::new();
        registry.create(room("r1", "alice")).await;
        registry.add_user("r1", user("alice", UserRole::RoomOwner)).await;
        registry.remove_user("r1", "alice").await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = registry.sweep_empty(Duration::from_millis(0)).await;
        assert_eq!(reclaimed, vec!["r1".to_string()]);
        assert!(!registry.exists("r1").await);
    }
}
