//! Authoritative per-room arrangement state store (C6, spec.md §4.6).
//!
//! Concurrency contract (spec.md §5): a read-modify-write over one room is
//! serialized, different rooms proceed in parallel, and no I/O may happen
//! while the per-room lock is held. This is implemented as a `RwLock` over
//! the room index (many readers for lookups, a writer only on
//! `init_state`/`clear_state`) plus one `tokio::sync::Mutex` per room for
//! the actual read-modify-write traffic — the same "process-wide read-mostly
//! map, fine-grained per-unit lock" shape the teacher uses for its
//! `RwLock<RoomManager>`, just pushed one level deeper so that two
//! different rooms never block each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::RoomFabricError;
use crate::id::now_ms;
use crate::room::model::*;

pub struct RoomStateStore {
    rooms: RwLock<HashMap<String, Arc<Mutex<ArrangeRoomState>>>>,
}

impl Default for RoomStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStateStore {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    async fn handle(&self, room_id: &str) -> Option<Arc<Mutex<ArrangeRoomState>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Runs `f` against the room's state under its own lock, without
    /// holding the map-level `RwLock` for the duration (per spec.md §5: no
    /// I/O inside the critical section, and `f` itself must not suspend).
    async fn with_state<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut ArrangeRoomState) -> T,
    ) -> Result<T, RoomFabricError> {
        let handle = self
            .handle(room_id)
            .await
            .ok_or_else(|| RoomFabricError::NotFound(format!("room {room_id} has no state")))?;
        let mut guard = handle.lock().await;
        let result = f(&mut guard);
        guard.last_updated = now_ms();
        Ok(result)
    }

    pub async fn get_state(&self, room_id: &str) -> Option<ArrangeRoomState> {
        let handle = self.handle(room_id).await?;
        Some(handle.lock().await.clone())
    }

    pub async fn init_state(&self, room_id: &str) -> ArrangeRoomState {
        let mut rooms = self.rooms.write().await;
        let entry = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(ArrangeRoomState::new(now_ms()))));
        entry.lock().await.clone()
    }

    pub async fn clear_state(&self, room_id: &str) {
        self.rooms.write().await.remove(room_id);
    }

    pub async fn add_track(&self, room_id: &str, track: Track) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| state.tracks.push(track)).await
    }

    pub async fn update_track(
        &self,
        room_id: &str,
        track_id: &str,
        patch: impl FnOnce(&mut Track),
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            if let Some(track) = state.track_mut(track_id) {
                patch(track);
            }
        })
        .await
    }

    pub async fn reorder_tracks(
        &self,
        room_id: &str,
        ordered_ids: Vec<TrackId>,
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            let mut reordered = Vec::with_capacity(state.tracks.len());
            for id in &ordered_ids {
                if let Some(pos) = state.tracks.iter().position(|t| &t.id == id) {
                    reordered.push(state.tracks.remove(pos));
                }
            }
            reordered.extend(state.tracks.drain(..));
            state.tracks = reordered;
        })
        .await
    }

    /// Removes a track, its regions, and prunes selection — spec.md §4.6 /
    /// invariant (I5).
    pub async fn remove_track(
        &self,
        room_id: &str,
        track_id: &str,
    ) -> Result<Vec<Region>, RoomFabricError> {
        self.with_state(room_id, |state| {
            let Some(pos) = state.tracks.iter().position(|t| t.id == track_id) else {
                return Vec::new();
            };
            let track = state.tracks.remove(pos);

            let removed: Vec<Region> = track
                .region_ids
                .iter()
                .filter_map(|rid| state.regions.remove(rid))
                .collect();

            state.selected_region_ids.retain(|rid| {
                !removed.iter().any(|r| r.id() == rid)
            });
            if state.selected_track_id.as_deref() == Some(track_id) {
                state.selected_track_id = None;
            }
            state.locks.retain(|element_id, _| {
                element_id != track_id && !removed.iter().any(|r| r.id() == element_id)
            });

            removed
        })
        .await
    }

    pub async fn add_region(&self, room_id: &str, region: Region) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            if let Some(track) = state.track_mut(region.track_id()) {
                track.region_ids.push(region.common().id.clone());
            }
            state.regions.insert(region.common().id.clone(), region);
        })
        .await
    }

    /// Updates a region. If the patch changes `trackId`, atomically moves
    /// the region between tracks' `regionIds` lists (invariant 1).
    pub async fn update_region(
        &self,
        room_id: &str,
        region_id: &str,
        patch: impl FnOnce(&mut Region),
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            let Some(mut region) = state.regions.remove(region_id) else {
                return;
            };
            let old_track_id = region.track_id().to_owned();
            patch(&mut region);
            let new_track_id = region.track_id().to_owned();

            if old_track_id != new_track_id {
                if let Some(old_track) = state.track_mut(&old_track_id) {
                    old_track.region_ids.retain(|id| id != region_id);
                }
                if let Some(new_track) = state.track_mut(&new_track_id) {
                    new_track.region_ids.push(region_id.to_owned());
                } else {
                    // Target track doesn't exist: refuse the move, keep the
                    // region on its original track rather than orphaning it.
                    region.common_mut().track_id = old_track_id.clone();
                    if let Some(old_track) = state.track_mut(&old_track_id) {
                        old_track.region_ids.push(region_id.to_owned());
                    }
                }
            }

            state.regions.insert(region_id.to_owned(), region);
        })
        .await
    }

    pub async fn remove_region(
        &self,
        room_id: &str,
        region_id: &str,
    ) -> Result<Option<Region>, RoomFabricError> {
        self.with_state(room_id, |state| {
            let region = state.regions.remove(region_id)?;
            if let Some(track) = state.track_mut(region.track_id()) {
                track.region_ids.retain(|id| id != region_id);
            }
            state.selected_region_ids.remove(region_id);
            state.locks.remove(region_id);
            Some(region)
        })
        .await
    }

    pub async fn set_bpm(&self, room_id: &str, bpm: f64) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| state.bpm = bpm).await
    }

    /// Resets the arrangement wholesale (spec.md §4.8, "state sync on
    /// project upload"): tracks, regions, bpm, time signature, and synth
    /// states are replaced outright; selection is cleared rather than
    /// filtered, since none of the old selection can possibly still apply.
    pub async fn replace_project(
        &self,
        room_id: &str,
        tracks: Vec<Track>,
        regions: HashMap<RegionId, Region>,
        bpm: f64,
        time_signature: TimeSignature,
        synth_states: HashMap<TrackId, serde_json::Value>,
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            state.tracks = tracks;
            state.regions = regions;
            state.bpm = bpm;
            state.time_signature = time_signature;
            state.synth_states = synth_states;
            state.selected_track_id = None;
            state.selected_region_ids.clear();
            state.locks.clear();
        })
        .await
    }

    pub async fn set_time_signature(
        &self,
        room_id: &str,
        time_signature: TimeSignature,
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| state.time_signature = time_signature)
            .await
    }

    pub async fn update_synth_params(
        &self,
        room_id: &str,
        track_id: &str,
        patch: serde_json::Value,
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            let entry = state
                .synth_states
                .entry(track_id.to_owned())
                .or_insert_with(|| serde_json::json!({}));
            merge_json(entry, &patch);
        })
        .await
    }

    pub async fn add_marker(&self, room_id: &str, marker: Marker) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| state.markers.push_back(marker)).await
    }

    pub async fn update_marker(
        &self,
        room_id: &str,
        marker_id: &str,
        patch: impl FnOnce(&mut Marker),
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            if let Some(marker) = state.markers.iter_mut().find(|m| m.id == marker_id) {
                patch(marker);
            }
        })
        .await
    }

    pub async fn remove_marker(
        &self,
        room_id: &str,
        marker_id: &str,
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            state.markers.retain(|m| m.id != marker_id);
        })
        .await
    }

    pub async fn update_selection(
        &self,
        room_id: &str,
        selected_track_id: Option<Option<TrackId>>,
        selected_region_ids: Option<HashSet<RegionId>>,
    ) -> Result<(), RoomFabricError> {
        self.with_state(room_id, |state| {
            if let Some(track_id) = selected_track_id {
                state.selected_track_id = track_id.filter(|id| state.track(id).is_some());
            }
            if let Some(region_ids) = selected_region_ids {
                state.selected_region_ids = region_ids
                    .into_iter()
                    .filter(|id| state.regions.contains_key(id))
                    .collect();
            }
        })
        .await
    }

    /// Succeeds if no lock exists, or the existing lock belongs to the same
    /// user (spec.md §4.6).
    pub async fn acquire_lock(
        &self,
        room_id: &str,
        element_id: &str,
        lock: LockInfo,
    ) -> Result<bool, RoomFabricError> {
        self.with_state(room_id, |state| {
            match state.locks.get(element_id) {
                Some(existing) if existing.user_id != lock.user_id => false,
                _ => {
                    state.locks.insert(element_id.to_owned(), lock);
                    true
                }
            }
        })
        .await
    }

    pub async fn release_lock(
        &self,
        room_id: &str,
        element_id: &str,
        user_id: &str,
    ) -> Result<bool, RoomFabricError> {
        self.with_state(room_id, |state| match state.locks.get(element_id) {
            Some(existing) if existing.user_id == user_id => {
                state.locks.remove(element_id);
                true
            }
            _ => false,
        })
        .await
    }

    /// Releases every lock owned by `user_id`; returns the freed element
    /// ids (invariant I4).
    pub async fn release_user_locks(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<HashSet<ElementId>, RoomFabricError> {
        self.with_state(room_id, |state| {
            let released: HashSet<ElementId> = state
                .locks
                .iter()
                .filter(|(_, lock)| lock.user_id == user_id)
                .map(|(id, _)| id.clone())
                .collect();
            state.locks.retain(|_, lock| lock.user_id != user_id);
            released
        })
        .await
    }

    pub async fn is_locked(
        &self,
        room_id: &str,
        element_id: &str,
    ) -> Result<Option<LockInfo>, RoomFabricError> {
        self.with_state(room_id, |state| state.locks.get(element_id).cloned())
            .await
    }
}

/// Shallow merge of a JSON patch into an existing JSON object, used for
/// synth-parameter updates (the opaque per-track parameter map of spec.md
/// §3 is never interpreted, only merged).
fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (Some(target_obj), Some(patch_obj)) = (target.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_obj {
            target_obj.insert(key.clone(), value.clone());
        }
    } else {
        *target = patch.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> Track {
        Track::new(id.to_owned(), "Lead".into(), TrackType::Midi)
    }

    fn region(id: &str, track_id: &str) -> Region {
        Region::Midi {
            common: RegionCommon {
                id: id.to_owned(),
                track_id: track_id.to_owned(),
                name: "Verse".into(),
                start: 0.0,
                length: 4.0,
                loop_enabled: false,
                loop_iterations: 1,
                color: None,
            },
            data: MidiRegionData {
                notes: Vec::new(),
                sustain_events: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn add_region_maintains_track_membership_invariant() {
        let store = RoomStateStore::new();
        store.init_state("r1").await;
        store.add_track("r1", track("t1")).await.unwrap();
        store.add_region("r1", region("reg1", "t1")).await.unwrap();

        let state = store.get_state("r1").await.unwrap();
        assert!(state.check_region_track_invariant());
        assert_eq!(state.track("t1").unwrap().region_ids, vec!["reg1"]);
    }

    #[tokio::test]
    async fn moving_a_region_to_another_track_updates_both_sides() {
        let store = RoomStateStore::new();
        store.init_state("r1").await;
        store.add_track("r1", track("t1")).await.unwrap();
        store.add_track("r1", track("t2")).await.unwrap();
        store.add_region("r1", region("reg1", "t1")).await.unwrap();

        store
            .update_region("r1", "reg1", |r| r.common_mut().track_id = "t2".into())
            .await
            .unwrap();

        let state = store.get_state("r1").await.unwrap();
        assert!(state.check_region_track_invariant());
        assert!(state.track("t1").unwrap().region_ids.is_empty());
        assert_eq!(state.track("t2").unwrap().region_ids, vec!["reg1"]);
    }

    #[tokio::test]
    async fn remove_track_removes_its_regions_and_prunes_selection() {
        let store = RoomStateStore::new();
        store.init_state("r1").await;
        store.add_track("r1", track("t1")).await.unwrap();
        store.add_region("r1", region("reg1", "t1")).await.unwrap();
        store
            .update_selection(
                "r1",
                Some(Some("t1".into())),
                Some(HashSet::from(["reg1".to_owned()])),
            )
            .await
            .unwrap();

        let removed = store.remove_track("r1", "t1").await.unwrap();
        assert_eq!(removed.len(), 1);

        let state = store.get_state("r1").await.unwrap();
        assert!(state.tracks.is_empty());
        assert!(state.regions.is_empty());
        assert!(state.selected_track_id.is_none());
        assert!(state.selected_region_ids.is_empty());
    }

    #[tokio::test]
    async fn lock_acquire_succeeds_for_same_user_and_blocks_others() {
        let store = RoomStateStore::new();
        store.init_state("r1").await;

        let alice_lock = LockInfo {
            user_id: "alice".into(),
            username: "alice".into(),
            lock_type: LockType::Region,
            timestamp: 0,
        };
        assert!(store.acquire_lock("r1", "reg1", alice_lock.clone()).await.unwrap());
        assert!(store.acquire_lock("r1", "reg1", alice_lock).await.unwrap());

        let bob_lock = LockInfo {
            user_id: "bob".into(),
            username: "bob".into(),
            lock_type: LockType::Region,
            timestamp: 0,
        };
        assert!(!store.acquire_lock("r1", "reg1", bob_lock).await.unwrap());
    }

    #[tokio::test]
    async fn release_user_locks_clears_every_lock_owned_by_that_user() {
        let store = RoomStateStore::new();
        store.init_state("r1").await;

        for element in ["reg1", "reg2", "t1"] {
            store
                .acquire_lock(
                    "r1",
                    element,
                    LockInfo {
                        user_id: "alice".into(),
                        username: "alice".into(),
                        lock_type: LockType::Region,
                        timestamp: 0,
                    },
                )
                .await
                .unwrap();
        }

        let released = store.release_user_locks("r1", "alice").await.unwrap();
        assert_eq!(released.len(), 3);

        for element in ["reg1", "reg2", "t1"] {
            assert!(store.is_locked("r1", element).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn different_rooms_do_not_interfere() {
        let store = RoomStateStore::new();
        store.init_state("r1").await;
        store.init_state("r2").await;

        store.set_bpm("r1", 140.0).await.unwrap();
        store.set_bpm("r2", 90.0).await.unwrap();

        assert_eq!(store.get_state("r1").await.unwrap().bpm, 140.0);
        assert_eq!(store.get_state("r2").await.unwrap().bpm, 90.0);
    }
}
