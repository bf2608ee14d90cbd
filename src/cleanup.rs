//! Cleanup scheduler (C11, spec.md §4.11).
//!
//! Grounded on the teacher's `init_room_activity_check_loop`
//! (`INACTIVE_ROOM_MINS`-driven interval sweep over the room map); widened
//! to a priority-ordered rule list over namespaces plus the session/
//! approval/rate-limit sweeps those namespaces' disposal implies.

use std::time::{Duration, Instant};

use crate::approval::ApprovalCoordinator;
use crate::namespace::{LOBBY_MONITOR_PATH, NamespaceManager, NamespaceStats};
use crate::rate_limit::RateLimiter;
use crate::room::{RoomRegistry, RoomStateStore};
use crate::session::SessionRegistry;

#[derive(Clone, Copy, Debug)]
pub struct CleanupConfig {
    pub regular_interval: Duration,
    pub aggressive_interval: Duration,
    pub inactive_threshold: Duration,
    pub empty_threshold: Duration,
    pub stale_approval_threshold: Duration,
    pub memory_pressure_threshold_mb: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            regular_interval: Duration::from_secs(300),
            aggressive_interval: Duration::from_secs(1800),
            inactive_threshold: Duration::from_secs(1800),
            empty_threshold: Duration::from_secs(300),
            stale_approval_threshold: Duration::from_secs(600),
            memory_pressure_threshold_mb: 600,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupMetrics {
    pub namespaces_checked: usize,
    pub namespaces_cleaned_up: usize,
    pub sessions_cleaned_up: usize,
    pub memory_freed_estimate: usize,
    pub duration: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DisposeReason {
    Empty,
    Inactive,
    StaleApproval,
    MemoryPressure,
}

pub struct CleanupScheduler {
    config: CleanupConfig,
}

impl CleanupScheduler {
    pub fn new(config: CleanupConfig) -> Self {
        Self { config }
    }

    fn classify(&self, path: &str, stats: &NamespaceStats, heap_mb: u64) -> Option<DisposeReason> {
        if path == LOBBY_MONITOR_PATH {
            return None;
        }

        if stats.connection_count == 0 && stats.idle > self.config.empty_threshold {
            return Some(DisposeReason::Empty);
        }
        if stats.idle > self.config.inactive_threshold {
            return Some(DisposeReason::Inactive);
        }
        if path.starts_with("/approval/") && stats.age > self.config.stale_approval_threshold {
            return Some(DisposeReason::StaleApproval);
        }
        if heap_mb > self.config.memory_pressure_threshold_mb && stats.connection_count < 2 {
            return Some(DisposeReason::MemoryPressure);
        }
        None
    }

    /// One regular-cadence pass. `heap_mb` is the caller's current resident
    /// heap estimate (spec.md's "process heap" observable).
    pub async fn run_regular(
        &self,
        namespaces: &NamespaceManager,
        sessions: &SessionRegistry,
        approvals: &ApprovalCoordinator,
        rate_limiter: &RateLimiter,
        rooms: &RoomRegistry,
        room_state: &RoomStateStore,
        heap_mb: u64,
    ) -> CleanupMetrics {
        let started = Instant::now();
        let mut metrics = CleanupMetrics::default();

        // Room-level empty grace (spec.md §3: "destroyed when empty beyond
        // a short grace"), distinct from namespace idle/empty reclamation
        // below — a room can stay registered (and re-joinable) after its
        // namespace has already gone idle.
        for room_id in rooms.sweep_empty(self.config.empty_threshold).await {
            room_state.clear_state(&room_id).await;
            namespaces.dispose(&format!("/room/{room_id}")).await;
            namespaces.dispose(&format!("/approval/{room_id}")).await;
            let dropped = approvals.cleanup_room(&room_id).await;
            metrics.sessions_cleaned_up += dropped.len();
        }

        for path in namespaces.all_paths().await {
            metrics.namespaces_checked += 1;
            let Some(stats) = namespaces.stats(&path).await else {
                continue;
            };

            if let Some(reason) = self.classify(&path, &stats, heap_mb) {
                namespaces.dispose(&path).await;
                metrics.namespaces_cleaned_up += 1;
                metrics.memory_freed_estimate += stats.connection_count * 4096;

                if reason == DisposeReason::StaleApproval
                    && let Some(room_id) = path.strip_prefix("/approval/")
                {
                    let dropped = approvals.cleanup_room(room_id).await;
                    metrics.sessions_cleaned_up += dropped.len();
                }
            }
        }

        // Grace-entry expiry (30 s TTL) runs on its own 60 s cadence from
        // `main::spawn_background_sweeps`, not this 5-minute pass — bundling
        // it here would let grace entries outlive the I10 bound.
        sessions.sweep_stale(Duration::from_secs(3600)).await;
        rate_limiter.sweep_expired().await;

        metrics.duration = started.elapsed();
        metrics
    }

    /// Aggressive pass: skips `/lobby-monitor`, disposes empty namespaces,
    /// and any namespace with `connectionCount < 3` idle past 15 min.
    pub async fn run_aggressive(&self, namespaces: &NamespaceManager, heap_mb: u64) -> CleanupMetrics {
        let started = Instant::now();
        let mut metrics = CleanupMetrics::default();
        let aggressive_idle_threshold = Duration::from_secs(900);

        for path in namespaces.all_paths().await {
            if path == LOBBY_MONITOR_PATH {
                continue;
            }
            metrics.namespaces_checked += 1;
            let Some(stats) = namespaces.stats(&path).await else {
                continue;
            };

            let should_dispose = stats.connection_count == 0
                || (stats.connection_count < 3 && stats.idle > aggressive_idle_threshold)
                || self.classify(&path, &stats, heap_mb).is_some();

            if should_dispose {
                namespaces.dispose(&path).await;
                metrics.namespaces_cleaned_up += 1;
                metrics.memory_freed_estimate += stats.connection_count * 4096;
            }
        }

        metrics.duration = started.elapsed();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_namespace_past_threshold_is_disposed() {
        let namespaces = NamespaceManager::new();
        namespaces.ensure("/room/r1").await;

        let mut config = CleanupConfig::default();
        config.empty_threshold = Duration::from_millis(0);
        let scheduler = CleanupScheduler::new(config);

        tokio::time::sleep(Duration::from_millis(5)).await;

        let sessions = SessionRegistry::new();
        let approvals = ApprovalCoordinator::new();
        let rate_limiter = RateLimiter::new(false, false);
        let rooms = RoomRegistry::new();
        let room_state = RoomStateStore::new();
        let metrics = scheduler
            .run_regular(&namespaces, &sessions, &approvals, &rate_limiter, &rooms, &room_state, 100)
            .await;

        assert_eq!(metrics.namespaces_cleaned_up, 1);
        assert!(namespaces.stats("/room/r1").await.is_none());
    }

    #[tokio::test]
    async fn lobby_monitor_is_never_swept() {
        let namespaces = NamespaceManager::new();
        namespaces.ensure(LOBBY_MONITOR_PATH).await;

        let mut config = CleanupConfig::default();
        config.empty_threshold = Duration::from_millis(0);
        let scheduler = CleanupScheduler::new(config);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let metrics = scheduler.run_aggressive(&namespaces, 100).await;
        assert_eq!(metrics.namespaces_cleaned_up, 0);
        assert!(namespaces.stats(LOBBY_MONITOR_PATH).await.is_some());
    }

    #[tokio::test]
    async fn stale_approval_namespace_also_drops_its_approval_sessions() {
        let namespaces = NamespaceManager::new();
        namespaces.ensure("/approval/r1").await;

        let mut config = CleanupConfig::default();
        config.stale_approval_threshold = Duration::from_millis(0);
        let scheduler = CleanupScheduler::new(config);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sessions = SessionRegistry::new();
        let approvals = ApprovalCoordinator::new();
        approvals
            .request(crate::approval::ApprovalSession {
                connection_id: "c1".into(),
                room_id: "r1".into(),
                requester_user_id: "alice".into(),
                requester_username: "alice".into(),
                requested_role: crate::room::model::UserRole::Audience,
                owner_user_id: "owner".into(),
                requested_at: Instant::now(),
            })
            .await;
        let rate_limiter = RateLimiter::new(false, false);
        let rooms = RoomRegistry::new();
        let room_state = RoomStateStore::new();

        let metrics = scheduler
            .run_regular(&namespaces, &sessions, &approvals, &rate_limiter, &rooms, &room_state, 100)
            .await;

        assert_eq!(metrics.sessions_cleaned_up, 1);
        assert!(approvals.get("c1").await.is_none());
    }

    #[tokio::test]
    async fn empty_room_is_reclaimed_only_after_its_own_grace_window() {
        use crate::room::model::{Metronome, Room, RoomType, RoomUser, UserRole};

        let namespaces = NamespaceManager::new();
        let rooms = RoomRegistry::new();
        let room_state = RoomStateStore::new();
        rooms
            .create(Room {
                id: "r1".into(),
                name: "jam".into(),
                owner_user_id: "alice".into(),
                is_private: false,
                is_hidden: false,
                created_at: 0,
                room_type: RoomType::Arrange,
                metronome: Metronome { bpm: 120.0, last_tick_ts: 0 },
                users: Vec::new(),
                pending_members: Vec::new(),
            })
            .await;
        rooms
            .add_user(
                "r1",
                RoomUser {
                    user_id: "alice".into(),
                    username: "alice".into(),
                    role: UserRole::RoomOwner,
                    current_instrument: None,
                    current_category: None,
                    is_ready: false,
                },
            )
            .await;
        room_state.init_state("r1").await;
        rooms.remove_user("r1", "alice").await;

        let mut config = CleanupConfig::default();
        config.empty_threshold = Duration::from_secs(300);
        let scheduler = CleanupScheduler::new(config);
        let sessions = SessionRegistry::new();
        let approvals = ApprovalCoordinator::new();
        let rate_limiter = RateLimiter::new(false, false);

        scheduler
            .run_regular(&namespaces, &sessions, &approvals, &rate_limiter, &rooms, &room_state, 100)
            .await;
        assert!(rooms.exists("r1").await, "room must outlive a single pass inside its grace window");
        assert!(room_state.get_state("r1").await.is_some());

        let mut config = CleanupConfig::default();
        config.empty_threshold = Duration::from_millis(0);
        let scheduler = CleanupScheduler::new(config);
        scheduler
            .run_regular(&namespaces, &sessions, &approvals, &rate_limiter, &rooms, &room_state, 100)
            .await;
        assert!(!rooms.exists("r1").await);
        assert!(room_state.get_state("r1").await.is_none());
    }
}
