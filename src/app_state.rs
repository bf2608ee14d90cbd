//! Application root: the explicitly-constructed component graph the
//! dispatcher and HTTP routes share.
//!
//! Nothing here is a module-level singleton — every component is built
//! once in [`AppState::new`] and handed out as shared references.

use std::sync::Arc;

use crate::admission::{AdmissionController, AdmissionLimits, BatchedEmitter};
use crate::approval::ApprovalCoordinator;
use crate::cleanup::{CleanupConfig, CleanupScheduler};
use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::error::FloodSuppressor;
use crate::namespace::NamespaceManager;
use crate::rate_limit::RateLimiter;
use crate::room::{RoomRegistry, RoomStateStore};
use crate::session::SessionRegistry;
use crate::storage::StorageAdapter;

pub struct AppState {
    pub config: Config,
    pub rooms: RoomRegistry,
    pub room_state: RoomStateStore,
    pub sessions: SessionRegistry,
    pub namespaces: NamespaceManager,
    pub connections: ConnectionRegistry,
    pub approvals: ApprovalCoordinator,
    pub rate_limiter: RateLimiter,
    pub admission: AdmissionController,
    pub batched_emitter: BatchedEmitter,
    pub cleanup: CleanupScheduler,
    pub flood_suppressor: FloodSuppressor,
    pub storage: Box<dyn StorageAdapter>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_storage(config, Box::new(crate::storage::InMemoryStorage::new()))
    }

    pub fn with_storage(config: Config, storage: Box<dyn StorageAdapter>) -> Arc<Self> {
        let admission_limits = AdmissionLimits {
            max_connections_per_room: config.admission.max_connections_per_room,
            max_connections_global: config.admission.max_connections_global,
            queue_size: config.admission.queue_size,
            connection_timeout: config.admission.connection_timeout,
            batch_size: config.admission.batch_size,
            batch_delay: config.admission.batch_delay,
        };

        let cleanup_config = CleanupConfig {
            regular_interval: config.cleanup.cleanup_interval,
            aggressive_interval: config.cleanup.aggressive_cleanup_interval,
            inactive_threshold: config.cleanup.inactive_threshold,
            empty_threshold: config.cleanup.empty_threshold,
            stale_approval_threshold: std::time::Duration::from_secs(600),
            memory_pressure_threshold_mb: config.cleanup.memory_pressure_threshold_mb,
        };

        let rate_limiter = RateLimiter::new(
            config.rate_limit.disable_synth_rate_limit,
            config.rate_limit.disable_voice_rate_limit,
        );

        let batched_emitter =
            BatchedEmitter::new(config.admission.batch_size, config.admission.batch_delay);

        Arc::new(Self {
            rooms: RoomRegistry::new(),
            room_state: RoomStateStore::new(),
            sessions: SessionRegistry::new(),
            namespaces: NamespaceManager::new(),
            connections: ConnectionRegistry::new(),
            approvals: ApprovalCoordinator::new(),
            rate_limiter,
            admission: AdmissionController::new(admission_limits),
            batched_emitter,
            cleanup: CleanupScheduler::new(cleanup_config),
            flood_suppressor: FloodSuppressor::default(),
            storage,
            config,
        })
    }
}

pub fn room_path(room_id: &str) -> String {
    format!("/room/{room_id}")
}

pub fn approval_path(room_id: &str) -> String {
    format!("/approval/{room_id}")
}
