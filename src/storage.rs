//! Persistence and blob-storage boundaries.
//!
//! These are narrow trait definitions the core composes against; no real
//! database or object store backs them here. Grounded on the teacher's
//! `#[async_trait] trait Commands` shape (`sharify/websocket_cmds.rs`),
//! generalized to the repository/adapter interfaces this domain needs
//! instead of a Spotify command set.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::room::model::Room;

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn save(&self, room: &Room) -> Result<(), String>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Room>, String>;
    async fn find_by_owner(&self, owner_user_id: &str) -> Result<Vec<Room>, String>;
    async fn find_public(&self) -> Result<Vec<Room>, String>;
    async fn find_by_name_pattern(&self, pattern: &str) -> Result<Vec<Room>, String>;
    async fn find_paginated(&self, offset: usize, limit: usize) -> Result<Vec<Room>, String>;
    async fn delete(&self, id: &str) -> Result<(), String>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn save(&self, user: &UserRecord) -> Result<(), String>;
    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>, String>;
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, String>;
    async fn find_all(&self) -> Result<Vec<UserRecord>, String>;
    async fn delete(&self, id: &str) -> Result<(), String>;
}

/// Verifies an opaque bearer token and resolves it to a user id. Kept as a
/// trait boundary rather than a concrete JWT/session implementation, since
/// auth is an external collaborator.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, String>;
}

/// Blob storage for region audio. `region_key` is whatever
/// [`crate::room::model::Region::audio_reference_key`] resolved to.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn save_file(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), String>;
    async fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
    async fn delete_file(&self, key: &str) -> Result<(), String>;
    async fn file_exists(&self, key: &str) -> Result<bool, String>;
    async fn get_file_url(&self, key: &str) -> Result<Option<String>, String>;
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>, String>;

    /// Convenience wrapper the dispatcher calls once it has decided a
    /// region's audio blob has no surviving reference anywhere in the
    /// room. Default impl defers to [`Self::delete_file`].
    async fn delete_region_audio(&self, room_id: &str, region_key: &str) -> Result<(), String> {
        self.delete_file(&format!("{room_id}/{region_key}")).await
    }
}

/// In-process `StorageAdapter` used by tests and by default when no real
/// object store is configured. Not a substitute for a production backend.
#[derive(Default)]
pub struct InMemoryStorage {
    files: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn save_file(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), String> {
        self.files.write().await.insert(key.to_owned(), (bytes, content_type.to_owned()));
        Ok(())
    }

    async fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.files.read().await.get(key).map(|(bytes, _)| bytes.clone()))
    }

    async fn delete_file(&self, key: &str) -> Result<(), String> {
        self.files.write().await.remove(key);
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> Result<bool, String> {
        Ok(self.files.read().await.contains_key(key))
    }

    async fn get_file_url(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.files.read().await.contains_key(key).then(|| format!("/api/files/{key}")))
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>, String> {
        Ok(self
            .files
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_saved_file() {
        let storage = InMemoryStorage::new();
        storage.save_file("room1/blob-a", vec![1, 2, 3], "audio/ogg").await.unwrap();

        assert!(storage.file_exists("room1/blob-a").await.unwrap());
        assert_eq!(storage.get_file("room1/blob-a").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn delete_region_audio_removes_the_namespaced_key() {
        let storage = InMemoryStorage::new();
        storage.save_file("room1/blob-a", vec![9], "audio/ogg").await.unwrap();

        storage.delete_region_audio("room1", "blob-a").await.unwrap();

        assert!(!storage.file_exists("room1/blob-a").await.unwrap());
    }

    #[tokio::test]
    async fn list_files_filters_by_prefix() {
        let storage = InMemoryStorage::new();
        storage.save_file("room1/a", vec![1], "audio/ogg").await.unwrap();
        storage.save_file("room2/b", vec![2], "audio/ogg").await.unwrap();

        let listed = storage.list_files("room1/").await.unwrap();
        assert_eq!(listed, vec!["room1/a".to_string()]);
    }
}
