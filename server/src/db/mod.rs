//! Persistent store consumed by the hub and the chat handlers.
//!
//! The hub only depends on the [`Store`] trait. Two backends exist: SQLite for
//! real deployments and an in-memory map for tests and throwaway runs.

pub mod memory;
pub mod migrations;
pub mod models;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StoreBackend;
use models::{Room, StoredMessage, User, UserLookup};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new user. Fails with `Conflict` if the username is taken.
    async fn insert_user(&self, user: User) -> StoreResult<User>;
    async fn get_user(&self, lookup: UserLookup) -> StoreResult<User>;

    async fn insert_message(&self, message: StoredMessage) -> StoreResult<StoredMessage>;
    /// Messages with `from <= timestamp <= to`, oldest first, at most `limit`.
    async fn messages_between(&self, from: i64, to: i64, limit: usize)
        -> StoreResult<Vec<StoredMessage>>;

    async fn insert_room(&self, room: Room) -> StoreResult<Room>;
    async fn get_room(&self, room_id: &str) -> StoreResult<Room>;

    /// Remove every user, message and room.
    async fn clear(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Shared handle to the configured store.
pub type SharedStore = Arc<dyn Store>;

/// Open the store selected by configuration.
pub fn open_store(
    backend: StoreBackend,
    data_dir: &str,
) -> Result<SharedStore, Box<dyn std::error::Error + Send + Sync>> {
    let store: SharedStore = match backend {
        StoreBackend::Sqlite => Arc::new(sqlite::SqliteStore::open(data_dir)?),
        StoreBackend::Memory => Arc::new(memory::MemoryStore::new()),
    };
    tracing::info!(backend = store.backend_name(), "Store opened");
    Ok(store)
}
