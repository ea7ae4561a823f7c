//! Persistence contract underneath the snapshot cache.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::CacheEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry `{key}` not found")]
    NotFound { key: String },
    #[error("entry `{key}` already exists")]
    Conflict { key: String },
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode entry: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }
}

/// Key-value store keyed by `CacheEntry::key`, with a secondary lookup by route.
///
/// Implementations take entries exactly as given; timestamps are the cache's job.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Open backing resources. Called once by the cache before any other operation.
    async fn start(&self) -> Result<(), StoreError>;

    async fn stop(&self) -> Result<(), StoreError>;

    /// Insert a new entry; fails with `Conflict` when the key is taken.
    async fn create(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Replace an existing entry; fails with `NotFound` when the key is absent.
    async fn update(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Remove an entry, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Secondary-index lookup used to recover a route's key across restarts.
    async fn find_by_route(&self, route: &str) -> Result<Option<CacheEntry>, StoreError>;
}
