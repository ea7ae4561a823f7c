//! In-process store backed by concurrent maps.

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use super::store::{SnapshotStore, StoreError};
use crate::domain::CacheEntry;

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, CacheEntry>,
    by_route: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn start(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        match self.entries.entry(entry.key.clone()) {
            Entry::Occupied(_) => Err(StoreError::conflict(&entry.key)),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                self.by_route.insert(entry.route.clone(), entry.key.clone());
                Ok(())
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn update(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        match self.entries.get_mut(&entry.key) {
            Some(mut existing) => {
                *existing = entry.clone();
                drop(existing);
                self.by_route.insert(entry.route.clone(), entry.key.clone());
                Ok(())
            }
            None => Err(StoreError::not_found(&entry.key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.by_route
                    .remove_if(&entry.route, |_, indexed| indexed == key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_route(&self, route: &str) -> Result<Option<CacheEntry>, StoreError> {
        let Some(key) = self.by_route.get(route).map(|key| key.value().clone()) else {
            return Ok(None);
        };
        self.read(&key).await
    }
}
