//! Directory-backed store: one JSON document per entry.
//!
//! File names are the SHA-256 of the entry key so arbitrary keys stay
//! filesystem-safe. Writes go through a temp file in the same directory and
//! are persisted atomically. The route index lives in memory and is rebuilt by
//! scanning the directory on `start`.

use std::{
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use super::store::{SnapshotStore, StoreError};
use crate::domain::CacheEntry;

const SOURCE: &str = "cache::file";
const EXTENSION: &str = "json";

#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    by_route: DashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Create,
    Replace,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            by_route: DashMap::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.{EXTENSION}", hash_key(key)))
    }

    async fn write(&self, entry: &CacheEntry, mode: WriteMode) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(entry)?;
        let directory = self.directory.clone();
        let target = self.path_for(&entry.key);
        let key = entry.key.clone();

        tokio::task::spawn_blocking(move || persist(&directory, &target, &encoded, mode, &key))
            .await
            .map_err(|err| StoreError::Io(std::io::Error::other(err)))??;

        self.by_route.insert(entry.route.clone(), entry.key.clone());
        Ok(())
    }
}

fn persist(
    directory: &Path,
    target: &Path,
    encoded: &[u8],
    mode: WriteMode,
    key: &str,
) -> Result<(), StoreError> {
    if matches!(mode, WriteMode::Replace) && !target.exists() {
        return Err(StoreError::not_found(key));
    }

    let mut file = NamedTempFile::new_in(directory)?;
    file.write_all(encoded)?;
    file.flush()?;

    let result = match mode {
        WriteMode::Create => file.persist_noclobber(target),
        WriteMode::Replace => file.persist(target),
    };
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Err(StoreError::conflict(key)),
        Err(err) => Err(StoreError::Io(err.error)),
    }
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn start(&self) -> Result<(), StoreError> {
        let started_at = Instant::now();
        tokio::fs::create_dir_all(&self.directory).await?;

        self.by_route.clear();
        let mut indexed = 0_usize;
        let mut dir = tokio::fs::read_dir(&self.directory).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => {
                    self.by_route.insert(entry.route, entry.key);
                    indexed += 1;
                }
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        op = "file_store::start",
                        result = "skipped",
                        path = %path.display(),
                        error = %err,
                        "Ignoring unreadable snapshot document"
                    );
                }
            }
        }

        info!(
            target = SOURCE,
            op = "file_store::start",
            result = "ok",
            directory = %self.directory.display(),
            indexed,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Snapshot directory indexed"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), StoreError> {
        self.by_route.clear();
        Ok(())
    }

    async fn create(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.write(entry, WriteMode::Create).await
    }

    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.write(entry, WriteMode::Replace).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {
                self.by_route.retain(|_, indexed| indexed.as_str() != key);
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_by_route(&self, route: &str) -> Result<Option<CacheEntry>, StoreError> {
        let Some(key) = self.by_route.get(route).map(|key| key.value().clone()) else {
            return Ok(None);
        };
        self.read(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Snapshot;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn entry(key: &str, route: &str, html: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            route: route.to_string(),
            pathname: Some("/".to_string()),
            payload: Some(Snapshot::new(html)),
            created_at: datetime!(2024-01-01 00:00 UTC),
            last_updated_at: datetime!(2024-01-01 00:00 UTC),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn entries_survive_a_restart() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path());
        store.start().await.expect("start");
        store
            .create(&entry("route-key", "/docs/*", "<p>v1</p>"))
            .await
            .expect("create");
        store
            .update(&entry("route-key", "/docs/*", "<p>v2</p>"))
            .await
            .expect("update");
        store.stop().await.expect("stop");

        let reopened = FileStore::new(dir.path());
        reopened.start().await.expect("restart");
        let found = reopened
            .find_by_route("/docs/*")
            .await
            .expect("lookup")
            .expect("indexed entry");
        assert_eq!(found.key, "route-key");
        assert_eq!(found.payload.map(|p| p.html), Some("<p>v2</p>".to_string()));
    }

    #[tokio::test]
    async fn create_and_update_enforce_existence() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().join("nested"));
        store.start().await.expect("start");

        let err = store
            .update(&entry("k", "/a", "<p></p>"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        store
            .create(&entry("k", "/a", "<p></p>"))
            .await
            .expect("create");
        let err = store
            .create(&entry("k", "/a", "<p></p>"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn missing_and_deleted_entries_read_as_none() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path());
        store.start().await.expect("start");
        assert!(store.read("nope").await.expect("read").is_none());

        store
            .create(&entry("k", "/a", "<p></p>"))
            .await
            .expect("create");
        assert!(store.delete("k").await.expect("delete"));
        assert!(store.read("k").await.expect("read").is_none());
        assert!(store.find_by_route("/a").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn start_skips_corrupt_documents() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("garbage.json"), b"{not json").expect("write");

        let store = FileStore::new(dir.path());
        store.start().await.expect("start tolerates garbage");
        assert!(store.find_by_route("/a").await.expect("lookup").is_none());
    }
}
