//! Snapshot cache: persistence plus timestamps, TTL and the stale-read hook.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};

use metrics::counter;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, instrument};

use super::{
    clock::{Clock, SystemClock},
    config::CacheConfig,
    events::{CacheEvent, CacheEventKind},
    store::{SnapshotStore, StoreError},
};
use crate::{
    domain::{CacheEntry, EntryWrite},
    util::lock::{rw_read, rw_write},
};

const SOURCE: &str = "cache::snapshot";

pub(crate) const METRIC_CACHE_HIT: &str = "crawlsnap_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "crawlsnap_cache_miss_total";
pub(crate) const METRIC_CACHE_STALE: &str = "crawlsnap_cache_stale_total";

/// Callback invoked with every entry that is read while stale or errored.
pub type StaleHook = Arc<dyn Fn(CacheEntry) + Send + Sync>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache used before start")]
    NotStarted,
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// How an entry relates to the TTL policy at the moment it is inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Older than the TTL.
    Expired,
    /// The last regeneration failed; treated as stale regardless of age.
    Errored,
}

impl Freshness {
    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Expired => "expired",
            Self::Errored => "errored",
        }
    }
}

#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    store: Arc<dyn SnapshotStore>,
    ttl: time::Duration,
    clock: Arc<dyn Clock>,
    stale_hook: RwLock<Option<StaleHook>>,
    events: broadcast::Sender<CacheEvent>,
    started: AtomicBool,
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("ttl", &self.inner.ttl)
            .field("started", &self.inner.started.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn SnapshotStore>, config: &CacheConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SnapshotStore>,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity_non_zero());
        Self {
            inner: Arc::new(CacheInner {
                store,
                ttl: config.ttl(),
                clock,
                stale_hook: RwLock::new(None),
                events,
                started: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn ttl(&self) -> time::Duration {
        self.inner.ttl
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Open the underlying store. Repeated calls are no-ops.
    pub async fn start(&self) -> Result<(), CacheError> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }
        self.inner.store.start().await?;
        self.inner.started.store(true, Ordering::Release);
        info!(target = SOURCE, op = "start", result = "ok", "Snapshot cache started");
        Ok(())
    }

    /// Release the underlying store. Safe to call any number of times.
    pub async fn stop(&self) -> Result<(), CacheError> {
        let _guard = self.inner.lifecycle.lock().await;
        if !self.is_started() {
            return Ok(());
        }
        self.inner.started.store(false, Ordering::Release);
        self.inner.store.stop().await?;
        info!(target = SOURCE, op = "stop", result = "ok", "Snapshot cache stopped");
        Ok(())
    }

    pub fn set_stale_hook(&self, hook: impl Fn(CacheEntry) + Send + Sync + 'static) {
        *rw_write(&self.inner.stale_hook, SOURCE, "set_stale_hook") = Some(Arc::new(hook));
    }

    pub fn clear_stale_hook(&self) {
        rw_write(&self.inner.stale_hook, SOURCE, "clear_stale_hook").take();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn freshness(&self, entry: &CacheEntry) -> Freshness {
        if entry.is_errored() {
            return Freshness::Errored;
        }
        if self.inner.clock.now() - entry.last_updated_at > self.inner.ttl {
            Freshness::Expired
        } else {
            Freshness::Fresh
        }
    }

    /// Fetch an entry. A missing key is `Ok(None)`.
    ///
    /// Stale and errored entries are still returned; the stale hook is invoked
    /// with a copy before returning and is never awaited.
    #[instrument(skip(self), fields(freshness = tracing::field::Empty))]
    pub async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.read_entry(key, true).await
    }

    /// Like [`SnapshotCache::read`], but never fires the stale hook. For
    /// callers that schedule regeneration themselves or only inspect the entry.
    #[instrument(skip(self), fields(freshness = tracing::field::Empty))]
    pub async fn read_for_dispatch(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.read_entry(key, false).await
    }

    async fn read_entry(
        &self,
        key: &str,
        notify_stale: bool,
    ) -> Result<Option<CacheEntry>, CacheError> {
        self.ensure_started()?;

        let Some(entry) = self.inner.store.read(key).await? else {
            counter!(METRIC_CACHE_MISS).increment(1);
            debug!(target = SOURCE, key, outcome = "miss", "Snapshot cache miss");
            return Ok(None);
        };

        self.publish(CacheEventKind::Read, key);
        let freshness = self.freshness(&entry);
        tracing::Span::current().record("freshness", freshness.as_str());

        if freshness.is_fresh() {
            counter!(METRIC_CACHE_HIT).increment(1);
        } else {
            counter!(METRIC_CACHE_STALE, "reason" => freshness.as_str()).increment(1);
            if notify_stale {
                let hook = rw_read(&self.inner.stale_hook, SOURCE, "read").clone();
                if let Some(hook) = hook {
                    hook(entry.clone());
                }
            }
        }

        Ok(Some(entry))
    }

    /// Create or update an entry, stamping timestamps on the way in.
    ///
    /// Updates keep `created_at` and, when the write carries no payload, the
    /// stored payload as well.
    #[instrument(skip(self, write), fields(key = %write.key))]
    pub async fn save(&self, write: EntryWrite) -> Result<CacheEntry, CacheError> {
        self.ensure_started()?;
        let now = self.inner.clock.now();

        match self.inner.store.read(&write.key).await? {
            Some(existing) => {
                let entry = CacheEntry {
                    key: existing.key,
                    route: write.route,
                    pathname: write.pathname.or(existing.pathname),
                    payload: write.payload.or(existing.payload),
                    created_at: existing.created_at,
                    last_updated_at: now.max(existing.created_at),
                    last_error: write.last_error,
                };
                self.inner.store.update(&entry).await?;
                self.publish(CacheEventKind::Updated, &entry.key);
                Ok(entry)
            }
            None => {
                let entry = CacheEntry {
                    key: write.key,
                    route: write.route,
                    pathname: write.pathname,
                    payload: write.payload,
                    created_at: now,
                    last_updated_at: now,
                    last_error: write.last_error,
                };
                self.inner.store.create(&entry).await?;
                self.publish(CacheEventKind::Created, &entry.key);
                Ok(entry)
            }
        }
    }

    /// Administrative removal. Returns whether an entry existed.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_started()?;
        let existed = self.inner.store.delete(key).await?;
        if existed {
            self.publish(CacheEventKind::Deleted, key);
        }
        Ok(existed)
    }

    pub async fn find_by_route(&self, route: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.ensure_started()?;
        Ok(self.inner.store.find_by_route(route).await?)
    }

    fn ensure_started(&self) -> Result<(), CacheError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(CacheError::NotStarted)
        }
    }

    fn publish(&self, kind: CacheEventKind, key: &str) {
        // No subscribers is the common case.
        let _ = self
            .inner
            .events
            .send(CacheEvent::new(kind, key, self.inner.clock.now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{clock::ManualClock, memory::MemoryStore},
        domain::Snapshot,
    };
    use std::sync::Mutex as StdMutex;
    use time::{Duration, macros::datetime};

    const TTL: i64 = 60;

    fn write(key: &str, html: Option<&str>, error: Option<&str>) -> EntryWrite {
        EntryWrite {
            key: key.to_string(),
            route: "/page".to_string(),
            pathname: Some("/page".to_string()),
            payload: html.map(Snapshot::new),
            last_error: error.map(str::to_string),
        }
    }

    async fn started_cache() -> (SnapshotCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        let cache = SnapshotCache::with_clock(
            Arc::new(MemoryStore::new()),
            &CacheConfig::with_ttl_seconds(TTL as u64),
            clock.clone(),
        );
        cache.start().await.expect("start");
        (cache, clock)
    }

    fn recording_hook(cache: &SnapshotCache) -> Arc<StdMutex<Vec<String>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache.set_stale_hook(move |entry| sink.lock().expect("hook lock").push(entry.key));
        seen
    }

    #[tokio::test]
    async fn operations_require_start() {
        let cache = SnapshotCache::new(Arc::new(MemoryStore::new()), &CacheConfig::default());
        assert!(matches!(cache.read("k").await, Err(CacheError::NotStarted)));

        cache.start().await.expect("start");
        cache.start().await.expect("start is idempotent");
        assert!(cache.read("k").await.expect("read").is_none());

        cache.stop().await.expect("stop");
        cache.stop().await.expect("stop is idempotent");
        assert!(matches!(
            cache.save(write("k", None, None)).await,
            Err(CacheError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn save_stamps_and_preserves_created_at() {
        let (cache, clock) = started_cache().await;
        let created = cache
            .save(write("k", Some("<p>v1</p>"), None))
            .await
            .expect("create");
        assert_eq!(created.created_at, created.last_updated_at);

        clock.advance(Duration::seconds(30));
        let updated = cache
            .save(write("k", Some("<p>v2</p>"), None))
            .await
            .expect("update");
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(
            updated.last_updated_at,
            created.last_updated_at + Duration::seconds(30)
        );
        assert!(updated.last_updated_at >= updated.created_at);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_payload() {
        let (cache, _clock) = started_cache().await;
        cache
            .save(write("k", Some("<p>good</p>"), None))
            .await
            .expect("create");

        let errored = cache
            .save(write("k", None, Some("navigation timeout")))
            .await
            .expect("update");
        assert_eq!(errored.payload, Some(Snapshot::new("<p>good</p>")));
        assert_eq!(errored.last_error.as_deref(), Some("navigation timeout"));

        let recovered = cache
            .save(write("k", Some("<p>fixed</p>"), None))
            .await
            .expect("update");
        assert!(recovered.last_error.is_none());
    }

    #[tokio::test]
    async fn ttl_boundary_decides_staleness() {
        let (cache, clock) = started_cache().await;
        let seen = recording_hook(&cache);
        cache
            .save(write("k", Some("<p></p>"), None))
            .await
            .expect("create");

        clock.advance(Duration::seconds(TTL - 1));
        cache.read("k").await.expect("read");
        assert!(seen.lock().expect("lock").is_empty());

        clock.advance(Duration::seconds(1));
        cache.read("k").await.expect("read at exactly ttl");
        assert!(seen.lock().expect("lock").is_empty());

        clock.advance(Duration::seconds(1));
        let entry = cache.read("k").await.expect("read").expect("entry");
        assert_eq!(cache.freshness(&entry), Freshness::Expired);
        assert_eq!(*seen.lock().expect("lock"), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn errored_entry_is_stale_regardless_of_age() {
        let (cache, _clock) = started_cache().await;
        let seen = recording_hook(&cache);
        cache
            .save(write("k", Some("<p></p>"), Some("boom")))
            .await
            .expect("create");

        let entry = cache.read("k").await.expect("read").expect("entry");
        assert_eq!(cache.freshness(&entry), Freshness::Errored);
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_events_are_broadcast() {
        let (cache, _clock) = started_cache().await;
        let mut events = cache.subscribe();

        cache
            .save(write("k", Some("<p></p>"), None))
            .await
            .expect("create");
        cache
            .save(write("k", Some("<p></p>"), None))
            .await
            .expect("update");
        cache.read("k").await.expect("read");
        assert!(cache.delete("k").await.expect("delete"));

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.key, "k");
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                CacheEventKind::Created,
                CacheEventKind::Updated,
                CacheEventKind::Read,
                CacheEventKind::Deleted,
            ]
        );
    }

    #[tokio::test]
    async fn cleared_hook_is_not_called() {
        let (cache, clock) = started_cache().await;
        let seen = recording_hook(&cache);
        cache.clear_stale_hook();
        cache
            .save(write("k", Some("<p></p>"), None))
            .await
            .expect("create");

        clock.advance(Duration::seconds(TTL * 2));
        cache.read("k").await.expect("read");
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn dispatch_read_leaves_the_hook_alone() {
        let (cache, clock) = started_cache().await;
        let seen = recording_hook(&cache);
        cache
            .save(write("k", Some("<p></p>"), None))
            .await
            .expect("create");

        clock.advance(Duration::seconds(TTL * 2));
        let entry = cache
            .read_for_dispatch("k")
            .await
            .expect("read")
            .expect("entry");
        assert_eq!(cache.freshness(&entry), Freshness::Expired);
        assert!(seen.lock().expect("lock").is_empty());

        cache.read("k").await.expect("read");
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }
}
