//! Snapshot cache.
//!
//! A [`SnapshotCache`] wraps a [`SnapshotStore`] variant and owns everything
//! time related: entry timestamps, the TTL policy and the hook that fires when
//! a stale entry is read.
//!
//! ```toml
//! [cache]
//! ttl_seconds = 3600
//! backend = "file"        # or "memory"
//! directory = "snapshots"
//! ```

mod clock;
mod config;
mod events;
mod file;
mod memory;
mod snapshot;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use events::{CacheEvent, CacheEventKind};
pub use file::FileStore;
pub use memory::MemoryStore;
pub(crate) use snapshot::{METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_STALE};
pub use snapshot::{CacheError, Freshness, SnapshotCache, StaleHook};
pub use store::{SnapshotStore, StoreError};
