//! Domain types shared by the cache, scheduler and render backends.

pub mod snapshot;

pub use snapshot::{CacheEntry, EntryWrite, RenderArgs, Snapshot};
