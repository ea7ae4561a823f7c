//! Cache configuration.

use serde::Deserialize;

const DEFAULT_TTL_SECONDS: u64 = 3600;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Snapshot cache tuning, resolved from the `[cache]` settings section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which an entry is served as stale and refreshed in the background.
    pub ttl_seconds: u64,
    /// Buffer size of the lifecycle event channel; slow subscribers lag past it.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl_seconds: settings.ttl.as_secs(),
            ..Self::default()
        }
    }
}

impl CacheConfig {
    pub fn with_ttl_seconds(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds,
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX))
    }

    /// Channel capacity, clamped to 1 because broadcast channels reject zero.
    pub fn event_capacity_non_zero(&self) -> usize {
        self.event_capacity.max(1)
    }
}
