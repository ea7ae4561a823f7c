//! Cache lifecycle notifications.

use time::OffsetDateTime;
use uuid::Uuid;

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    Created,
    Updated,
    Read,
    Deleted,
}

impl CacheEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Read => "read",
            Self::Deleted => "deleted",
        }
    }
}

/// Notification published on the cache's broadcast channel.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier so subscribers can de-duplicate.
    pub id: Uuid,
    pub kind: CacheEventKind,
    pub key: String,
    pub at: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: CacheEventKind, key: impl Into<String>, at: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            key: key.into(),
            at,
        }
    }
}
