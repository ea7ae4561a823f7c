//! Snapshot records and render parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Rendered markup plus the sub-requests the page issued while rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub html: String,
    #[serde(default)]
    pub requests: Vec<String>,
}

impl Snapshot {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            requests: Vec::new(),
        }
    }
}

/// Parameters handed to the render backend for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderArgs {
    /// Absolute URL the backend loads.
    pub url: String,
    /// Pathname the request arrived with.
    pub pathname: String,
    /// Source text of the route pattern the pathname matched.
    pub route: String,
    /// Query context of the request that triggered the render.
    #[serde(default)]
    pub variant: BTreeMap<String, String>,
}

/// One persisted record per route key.
///
/// Timestamps are owned by the cache layer: callers describe a write through
/// [`EntryWrite`] and never set `created_at` or `last_updated_at` themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub route: String,
    #[serde(default)]
    pub pathname: Option<String>,
    #[serde(default)]
    pub payload: Option<Snapshot>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_at: OffsetDateTime,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CacheEntry {
    pub fn is_errored(&self) -> bool {
        self.last_error.is_some()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

/// Caller-side description of a cache write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWrite {
    pub key: String,
    pub route: String,
    pub pathname: Option<String>,
    /// `None` keeps whatever payload is already stored.
    pub payload: Option<Snapshot>,
    pub last_error: Option<String>,
}

impl EntryWrite {
    /// A successful render: stores the payload and clears any recorded error.
    pub fn rendered(args: &RenderArgs, key: impl Into<String>, snapshot: Snapshot) -> Self {
        Self {
            key: key.into(),
            route: args.route.clone(),
            pathname: Some(args.pathname.clone()),
            payload: Some(snapshot),
            last_error: None,
        }
    }

    /// A failed render: records the error and leaves the stored payload alone.
    pub fn failed(args: &RenderArgs, key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            route: args.route.clone(),
            pathname: Some(args.pathname.clone()),
            payload: None,
            last_error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn args() -> RenderArgs {
        RenderArgs {
            url: "http://localhost:3001/blog/first".to_string(),
            pathname: "/blog/first".to_string(),
            route: "/blog/*".to_string(),
            variant: BTreeMap::new(),
        }
    }

    #[test]
    fn failed_write_keeps_payload_untouched() {
        let write = EntryWrite::failed(&args(), "k1", "navigation timeout");
        assert_eq!(write.payload, None);
        assert_eq!(write.last_error.as_deref(), Some("navigation timeout"));
        assert_eq!(write.pathname.as_deref(), Some("/blog/first"));
    }

    #[test]
    fn entry_serializes_timestamps_as_rfc3339() {
        let entry = CacheEntry {
            key: "k1".to_string(),
            route: "/blog/*".to_string(),
            pathname: Some("/blog/first".to_string()),
            payload: Some(Snapshot::new("<p>hi</p>")),
            created_at: datetime!(2024-03-01 12:00 UTC),
            last_updated_at: datetime!(2024-03-01 12:30 UTC),
            last_error: None,
        };

        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["created_at"], "2024-03-01T12:00:00Z");

        let decoded: CacheEntry = serde_json::from_value(json).expect("deserialize");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn snapshot_requests_default_to_empty() {
        let snapshot: Snapshot =
            serde_json::from_str(r#"{"html":"<html></html>"}"#).expect("deserialize");
        assert!(snapshot.requests.is_empty());
    }
}
