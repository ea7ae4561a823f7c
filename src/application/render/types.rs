use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{RenderArgs, Snapshot};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer unavailable: {0}")]
    Unavailable(String),
    #[error("renderer io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("renderer exited with {exit_code:?}: {stderr}")]
    Exit {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("renderer produced unusable output: {0}")]
    InvalidOutput(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
}

/// Loads a URL in an isolated browser-like context and returns its markup.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn render(&self, args: &RenderArgs) -> Result<Snapshot, RenderError>;

    /// Cheap check that the backend can be invoked at all.
    async fn probe(&self) -> Result<(), RenderError> {
        Ok(())
    }
}

/// What a caller gets back for a pathname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub key: String,
    pub html: String,
    pub requests: Vec<String>,
    /// Served past its TTL or after a failed regeneration.
    pub stale: bool,
}

impl RenderedPage {
    pub fn from_snapshot(key: impl Into<String>, snapshot: Snapshot, stale: bool) -> Self {
        Self {
            key: key.into(),
            html: snapshot.html,
            requests: snapshot.requests,
            stale,
        }
    }
}

#[derive(Debug, Error)]
#[error("post-processing failed: {0}")]
pub struct PostProcessError(pub String);

/// Final pass over a page before it is returned, e.g. resolving data-fetch
/// placeholders against the request's query context.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(
        &self,
        page: RenderedPage,
        query: &BTreeMap<String, String>,
    ) -> Result<RenderedPage, PostProcessError>;
}

/// Returns pages untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait]
impl PostProcessor for PassThrough {
    async fn process(
        &self,
        page: RenderedPage,
        _query: &BTreeMap<String, String>,
    ) -> Result<RenderedPage, PostProcessError> {
        Ok(page)
    }
}
