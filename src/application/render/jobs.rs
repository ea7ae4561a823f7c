//! The `render` pool job: decode arguments, call the backend, encode the snapshot.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use metrics::histogram;
use serde_json::Value;
use tracing::{info, warn};

use super::types::RenderBackend;
use crate::{
    domain::RenderArgs,
    infra::pool::{JobError, JobHandler},
};

pub const RENDER_JOB: &str = "render";

pub(crate) const METRIC_RENDER_MS: &str = "crawlsnap_render_ms";

pub struct RenderJob {
    backend: Arc<dyn RenderBackend>,
}

impl RenderJob {
    pub fn new(backend: Arc<dyn RenderBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl JobHandler for RenderJob {
    async fn run(&self, args: Value) -> Result<Value, JobError> {
        let args: RenderArgs =
            serde_json::from_value(args).map_err(|err| JobError::invalid_args(err.to_string()))?;
        let started_at = Instant::now();

        match self.backend.render(&args).await {
            Ok(snapshot) => {
                let elapsed_ms = started_at.elapsed().as_millis() as u64;
                histogram!(METRIC_RENDER_MS, "result" => "ok").record(elapsed_ms as f64);
                info!(
                    target = "application::render::jobs",
                    op = "render",
                    result = "ok",
                    url = %args.url,
                    elapsed_ms,
                    html_bytes = snapshot.html.len(),
                    requests = snapshot.requests.len(),
                    "Page rendered"
                );
                serde_json::to_value(snapshot).map_err(|err| JobError::failed(err.to_string()))
            }
            Err(err) => {
                let elapsed_ms = started_at.elapsed().as_millis() as u64;
                histogram!(METRIC_RENDER_MS, "result" => "error").record(elapsed_ms as f64);
                warn!(
                    target = "application::render::jobs",
                    op = "render",
                    result = "error",
                    url = %args.url,
                    elapsed_ms,
                    error = %err,
                    "Page render failed"
                );
                Err(JobError::failed(err.to_string()))
            }
        }
    }

    async fn ready(&self) -> Result<(), JobError> {
        self.backend
            .probe()
            .await
            .map_err(|err| JobError::failed(err.to_string()))
    }
}
