//! Runs admitted scheduler tasks on the worker pool and records their outcome.

use async_trait::async_trait;
use tracing::warn;

use crate::{
    application::{
        render::RENDER_JOB,
        scheduler::{TaskError, TaskExecutor, TaskResult},
    },
    cache::SnapshotCache,
    domain::{EntryWrite, RenderArgs, Snapshot},
    infra::pool::{PoolError, WorkerPool},
};

const SOURCE: &str = "application::processor::executor";

pub(crate) struct RenderExecutor {
    pool: WorkerPool,
    cache: SnapshotCache,
}

impl RenderExecutor {
    pub(crate) fn new(pool: WorkerPool, cache: SnapshotCache) -> Self {
        Self { pool, cache }
    }

    async fn record_failure(&self, key: &str, args: &RenderArgs, message: &str) {
        if let Err(err) = self
            .cache
            .save(EntryWrite::failed(args, key, message))
            .await
        {
            warn!(
                target = SOURCE,
                op = "record_failure",
                key,
                error = %err,
                "Failed to record render error on cache entry"
            );
        }
    }
}

#[async_trait]
impl TaskExecutor for RenderExecutor {
    async fn execute(&self, key: &str, args: &RenderArgs) -> TaskResult {
        let value = serde_json::to_value(args)
            .map_err(|err| TaskError::Internal(format!("encode render args: {err}")))?;

        match self.pool.submit(RENDER_JOB, value).await {
            Ok(output) => {
                let snapshot: Snapshot = match serde_json::from_value(output) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        let message = format!("undecodable render output: {err}");
                        self.record_failure(key, args, &message).await;
                        return Err(TaskError::Render(message));
                    }
                };
                self.cache
                    .save(EntryWrite::rendered(args, key, snapshot))
                    .await
                    .map_err(|err| TaskError::Storage(err.to_string()))
            }
            // Not the page's fault; leave the entry alone so recovery can retry it.
            Err(err) if err.is_backend_down() => Err(TaskError::BackendUnavailable(err.to_string())),
            Err(err @ PoolError::WorkerLost { .. }) => {
                let message = err.to_string();
                self.record_failure(key, args, &message).await;
                Err(TaskError::WorkerLost(message))
            }
            Err(err) => {
                let message = err.to_string();
                self.record_failure(key, args, &message).await;
                Err(TaskError::Render(message))
            }
        }
    }
}
