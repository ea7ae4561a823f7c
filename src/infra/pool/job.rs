//! Named job handlers executed by pool workers.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a handler. Arguments and results cross the worker
/// boundary as JSON, so errors are flattened to messages as well.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("invalid job arguments: {0}")]
    InvalidArgs(String),
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, args: Value) -> Result<Value, JobError>;

    /// Readiness probe run when a worker starts or is replaced.
    async fn ready(&self) -> Result<(), JobError> {
        Ok(())
    }
}
