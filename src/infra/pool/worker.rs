//! Per-worker state and the worker loop.
//!
//! A worker is a long-lived task with a one-slot inbox. Each job runs in its
//! own spawned task so a panic, a timeout or an explicit termination only
//! takes that worker down. State transitions:
//! `Starting -> Idle -> Busy -> {Idle, Dead}`; dead slots are handed to the
//! supervisor for replacement.

use std::{collections::HashMap, sync::Arc, time::Instant};

use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinError},
};
use tracing::debug;

use super::{
    PoolInner,
    error::{LossReason, PoolError},
    job::{JobError, JobHandler},
};

pub(crate) type Handlers = Arc<HashMap<String, Arc<dyn JobHandler>>>;
pub(crate) type JobReply = oneshot::Sender<Result<Value, PoolError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Dead,
}

pub(crate) struct Job {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) args: Value,
    pub(crate) reply: JobReply,
    pub(crate) queued_at: Instant,
}

pub(crate) struct WorkerSlot {
    pub(crate) id: usize,
    pub(crate) status: WorkerStatus,
    pub(crate) inbox: Option<mpsc::Sender<Job>>,
    pub(crate) task: Option<AbortHandle>,
    pub(crate) current: Option<AbortHandle>,
    /// Set when termination was requested before the job task existed.
    pub(crate) kill_pending: bool,
}

impl WorkerSlot {
    pub(crate) fn starting(id: usize) -> Self {
        Self {
            id,
            status: WorkerStatus::Starting,
            inbox: None,
            task: None,
            current: None,
            kill_pending: false,
        }
    }

    /// Hand a job to this worker. Gives the job back if the worker is gone.
    pub(crate) fn assign(&mut self, job: Job) -> Result<(), Job> {
        let Some(inbox) = self.inbox.as_ref() else {
            return Err(job);
        };
        match inbox.try_send(job) {
            Ok(()) => {
                self.status = WorkerStatus::Busy;
                Ok(())
            }
            Err(err) => Err(err.into_inner()),
        }
    }

    /// Abort whatever the worker is running and drop its inbox.
    pub(crate) fn shut_down(&mut self) {
        if let Some(current) = self.current.take() {
            current.abort();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.inbox = None;
    }
}

/// Spawn the loop for a worker that already passed its readiness probe.
pub(crate) fn spawn_worker(
    inner: Arc<PoolInner>,
    slot: &mut WorkerSlot,
    epoch: u64,
    handlers: Handlers,
) {
    let (inbox, receiver) = mpsc::channel(1);
    let worker_id = slot.id;
    let task = tokio::spawn(run_worker(inner, worker_id, epoch, handlers, receiver));
    slot.inbox = Some(inbox);
    slot.task = Some(task.abort_handle());
    slot.current = None;
    slot.kill_pending = false;
    slot.status = WorkerStatus::Idle;
}

async fn run_worker(
    inner: Arc<PoolInner>,
    worker_id: usize,
    epoch: u64,
    handlers: Handlers,
    mut inbox: mpsc::Receiver<Job>,
) {
    while let Some(job) = inbox.recv().await {
        debug!(
            target = "infra::pool::worker",
            worker_id,
            job_id = job.id,
            job = %job.name,
            waited_ms = job.queued_at.elapsed().as_millis() as u64,
            "Worker picked up job"
        );
        match execute(&inner, worker_id, epoch, &handlers, &job).await {
            Ok(result) => {
                let _ = job.reply.send(result.map_err(PoolError::from));
                inner.job_finished(worker_id, epoch);
            }
            Err(reason) => {
                let _ = job.reply.send(Err(PoolError::WorkerLost {
                    worker_id,
                    reason: reason.clone(),
                }));
                inner.worker_lost(worker_id, epoch, reason);
                return;
            }
        }
    }
}

async fn execute(
    inner: &Arc<PoolInner>,
    worker_id: usize,
    epoch: u64,
    handlers: &Handlers,
    job: &Job,
) -> Result<Result<Value, JobError>, LossReason> {
    let Some(handler) = handlers.get(&job.name).cloned() else {
        return Ok(Err(JobError::failed(format!(
            "no handler for `{}` on this worker",
            job.name
        ))));
    };

    let args = job.args.clone();
    let mut task = tokio::spawn(async move { handler.run(args).await });
    inner.set_current(worker_id, epoch, task.abort_handle());

    let job_timeout = inner.config.job_timeout;
    match tokio::time::timeout(job_timeout, &mut task).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(loss_from_join(err)),
        Err(_) => {
            task.abort();
            Err(LossReason::TimedOut(job_timeout))
        }
    }
}

pub(crate) fn loss_from_join(err: JoinError) -> LossReason {
    if err.is_cancelled() {
        return LossReason::Terminated;
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    LossReason::Panicked(message)
}

/// Run every handler's readiness probe in an isolated task.
pub(crate) async fn probe(handlers: Handlers) -> Result<(), String> {
    let checked = tokio::spawn(async move {
        for (name, handler) in handlers.iter() {
            handler
                .ready()
                .await
                .map_err(|err| format!("handler `{name}` not ready: {err}"))?;
        }
        Ok::<(), String>(())
    })
    .await;

    match checked {
        Ok(result) => result,
        Err(err) => Err(format!("readiness probe {}", loss_from_join(err))),
    }
}
