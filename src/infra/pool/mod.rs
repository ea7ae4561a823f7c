//! Single-host worker pool.
//!
//! Jobs are named and carry JSON arguments. An idle worker takes a job
//! immediately, otherwise it waits in a FIFO backlog that workers drain as
//! they finish. Lost workers (panic, timeout, termination) fail their job with
//! [`PoolError::WorkerLost`] and are replaced by the supervisor; when
//! replacements keep failing the pool turns fatal and reports it on the
//! health channel.

mod config;
mod error;
mod job;
mod supervisor;
mod worker;

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::Instant,
};

use metrics::{counter, gauge, histogram};
use serde_json::Value;
use tokio::{
    sync::{Notify, mpsc, oneshot, watch},
    task::AbortHandle,
};
use tracing::{error, info, instrument, warn};

pub use config::PoolConfig;
pub use error::{LossReason, PoolError};
pub use job::{JobError, JobHandler};
pub use worker::WorkerStatus;

use worker::{Handlers, Job, WorkerSlot, probe, spawn_worker};

use crate::util::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "infra::pool";

pub(crate) const METRIC_POOL_BACKLOG: &str = "crawlsnap_pool_backlog";
pub(crate) const METRIC_POOL_JOB_MS: &str = "crawlsnap_pool_job_ms";
pub(crate) const METRIC_POOL_WORKER_LOST: &str = "crawlsnap_pool_worker_lost_total";
pub(crate) const METRIC_POOL_WORKER_RESTART: &str = "crawlsnap_pool_worker_restart_total";

/// Externally visible pool condition, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    Stopped,
    Starting,
    Healthy,
    /// Running with at least one worker dead or being replaced.
    Degraded,
    /// Workers cannot be sustained; only `reinitialize` leaves this state.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolPhase {
    Stopped,
    Starting,
    Running,
    Fatal(String),
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub health: PoolHealth,
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub unavailable: usize,
    pub backlog: usize,
    pub restart_failures: u32,
}

struct PoolState {
    phase: PoolPhase,
    /// Bumped on every start/stop so callbacks from a previous generation of
    /// workers are ignored.
    epoch: u64,
    workers: Vec<WorkerSlot>,
    backlog: VecDeque<Job>,
    restart_failures: u32,
    next_job_id: u64,
    supervisor: Option<(mpsc::UnboundedSender<usize>, AbortHandle)>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    handlers: RwLock<Handlers>,
    state: Mutex<PoolState>,
    health: watch::Sender<PoolHealth>,
    drained: Notify,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let (health, _) = watch::channel(PoolHealth::Stopped);
        Self {
            inner: Arc::new(PoolInner {
                config,
                handlers: RwLock::new(Arc::new(HashMap::new())),
                state: Mutex::new(PoolState {
                    phase: PoolPhase::Stopped,
                    epoch: 0,
                    workers: Vec::new(),
                    backlog: VecDeque::new(),
                    restart_failures: 0,
                    next_job_id: 0,
                    supervisor: None,
                }),
                health,
                drained: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Associate a job name with the handler every worker runs for it.
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), PoolError> {
        let state = mutex_lock(&self.inner.state, SOURCE, "register_handler");
        if state.phase != PoolPhase::Stopped {
            return Err(PoolError::AlreadyStarted);
        }
        let mut handlers = rw_write(&self.inner.handlers, SOURCE, "register_handler");
        let mut updated = HashMap::clone(&handlers);
        updated.insert(name.into(), handler);
        *handlers = Arc::new(updated);
        Ok(())
    }

    pub fn health(&self) -> watch::Receiver<PoolHealth> {
        self.inner.health.subscribe()
    }

    pub fn stats(&self) -> PoolStats {
        let state = mutex_lock(&self.inner.state, SOURCE, "stats");
        let count = |status: WorkerStatus| {
            state
                .workers
                .iter()
                .filter(|slot| slot.status == status)
                .count()
        };
        PoolStats {
            health: health_of(&state),
            workers: state.workers.len(),
            idle: count(WorkerStatus::Idle),
            busy: count(WorkerStatus::Busy),
            unavailable: count(WorkerStatus::Dead) + count(WorkerStatus::Starting),
            backlog: state.backlog.len(),
            restart_failures: state.restart_failures,
        }
    }

    /// Spawn `count` workers and wait for all of them to pass their readiness
    /// probe within the startup timeout.
    #[instrument(skip(self))]
    pub async fn start(&self, count: usize) -> Result<(), PoolError> {
        if count == 0 {
            return Err(PoolError::Startup("pool needs at least one worker".into()));
        }
        let started_at = Instant::now();
        let handlers = rw_read(&self.inner.handlers, SOURCE, "start").clone();

        let epoch = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "start");
            if state.phase != PoolPhase::Stopped {
                return Err(PoolError::AlreadyStarted);
            }
            state.phase = PoolPhase::Starting;
            state.epoch += 1;
            state.restart_failures = 0;
            state.workers = (0..count).map(WorkerSlot::starting).collect();
            self.inner.publish_health(&state);
            state.epoch
        };

        let probes = futures::future::join_all((0..count).map(|_| probe(Arc::clone(&handlers))));
        let outcome = match tokio::time::timeout(self.inner.config.startup_timeout, probes).await {
            Ok(results) => results.into_iter().collect::<Result<Vec<()>, String>>().map(|_| ()),
            Err(_) => Err(format!(
                "workers not ready within {}ms",
                self.inner.config.startup_timeout.as_millis()
            )),
        };

        let mut state = mutex_lock(&self.inner.state, SOURCE, "start");
        if state.epoch != epoch || state.phase != PoolPhase::Starting {
            return Err(PoolError::Stopped);
        }
        if let Err(reason) = outcome {
            state.phase = PoolPhase::Stopped;
            state.workers.clear();
            state.epoch += 1;
            fail_backlog(&mut state, || PoolError::Startup(reason.clone()));
            self.inner.publish_health(&state);
            error!(
                target = SOURCE,
                op = "start",
                result = "error",
                workers = count,
                error = %reason,
                "Worker pool failed to start"
            );
            return Err(PoolError::Startup(reason));
        }

        for slot in state.workers.iter_mut() {
            spawn_worker(Arc::clone(&self.inner), slot, epoch, Arc::clone(&handlers));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervisor::supervise(
            Arc::clone(&self.inner),
            epoch,
            handlers,
            rx,
        ));
        state.supervisor = Some((tx, supervisor.abort_handle()));
        state.phase = PoolPhase::Running;
        for worker_id in 0..count {
            self.inner.drain_backlog_into(&mut state, worker_id);
        }
        self.inner.publish_health(&state);

        info!(
            target = SOURCE,
            op = "start",
            result = "ok",
            workers = count,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Worker pool started"
        );
        Ok(())
    }

    /// Run a job on the next free worker and wait for its result.
    pub async fn submit(&self, name: &str, args: Value) -> Result<Value, PoolError> {
        let handlers = rw_read(&self.inner.handlers, SOURCE, "submit").clone();
        if !handlers.contains_key(name) {
            return Err(PoolError::UnknownJob(name.to_string()));
        }

        let started_at = Instant::now();
        let (reply, receiver) = oneshot::channel();
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "submit");
            match &state.phase {
                PoolPhase::Running | PoolPhase::Starting => {}
                PoolPhase::Fatal(reason) => return Err(PoolError::Fatal(reason.clone())),
                PoolPhase::Stopped | PoolPhase::Stopping => return Err(PoolError::NotRunning),
            }
            state.next_job_id += 1;
            let job = Job {
                id: state.next_job_id,
                name: name.to_string(),
                args,
                reply,
                queued_at: started_at,
            };

            let idle = state
                .workers
                .iter()
                .position(|slot| slot.status == WorkerStatus::Idle);
            let job = match idle {
                Some(index) if state.phase == PoolPhase::Running => {
                    state.workers[index].assign(job).err()
                }
                _ => Some(job),
            };
            if let Some(job) = job {
                state.backlog.push_back(job);
                gauge!(METRIC_POOL_BACKLOG).set(state.backlog.len() as f64);
            }
        }

        let result = receiver.await.unwrap_or(Err(PoolError::Stopped));
        let outcome = match &result {
            Ok(_) => "ok",
            Err(PoolError::WorkerLost { .. }) => "worker_lost",
            Err(_) => "error",
        };
        histogram!(METRIC_POOL_JOB_MS, "job" => name.to_string(), "outcome" => outcome)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Kill the job a worker is currently running. The worker is then
    /// handled exactly like a crash. A job that was assigned but has not
    /// started yet is killed as soon as it starts. Returns false when the
    /// worker was not busy.
    pub fn terminate_worker(&self, worker_id: usize) -> bool {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "terminate_worker");
        let Some(slot) = state.workers.get_mut(worker_id) else {
            return false;
        };
        if slot.status != WorkerStatus::Busy {
            return false;
        }
        match &slot.current {
            Some(current) => current.abort(),
            None => slot.kill_pending = true,
        }
        warn!(
            target = SOURCE,
            op = "terminate_worker",
            worker_id,
            pending = slot.kill_pending,
            "Worker terminated on request"
        );
        true
    }

    /// Fail the backlog, let in-flight jobs finish within the job timeout,
    /// then tear the workers down. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), PoolError> {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "stop");
            match state.phase {
                PoolPhase::Stopped | PoolPhase::Stopping => return Ok(()),
                _ => {}
            }
            state.phase = PoolPhase::Stopping;
            if let Some((_, supervisor)) = state.supervisor.take() {
                supervisor.abort();
            }
            fail_backlog(&mut state, || PoolError::Stopped);
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.job_timeout;
        loop {
            let drained = self.inner.drained.notified();
            if self.busy_workers() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    target = SOURCE,
                    op = "stop",
                    result = "abandoned",
                    busy = self.busy_workers(),
                    "Abandoning jobs still running at shutdown"
                );
                break;
            }
        }

        let mut state = mutex_lock(&self.inner.state, SOURCE, "stop");
        for slot in state.workers.iter_mut() {
            slot.shut_down();
        }
        state.workers.clear();
        state.phase = PoolPhase::Stopped;
        state.epoch += 1;
        self.inner.publish_health(&state);
        info!(target = SOURCE, op = "stop", result = "ok", "Worker pool stopped");
        Ok(())
    }

    /// Tear down whatever is left and start a fresh set of workers.
    pub async fn reinitialize(&self) -> Result<(), PoolError> {
        info!(target = SOURCE, op = "reinitialize", "Re-initializing worker pool");
        self.stop().await?;
        self.start(self.inner.config.workers).await
    }

    fn busy_workers(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "busy_workers")
            .workers
            .iter()
            .filter(|slot| slot.status == WorkerStatus::Busy)
            .count()
    }
}

impl PoolInner {
    fn publish_health(&self, state: &PoolState) {
        let health = health_of(state);
        self.health.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }

    fn set_current(&self, worker_id: usize, epoch: u64, abort: AbortHandle) {
        let mut state = mutex_lock(&self.state, SOURCE, "set_current");
        if state.epoch != epoch {
            abort.abort();
            return;
        }
        let Some(slot) = state.workers.get_mut(worker_id) else {
            return;
        };
        if std::mem::take(&mut slot.kill_pending) {
            abort.abort();
        }
        slot.current = Some(abort);
    }

    /// A worker returned a result: give it the next backlog job or mark it idle.
    fn job_finished(&self, worker_id: usize, epoch: u64) {
        let mut state = mutex_lock(&self.state, SOURCE, "job_finished");
        if state.epoch != epoch {
            return;
        }
        let Some(slot) = state.workers.get_mut(worker_id) else {
            return;
        };
        slot.current = None;
        slot.kill_pending = false;
        slot.status = WorkerStatus::Idle;
        if state.phase == PoolPhase::Running {
            self.drain_backlog_into(&mut state, worker_id);
        } else {
            self.drained.notify_waiters();
        }
    }

    fn worker_lost(&self, worker_id: usize, epoch: u64, reason: LossReason) {
        let mut state = mutex_lock(&self.state, SOURCE, "worker_lost");
        if state.epoch != epoch {
            return;
        }
        if let Some(slot) = state.workers.get_mut(worker_id) {
            slot.current = None;
            slot.kill_pending = false;
            slot.task = None;
            slot.inbox = None;
            slot.status = WorkerStatus::Dead;
        }
        counter!(METRIC_POOL_WORKER_LOST, "reason" => reason.as_label()).increment(1);
        warn!(
            target = SOURCE,
            op = "worker_lost",
            worker_id,
            reason = %reason,
            "Worker lost its job; scheduling replacement"
        );

        match state.phase {
            PoolPhase::Running => {
                if let Some((supervisor, _)) = state.supervisor.as_ref() {
                    let _ = supervisor.send(worker_id);
                }
            }
            PoolPhase::Stopping => self.drained.notify_waiters(),
            _ => {}
        }
        self.publish_health(&state);
    }

    /// Keep an idle worker busy while the backlog has jobs.
    fn drain_backlog_into(&self, state: &mut PoolState, worker_id: usize) {
        let Some(slot) = state.workers.get(worker_id) else {
            return;
        };
        if slot.status != WorkerStatus::Idle {
            return;
        }
        if let Some(job) = state.backlog.pop_front() {
            if let Err(job) = state.workers[worker_id].assign(job) {
                state.backlog.push_front(job);
            }
            gauge!(METRIC_POOL_BACKLOG).set(state.backlog.len() as f64);
        }
    }

    fn enter_fatal(&self, state: &mut PoolState, reason: String) {
        error!(
            target = SOURCE,
            op = "enter_fatal",
            result = "fatal",
            restart_failures = state.restart_failures,
            error = %reason,
            "Worker pool cannot sustain workers"
        );
        fail_backlog(state, || PoolError::Fatal(reason.clone()));
        state.phase = PoolPhase::Fatal(reason);
        self.publish_health(state);
    }
}

fn fail_backlog(state: &mut PoolState, error: impl Fn() -> PoolError) {
    for job in state.backlog.drain(..) {
        let _ = job.reply.send(Err(error()));
    }
    gauge!(METRIC_POOL_BACKLOG).set(0.0);
}

fn health_of(state: &PoolState) -> PoolHealth {
    match &state.phase {
        PoolPhase::Stopped | PoolPhase::Stopping => PoolHealth::Stopped,
        PoolPhase::Starting => PoolHealth::Starting,
        PoolPhase::Fatal(_) => PoolHealth::Fatal,
        PoolPhase::Running => {
            let all_up = state
                .workers
                .iter()
                .all(|slot| matches!(slot.status, WorkerStatus::Idle | WorkerStatus::Busy));
            if all_up {
                PoolHealth::Healthy
            } else {
                PoolHealth::Degraded
            }
        }
    }
}
