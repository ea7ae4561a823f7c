//! Request orchestration.
//!
//! A [`Processor`] owns the route table and drives each call through its
//! route's pipeline: set up the render context, read the cache, decide whether
//! to enqueue a render, wait for it or serve what is cached, then post-process.
//! It also installs the cache's staleness hook and supervises the worker pool,
//! pausing the scheduler while the backend is re-initialized after a fatal
//! failure.

mod executor;
mod stages;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};

use futures::{StreamExt, stream};
use metrics::counter;
use thiserror::Error;
use tokio::{sync::watch, task::AbortHandle};
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

pub use stages::RenderContext;

use executor::RenderExecutor;
use stages::{AwaitOrReturn, DecideAndEnqueue, PostProcess, ReadCache, SetUpContext, target_url};

use crate::{
    application::{
        render::{PostProcessError, PostProcessor, RENDER_JOB, RenderBackend, RenderJob, RenderedPage},
        router::{DispatchError, PatternError, RoutePattern, Router, Stage},
        scheduler::{RenderScheduler, TaskError, TaskResult},
    },
    cache::{CacheError, SnapshotCache},
    domain::{CacheEntry, RenderArgs},
    infra::pool::{PoolError, PoolHealth, WorkerPool},
    util::lock::{mutex_lock, rw_read, rw_write},
};

const SOURCE: &str = "application::processor";

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_RECOVERY_ATTEMPTS: u32 = 3;

pub(crate) const METRIC_BACKEND_RECOVERY: &str = "crawlsnap_backend_recovery_total";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no route matches `{pathname}`")]
    NotFound { pathname: String },
    #[error("`{pathname}` cannot be resolved against the origin: {reason}")]
    InvalidPath { pathname: String, reason: String },
    #[error("no snapshot available yet for `{key}`")]
    Unavailable { key: String },
    #[error(transparent)]
    Render(#[from] TaskError),
    #[error("render of `{key}` did not finish within {waited_ms}ms")]
    DeadlineElapsed { key: String, waited_ms: u64 },
    #[error(transparent)]
    Storage(#[from] CacheError),
    #[error(transparent)]
    PostProcess(#[from] PostProcessError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("processor error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Origin that pathnames are resolved against before rendering.
    pub host: Url,
    /// Renders allowed in flight at once.
    pub concurrency: usize,
    /// Default bound on a waiting caller, independent of the job timeout.
    pub wait_timeout: Duration,
    /// Pool re-initializations tried after a fatal failure before the
    /// scheduler circuit is opened.
    pub recovery_attempts: u32,
}

impl ProcessorConfig {
    pub fn new(host: Url) -> Self {
        Self {
            host,
            concurrency: DEFAULT_CONCURRENCY,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            recovery_attempts: DEFAULT_RECOVERY_ATTEMPTS,
        }
    }
}

impl From<&crate::config::Settings> for ProcessorConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            host: settings.origin.host.clone(),
            concurrency: settings.scheduler.concurrency.get(),
            wait_timeout: settings.scheduler.wait_timeout,
            recovery_attempts: settings.scheduler.recovery_attempts,
        }
    }
}

/// Per-call flags supplied by the host integration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Regenerate even when the cached snapshot is fresh.
    pub force: bool,
    /// Block until the render finishes instead of serving what is cached.
    pub wait: bool,
    pub query: BTreeMap<String, String>,
    /// Overrides [`ProcessorConfig::wait_timeout`] for this call.
    pub deadline: Option<Duration>,
}

impl CallOptions {
    pub fn regenerate() -> Self {
        Self {
            force: true,
            wait: true,
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: BTreeMap<String, String>) -> Self {
        self.query = query;
        self
    }
}

/// A registered route and the cache key it renders into.
#[derive(Debug, Clone)]
pub struct RouteBinding {
    pub key: String,
    pub pattern: RoutePattern,
}

#[derive(Debug)]
pub struct CrawlOutcome {
    pub pattern: String,
    pub pathname: String,
    pub result: TaskResult,
}

/// Result of a crawl: one outcome per rendered sample, plus the patterns that
/// were left out because they have no sample pathname.
#[derive(Debug, Default)]
pub struct CrawlReport {
    pub outcomes: Vec<CrawlOutcome>,
    pub skipped: Vec<String>,
}

#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    config: ProcessorConfig,
    cache: SnapshotCache,
    pool: WorkerPool,
    scheduler: RenderScheduler,
    post_processor: Arc<dyn PostProcessor>,
    router: RwLock<Arc<Router<RenderContext, ProcessError>>>,
    bindings: RwLock<Vec<RouteBinding>>,
    supervisor: Mutex<Option<AbortHandle>>,
    recovery: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("host", &self.inner.config.host.as_str())
            .field("routes", &rw_read(&self.inner.bindings, SOURCE, "debug").len())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl Processor {
    /// Wire the collaborators together. Registers the render job on `pool`,
    /// so the pool must not be started yet.
    pub fn new(
        config: ProcessorConfig,
        cache: SnapshotCache,
        pool: WorkerPool,
        backend: Arc<dyn RenderBackend>,
        post_processor: Arc<dyn PostProcessor>,
    ) -> Result<Self, ProcessError> {
        pool.register_handler(RENDER_JOB, Arc::new(RenderJob::new(backend)))?;
        let executor = Arc::new(RenderExecutor::new(pool.clone(), cache.clone()));
        let scheduler = RenderScheduler::new(executor, config.concurrency);

        Ok(Self {
            inner: Arc::new(ProcessorInner {
                config,
                cache,
                pool,
                scheduler,
                post_processor,
                router: RwLock::new(Arc::new(Router::new())),
                bindings: RwLock::new(Vec::new()),
                supervisor: Mutex::new(None),
                recovery: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.inner.cache
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.inner.scheduler
    }

    /// Open the cache, start the workers, and begin refreshing stale entries.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ProcessError> {
        self.inner.cache.start().await?;
        self.inner
            .pool
            .start(self.inner.pool.config().workers)
            .await?;
        self.inner.scheduler.close_circuit();

        let weak = Arc::downgrade(&self.inner);
        self.inner.cache.set_stale_hook(move |entry| {
            if let Some(inner) = weak.upgrade() {
                inner.refresh(entry);
            }
        });

        let supervisor = tokio::spawn(watch_backend(
            Arc::downgrade(&self.inner),
            self.inner.pool.health(),
        ));
        if let Some(previous) =
            mutex_lock(&self.inner.supervisor, SOURCE, "start").replace(supervisor.abort_handle())
        {
            previous.abort();
        }

        info!(
            target = SOURCE,
            op = "start",
            result = "ok",
            host = %self.inner.config.host,
            "Processor started"
        );
        Ok(())
    }

    /// Reject new work, let running renders finish, and close the cache.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), ProcessError> {
        if let Some(supervisor) = mutex_lock(&self.inner.supervisor, SOURCE, "stop").take() {
            supervisor.abort();
        }
        self.inner.cache.clear_stale_hook();
        self.inner.scheduler.open_circuit("processor stopped");
        self.inner.pool.stop().await?;
        self.inner.cache.stop().await?;
        info!(target = SOURCE, op = "stop", result = "ok", "Processor stopped");
        Ok(())
    }

    /// Register `pattern` behind every route added before it and return the
    /// cache key it renders into. A key already stored for the same pattern
    /// source is reused. Needs a started cache.
    pub async fn route(&self, pattern: RoutePattern) -> Result<String, ProcessError> {
        let known = rw_read(&self.inner.bindings, SOURCE, "route")
            .iter()
            .find(|binding| binding.pattern.source() == pattern.source())
            .map(|binding| binding.key.clone());
        let key = match known {
            Some(key) => key,
            None => match self.inner.cache.find_by_route(pattern.source()).await? {
                Some(entry) => entry.key,
                None => Uuid::new_v4().to_string(),
            },
        };

        let pipeline = self.inner.pipeline(&key, pattern.source());
        {
            let mut router = rw_write(&self.inner.router, SOURCE, "route");
            let mut next = (**router).clone();
            next.route(pattern.clone(), pipeline);
            *router = Arc::new(next);
        }
        rw_write(&self.inner.bindings, SOURCE, "route").push(RouteBinding {
            key: key.clone(),
            pattern: pattern.clone(),
        });

        info!(
            target = SOURCE,
            op = "route",
            pattern = pattern.source(),
            key = %key,
            "Route registered"
        );
        Ok(key)
    }

    pub fn routes(&self) -> Vec<RouteBinding> {
        rw_read(&self.inner.bindings, SOURCE, "routes").clone()
    }

    pub fn is_match(&self, pathname: &str) -> bool {
        rw_read(&self.inner.router, SOURCE, "is_match")
            .matches(pathname)
            .is_some()
    }

    /// Resolve `pathname` to a snapshot.
    #[instrument(skip(self, options), fields(force = options.force, wait = options.wait))]
    pub async fn call(&self, pathname: &str, options: CallOptions) -> Result<RenderedPage, ProcessError> {
        let router = Arc::clone(&rw_read(&self.inner.router, SOURCE, "call"));
        let context = router
            .dispatch(pathname, RenderContext::new(pathname, options))
            .await
            .map_err(|err| match err {
                DispatchError::NoRoute { pathname } => ProcessError::NotFound { pathname },
                DispatchError::Stage { source, .. } => source,
            })?;
        context
            .page
            .ok_or_else(|| ProcessError::Internal("pipeline finished without a page".to_string()))
    }

    /// Force-render every route that has a sample pathname. Routes without
    /// one are reported in [`CrawlReport::skipped`].
    #[instrument(skip(self))]
    pub async fn crawl(&self) -> CrawlReport {
        let mut skipped = Vec::new();
        let mut targets: Vec<(RouteBinding, String)> = Vec::new();
        for binding in self.routes() {
            match binding.pattern.sample() {
                Some(sample) => {
                    let sample = sample.to_string();
                    targets.push((binding, sample));
                }
                None => {
                    warn!(
                        target = SOURCE,
                        op = "crawl",
                        result = "skipped",
                        pattern = binding.pattern.source(),
                        "Route has no sample pathname; not crawled"
                    );
                    skipped.push(binding.pattern.source().to_string());
                }
            }
        }
        debug!(
            target = SOURCE,
            op = "crawl",
            routes = targets.len(),
            skipped = skipped.len(),
            "Crawl started"
        );

        let outcomes: Vec<CrawlOutcome> = stream::iter(targets)
            .map(|(binding, pathname)| async move {
                let result = self.render_now(&binding, &pathname).await;
                match &result {
                    Ok(_) => info!(
                        target = SOURCE,
                        op = "crawl",
                        result = "ok",
                        pattern = binding.pattern.source(),
                        pathname = %pathname,
                        "Route rendered"
                    ),
                    Err(err) => warn!(
                        target = SOURCE,
                        op = "crawl",
                        result = "error",
                        pattern = binding.pattern.source(),
                        pathname = %pathname,
                        error = %err,
                        "Route render failed"
                    ),
                }
                CrawlOutcome {
                    pattern: binding.pattern.source().to_string(),
                    pathname,
                    result,
                }
            })
            .buffer_unordered(self.inner.config.concurrency.max(1))
            .collect()
            .await;
        CrawlReport { outcomes, skipped }
    }

    /// Operator-triggered re-initialization of the worker pool. Closes the
    /// scheduler circuit when the pool comes back.
    pub async fn recover_backend(&self) -> Result<(), ProcessError> {
        self.inner.restore_backend(1).await
    }

    async fn render_now(&self, binding: &RouteBinding, pathname: &str) -> TaskResult {
        let url = target_url(&self.inner.config.host, pathname)
            .map_err(|err| TaskError::Internal(err.to_string()))?;
        let args = RenderArgs {
            url: url.to_string(),
            pathname: pathname.to_string(),
            route: binding.pattern.source().to_string(),
            variant: BTreeMap::new(),
        };
        self.inner.scheduler.enqueue(&binding.key, args).outcome().await
    }
}

impl ProcessorInner {
    fn pipeline(&self, key: &str, route: &str) -> Vec<Arc<dyn Stage<RenderContext, ProcessError>>> {
        vec![
            Arc::new(SetUpContext {
                key: key.to_string(),
                route: route.to_string(),
                host: self.config.host.clone(),
            }),
            Arc::new(ReadCache {
                cache: self.cache.clone(),
            }),
            Arc::new(DecideAndEnqueue {
                scheduler: self.scheduler.clone(),
            }),
            Arc::new(AwaitOrReturn {
                wait_timeout: self.config.wait_timeout,
            }),
            Arc::new(PostProcess {
                post_processor: Arc::clone(&self.post_processor),
            }),
        ]
    }

    /// Staleness hook: re-render the pathname the entry was last rendered from.
    fn refresh(&self, entry: CacheEntry) {
        let Some(pathname) = entry.pathname else {
            debug!(
                target = SOURCE,
                op = "refresh",
                key = %entry.key,
                "Stale entry has no pathname; skipping refresh"
            );
            return;
        };
        let url = match target_url(&self.config.host, &pathname) {
            Ok(url) => url,
            Err(err) => {
                warn!(target = SOURCE, op = "refresh", key = %entry.key, error = %err, "Cannot refresh entry");
                return;
            }
        };
        let args = RenderArgs {
            url: url.to_string(),
            pathname,
            route: entry.route,
            variant: BTreeMap::new(),
        };
        debug!(target = SOURCE, op = "refresh", key = %entry.key, "Refreshing stale entry");
        // Background refresh; nobody waits on the ticket.
        drop(self.scheduler.enqueue(&entry.key, args));
    }

    /// Pause admission, detach running tasks, and try to bring the pool back.
    /// On success the detached tasks go back to the head of the queue; after
    /// `attempts` failures the circuit opens and they fail.
    async fn restore_backend(&self, attempts: u32) -> Result<(), ProcessError> {
        let _recovery = self.recovery.lock().await;
        self.scheduler.pause();
        let stranded = self.scheduler.take_in_flight();
        warn!(
            target = SOURCE,
            op = "restore_backend",
            stranded = stranded.len(),
            attempts,
            "Re-initializing render backend"
        );

        let mut last_error = PoolError::NotRunning;
        for attempt in 1..=attempts.max(1) {
            match self.pool.reinitialize().await {
                Ok(()) => {
                    self.scheduler.close_circuit();
                    self.scheduler.recover_in_flight(stranded);
                    self.scheduler.resume();
                    counter!(METRIC_BACKEND_RECOVERY, "result" => "ok").increment(1);
                    info!(
                        target = SOURCE,
                        op = "restore_backend",
                        result = "ok",
                        attempt,
                        "Render backend recovered"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        op = "restore_backend",
                        result = "retry",
                        attempt,
                        error = %err,
                        "Render backend re-initialization failed"
                    );
                    last_error = err;
                }
            }
        }

        counter!(METRIC_BACKEND_RECOVERY, "result" => "circuit_open").increment(1);
        error!(
            target = SOURCE,
            op = "restore_backend",
            result = "circuit_open",
            error = %last_error,
            "Render backend could not be recovered; rejecting renders until an operator intervenes"
        );
        self.scheduler.open_circuit(last_error.to_string());
        self.scheduler.recover_in_flight(stranded);
        self.scheduler.resume();
        Err(ProcessError::Pool(last_error))
    }
}

async fn watch_backend(inner: Weak<ProcessorInner>, mut health: watch::Receiver<PoolHealth>) {
    while health.changed().await.is_ok() {
        if *health.borrow_and_update() != PoolHealth::Fatal {
            continue;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        error!(target = SOURCE, op = "watch_backend", "Worker pool reported a fatal failure");
        let _ = inner.restore_backend(inner.config.recovery_attempts).await;
        // Transitions caused by the recovery itself are not new failures.
        health.borrow_and_update();
    }
}

#[cfg(test)]
mod tests;
