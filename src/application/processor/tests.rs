use std::{
    collections::VecDeque,
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use time::macros::datetime;
use tokio::sync::Semaphore;

use super::*;
use crate::{
    application::render::{PassThrough, RenderError},
    cache::{CacheConfig, Clock, ManualClock, MemoryStore},
    domain::Snapshot,
    infra::pool::PoolConfig,
};

/// Backend that numbers its renders and can be scripted to fail or to hold
/// renders until permits are released.
#[derive(Default)]
struct Fake {
    calls: AtomicUsize,
    failures: std::sync::Mutex<VecDeque<String>>,
    gate: Option<Semaphore>,
}

impl Fake {
    fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    fn fail_next(&self, message: &str) {
        self.failures
            .lock()
            .expect("failures lock")
            .push_back(message.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }
}

#[async_trait]
impl RenderBackend for Fake {
    async fn render(&self, args: &RenderArgs) -> Result<Snapshot, RenderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|err| RenderError::Unavailable(err.to_string()))?
                .forget();
        }
        if let Some(message) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(RenderError::Navigation(message));
        }
        Ok(Snapshot::new(format!("<p>{} #{call}</p>", args.pathname)))
    }
}

struct Harness {
    processor: Processor,
    backend: Arc<Fake>,
    clock: Arc<ManualClock>,
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        workers: 2,
        job_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(1),
        max_restarts: 1,
        restart_backoff: Duration::from_millis(10),
    }
}

async fn harness(backend: Fake) -> Harness {
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 08:00 UTC)));
    let cache = SnapshotCache::with_clock(
        Arc::new(MemoryStore::new()),
        &CacheConfig::with_ttl_seconds(60),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    let backend = Arc::new(backend);
    let mut config = ProcessorConfig::new(Url::parse("http://origin.test").expect("url"));
    config.concurrency = 2;
    config.wait_timeout = Duration::from_secs(5);

    let processor = Processor::new(
        config,
        cache,
        WorkerPool::new(pool_config()),
        Arc::clone(&backend) as Arc<dyn RenderBackend>,
        Arc::new(PassThrough),
    )
    .expect("processor");
    processor.start().await.expect("start");
    Harness {
        processor,
        backend,
        clock,
    }
}

fn glob(pattern: &str) -> RoutePattern {
    RoutePattern::glob(pattern).expect("pattern")
}

fn waiting() -> CallOptions {
    CallOptions {
        wait: true,
        ..CallOptions::default()
    }
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn cached_html(processor: &Processor, key: &str) -> Option<String> {
    processor
        .cache()
        .read_for_dispatch(key)
        .await
        .expect("read")
        .and_then(|entry| entry.payload)
        .map(|payload| payload.html)
}

#[tokio::test]
async fn unmatched_pathnames_are_not_found() {
    let h = harness(Fake::default()).await;
    h.processor.route(glob("/blog/*")).await.expect("route");

    let err = h
        .processor
        .call("/about", CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::NotFound { pathname } if pathname == "/about"));
    assert!(!h.processor.is_match("/about"));
    assert!(h.processor.is_match("/blog/first"));
}

#[tokio::test]
async fn waiting_call_renders_once_then_serves_cache() {
    let h = harness(Fake::default()).await;
    h.processor.route(glob("/about")).await.expect("route");

    let page = h.processor.call("/about", waiting()).await.expect("render");
    assert_eq!(page.html, "<p>/about #1</p>");
    assert!(!page.stale);

    let page = h
        .processor
        .call("/about", CallOptions::default())
        .await
        .expect("cached");
    assert_eq!(page.html, "<p>/about #1</p>");
    assert!(!page.stale);
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn miss_without_wait_reports_unavailable_and_renders_in_background() {
    let h = harness(Fake::default()).await;
    let key = h.processor.route(glob("/about")).await.expect("route");

    let err = h
        .processor
        .call("/about", CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::Unavailable { .. }));

    let processor = h.processor.clone();
    eventually(|| {
        let processor = processor.clone();
        let key = key.clone();
        async move { cached_html(&processor, &key).await.is_some() }
    })
    .await;
}

#[tokio::test]
async fn expired_entries_are_served_stale_and_refreshed() {
    let h = harness(Fake::default()).await;
    let key = h.processor.route(glob("/blog/*")).await.expect("route");
    h.processor.call("/blog/first", waiting()).await.expect("render");

    h.clock.advance(time::Duration::seconds(61));
    let page = h
        .processor
        .call("/blog/first", CallOptions::default())
        .await
        .expect("stale page");
    assert!(page.stale);
    assert_eq!(page.html, "<p>/blog/first #1</p>");

    let processor = h.processor.clone();
    eventually(|| {
        let processor = processor.clone();
        let key = key.clone();
        async move { cached_html(&processor, &key).await.as_deref() == Some("<p>/blog/first #2</p>") }
    })
    .await;

    let page = h
        .processor
        .call("/blog/first", CallOptions::default())
        .await
        .expect("fresh page");
    assert!(!page.stale);
    assert_eq!(h.backend.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_call_on_expired_entry_renders_once() {
    let h = harness(Fake::default()).await;
    h.processor.route(glob("/blog/*")).await.expect("route");
    h.processor.call("/blog/first", waiting()).await.expect("render");

    for round in 2..=20 {
        h.clock.advance(time::Duration::seconds(61));
        let page = h
            .processor
            .call("/blog/first", waiting())
            .await
            .expect("regenerated page");
        assert!(!page.stale);
        assert_eq!(page.html, format!("<p>/blog/first #{round}</p>"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.backend.calls(), round);
    }
}

#[tokio::test]
async fn stale_hook_still_refreshes_reads_outside_calls() {
    let h = harness(Fake::default()).await;
    let key = h.processor.route(glob("/about")).await.expect("route");
    h.processor.call("/about", waiting()).await.expect("render");

    h.clock.advance(time::Duration::seconds(61));
    let entry = h
        .processor
        .cache()
        .read(&key)
        .await
        .expect("read")
        .expect("entry");
    assert_eq!(
        entry.payload.map(|payload| payload.html).as_deref(),
        Some("<p>/about #1</p>")
    );

    let processor = h.processor.clone();
    eventually(|| {
        let processor = processor.clone();
        let key = key.clone();
        async move { cached_html(&processor, &key).await.as_deref() == Some("<p>/about #2</p>") }
    })
    .await;
    assert_eq!(h.backend.calls(), 2);
}

#[tokio::test]
async fn failed_render_is_recorded_and_forces_a_synchronous_retry() {
    let h = harness(Fake::default()).await;
    let key = h.processor.route(glob("/about")).await.expect("route");
    h.backend.fail_next("net::ERR_CONNECTION_RESET");

    let err = h.processor.call("/about", waiting()).await.unwrap_err();
    match err {
        ProcessError::Render(TaskError::Render(message)) => {
            assert!(message.contains("net::ERR_CONNECTION_RESET"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let entry = h.processor.cache().read_for_dispatch(&key).await.expect("read").expect("entry");
    assert!(entry.is_errored());
    assert!(!entry.has_payload());

    // No wait requested, but the recorded error upgrades the call.
    let page = h
        .processor
        .call("/about", CallOptions::default())
        .await
        .expect("retry");
    assert_eq!(page.html, "<p>/about #2</p>");
    assert!(!page.stale);
    let entry = h.processor.cache().read_for_dispatch(&key).await.expect("read").expect("entry");
    assert!(!entry.is_errored());
}

#[tokio::test]
async fn failed_regeneration_serves_previous_snapshot() {
    let h = harness(Fake::default()).await;
    h.processor.route(glob("/about")).await.expect("route");
    h.processor.call("/about", waiting()).await.expect("render");

    h.backend.fail_next("timeout");
    let page = h
        .processor
        .call("/about", CallOptions::regenerate())
        .await
        .expect("stale fallback");
    assert!(page.stale);
    assert_eq!(page.html, "<p>/about #1</p>");
}

#[tokio::test]
async fn waiting_callers_are_bounded_by_their_deadline() {
    let h = harness(Fake::gated()).await;
    let key = h.processor.route(glob("/slow")).await.expect("route");

    let options = CallOptions {
        deadline: Some(Duration::from_millis(50)),
        ..waiting()
    };
    let err = h.processor.call("/slow", options).await.unwrap_err();
    assert!(matches!(err, ProcessError::DeadlineElapsed { waited_ms: 50, .. }));

    h.backend.release(1);
    let processor = h.processor.clone();
    eventually(|| {
        let processor = processor.clone();
        let key = key.clone();
        async move { cached_html(&processor, &key).await.is_some() }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_render() {
    let h = harness(Fake::gated()).await;
    h.processor.route(glob("/hot")).await.expect("route");

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let processor = h.processor.clone();
            tokio::spawn(async move { processor.call("/hot", CallOptions::regenerate()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.backend.release(8);

    for call in calls {
        let page = call.await.expect("join").expect("page");
        assert_eq!(page.html, "<p>/hot #1</p>");
    }
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn route_keys_follow_the_pattern_source() {
    let h = harness(Fake::default()).await;
    let first = h.processor.route(glob("/about")).await.expect("route");
    let again = h.processor.route(glob("/about")).await.expect("route");
    assert_eq!(first, again);
    h.processor.call("/about", waiting()).await.expect("render");

    // A second processor over the same cache picks the stored key back up.
    let other = Processor::new(
        h.processor.config().clone(),
        h.processor.cache().clone(),
        WorkerPool::new(pool_config()),
        Arc::new(Fake::default()),
        Arc::new(PassThrough),
    )
    .expect("processor");
    assert_eq!(other.route(glob("/about")).await.expect("route"), first);
    assert_ne!(other.route(glob("/contact")).await.expect("route"), first);
}

#[tokio::test]
async fn crawl_renders_sampled_routes_and_reports_the_rest() {
    let h = harness(Fake::default()).await;
    h.processor.route(glob("/about")).await.expect("route");
    h.processor.route(glob("/blog/*")).await.expect("route");
    h.processor
        .route(glob("/docs/*").with_sample("/docs/intro"))
        .await
        .expect("route");

    let report = h.processor.crawl().await;
    assert_eq!(report.skipped, vec!["/blog/*".to_string()]);
    let mut outcomes = report.outcomes;
    outcomes.sort_by(|a, b| a.pathname.cmp(&b.pathname));
    let rendered: Vec<(&str, bool)> = outcomes
        .iter()
        .map(|outcome| (outcome.pathname.as_str(), outcome.result.is_ok()))
        .collect();
    assert_eq!(rendered, vec![("/about", true), ("/docs/intro", true)]);
    assert_eq!(h.backend.calls(), 2);
}

#[tokio::test]
async fn processor_can_be_restarted() {
    let h = harness(Fake::default()).await;
    h.processor.route(glob("/about")).await.expect("route");

    h.processor.stop().await.expect("stop");
    assert!(h.processor.scheduler().is_fatal());
    assert_eq!(*h.processor.pool().health().borrow(), PoolHealth::Stopped);

    h.processor.start().await.expect("restart");
    let page = h.processor.call("/about", waiting()).await.expect("render");
    assert_eq!(page.html, "<p>/about #1</p>");
}
