use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use crawlsnap::{
    application::{
        processor::{CallOptions, Processor, ProcessorConfig},
        render::{PassThrough, RenderBackend, RenderError},
        router::RoutePattern,
    },
    cache::{CacheConfig, Clock, ManualClock, MemoryStore, SnapshotCache},
    domain::{RenderArgs, Snapshot},
    infra::pool::{PoolConfig, WorkerPool},
};
use metrics_util::debugging::DebuggingRecorder;
use time::macros::datetime;
use url::Url;

struct Echo;

#[async_trait]
impl RenderBackend for Echo {
    async fn render(&self, args: &RenderArgs) -> Result<Snapshot, RenderError> {
        Ok(Snapshot::new(format!("<body>{}</body>", args.pathname)))
    }
}

#[tokio::test]
async fn render_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 08:00 UTC)));
    let cache = SnapshotCache::with_clock(
        Arc::new(MemoryStore::new()),
        &CacheConfig::with_ttl_seconds(60),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    let pool = WorkerPool::new(PoolConfig {
        workers: 1,
        job_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(1),
        max_restarts: 1,
        restart_backoff: Duration::from_millis(5),
    });
    let processor = Processor::new(
        ProcessorConfig::new(Url::parse("http://origin.test").expect("url")),
        cache,
        pool,
        Arc::new(Echo),
        Arc::new(PassThrough),
    )
    .expect("processor should build");
    processor.start().await.expect("start");
    processor
        .route(RoutePattern::glob("/docs/*").expect("pattern"))
        .await
        .expect("route");

    let waiting = CallOptions {
        wait: true,
        ..CallOptions::default()
    };
    // miss + render, then hit, then stale
    processor
        .call("/docs/a/b", waiting.clone())
        .await
        .expect("render");
    processor
        .call("/docs/a/b", CallOptions::default())
        .await
        .expect("hit");
    clock.advance(time::Duration::seconds(61));
    let stale = processor
        .call("/docs/a/b", CallOptions::default())
        .await
        .expect("stale");
    assert!(stale.stale);
    processor.stop().await.expect("stop");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "crawlsnap_cache_miss_total",
        "crawlsnap_cache_hit_total",
        "crawlsnap_cache_stale_total",
        "crawlsnap_render_ms",
        "crawlsnap_pool_job_ms",
        "crawlsnap_scheduler_active_tasks",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
