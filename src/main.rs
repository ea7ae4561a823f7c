use std::{future::IntoFuture, io::Write, process, sync::Arc, time::Duration};

use crawlsnap::{
    application::{
        error::AppError,
        processor::{CallOptions, Processor, ProcessorConfig},
        render::{CommandRenderer, PassThrough},
    },
    cache::{CacheConfig, FileStore, MemoryStore, SnapshotCache, SnapshotStore},
    config::{self, StoreBackend},
    infra::{
        error::InfraError,
        http::{self, SnapshotState},
        pool::{PoolConfig, WorkerPool},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SOURCE: &str = "crawlsnap::main";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Crawl(_) => run_crawl(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
    }
}

fn build_processor(settings: &config::Settings) -> Result<(Processor, CommandRenderer), AppError> {
    let store: Arc<dyn SnapshotStore> = match settings.cache.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::new(settings.cache.directory.clone())),
    };
    let cache = SnapshotCache::new(store, &CacheConfig::from(&settings.cache));
    let pool = WorkerPool::new(PoolConfig::from(&settings.pool));
    let renderer = CommandRenderer::from_settings(&settings.renderer);

    let processor = Processor::new(
        ProcessorConfig::from(settings),
        cache,
        pool,
        Arc::new(renderer.clone()),
        Arc::new(PassThrough),
    )?;
    Ok((processor, renderer))
}

/// Start the processor and register every configured route.
async fn start_processor(settings: &config::Settings) -> Result<(Processor, CommandRenderer), AppError> {
    let (processor, renderer) = build_processor(settings)?;
    processor.start().await?;
    for pattern in &settings.routes {
        let key = processor.route(pattern.clone()).await?;
        info!(
            target = SOURCE,
            op = "route",
            pattern = %pattern.source(),
            key = %key,
            "Route registered"
        );
    }
    Ok((processor, renderer))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let (processor, renderer) = start_processor(&settings).await?;

    let state = SnapshotState::new(
        processor.clone(),
        settings.http.clone(),
        renderer.user_agent(),
    );
    let router = http::build_router(state);

    let result = serve_http(&settings, router).await;
    let stopped = processor.stop().await;
    result?;
    stopped?;
    Ok(())
}

async fn serve_http(settings: &config::Settings, router: axum::Router) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = SOURCE,
        op = "serve",
        addr = %settings.server.addr,
        "Listening"
    );

    let graceful = settings.server.graceful_shutdown;
    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = drained_tx.send(());
        })
        .into_future();

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::from(InfraError::server(err.to_string())))
        }
        _ = drain_deadline(drained_rx, graceful) => {
            warn!(
                target = SOURCE,
                op = "serve",
                timeout_secs = graceful.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = SOURCE, op = "shutdown", error = %err, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!(target = SOURCE, op = "shutdown", "Shutdown requested");
}

/// Resolves `timeout` after shutdown begins; pending forever until then.
async fn drain_deadline(started: tokio::sync::oneshot::Receiver<()>, timeout: Duration) {
    if started.await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(timeout).await;
}

async fn run_crawl(settings: config::Settings) -> Result<(), AppError> {
    let (processor, _) = start_processor(&settings).await?;

    let report = processor.crawl().await;
    let outcomes = &report.outcomes;
    let mut failed = 0usize;
    for outcome in outcomes {
        match &outcome.result {
            Ok(entry) => info!(
                target = SOURCE,
                op = "crawl",
                result = "ok",
                pattern = %outcome.pattern,
                pathname = %outcome.pathname,
                key = %entry.key,
                "Sample rendered"
            ),
            Err(err) => {
                failed += 1;
                error!(
                    target = SOURCE,
                    op = "crawl",
                    result = "error",
                    pattern = %outcome.pattern,
                    pathname = %outcome.pathname,
                    error = %err,
                    "Sample failed"
                );
            }
        }
    }

    processor.stop().await?;

    info!(
        target = SOURCE,
        op = "crawl",
        rendered = outcomes.len() - failed,
        failed,
        skipped = report.skipped.len(),
        "Crawl finished"
    );
    if failed > 0 {
        return Err(AppError::unexpected(format!(
            "{failed} of {} samples failed to render",
            outcomes.len()
        )));
    }
    Ok(())
}

async fn run_render(
    settings: config::Settings,
    args: config::RenderPathArgs,
) -> Result<(), AppError> {
    let (processor, _) = start_processor(&settings).await?;

    let options = CallOptions {
        force: args.force,
        wait: true,
        ..CallOptions::default()
    };
    let result = processor.call(&args.path, options).await;
    processor.stop().await?;
    let page = result?;

    if page.stale {
        warn!(
            target = SOURCE,
            op = "render",
            pathname = %args.path,
            "Printing a stale snapshot"
        );
    }
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(page.html.as_bytes())
        .and_then(|()| stdout.write_all(b"\n"))
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    Ok(())
}
