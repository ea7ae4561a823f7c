//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    thread,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::router::RoutePattern;

pub use cli::{
    BackendOverrides, CliArgs, Command, CrawlArgs, RenderPathArgs, RendererOverrides, ServeArgs,
    ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "crawlsnap";
const ENV_PREFIX: &str = "CRAWLSNAP";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ORIGIN_HOST: &str = "http://localhost:3001";
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_CACHE_DIR: &str = "snapshots";
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_RESTARTS: u32 = 5;
const DEFAULT_RESTART_BACKOFF_MS: u64 = 500;
const DEFAULT_SCHEDULER_CONCURRENCY: usize = 4;
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_RECOVERY_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_RENDERER_COMMAND: &str = "crawlsnap-render";
pub(crate) const DEFAULT_RENDERER_USER_AGENT: &str = "crawlsnap";
const DEFAULT_REGENERATE_PARAM: &str = "regenerate";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub origin: OriginSettings,
    pub cache: CacheSettings,
    pub pool: PoolSettings,
    pub scheduler: SchedulerSettings,
    pub renderer: RendererSettings,
    pub http: HttpSettings,
    pub routes: Vec<RoutePattern>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    /// Base URL pathnames are resolved against before rendering.
    pub host: Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            other => Err(format!("unknown store backend `{other}` (expected memory|file)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub backend: StoreBackend,
    /// Directory of the file store; unused by the memory store.
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: NonZeroUsize,
    pub job_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub concurrency: NonZeroUsize,
    pub wait_timeout: Duration,
    pub recovery_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Lower-cased user-agent fragments; empty means every client is served.
    pub crawler_user_agents: Vec<String>,
    pub regenerate_param: String,
    /// Pathname rendered with status 404 for unmatched requests.
    pub not_found_path: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Crawl(args)) => raw.apply_backend_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_backend_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
    pool: RawPoolSettings,
    scheduler: RawSchedulerSettings,
    renderer: RawRendererSettings,
    http: RawHttpSettings,
    routes: Vec<RawRouteSettings>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.cache.ttl_seconds = Some(ttl);
        }
        if let Some(concurrency) = overrides.scheduler_concurrency {
            self.scheduler.concurrency = Some(concurrency);
        }

        self.apply_backend_overrides(&overrides.backend);
    }

    fn apply_backend_overrides(&mut self, overrides: &BackendOverrides) {
        if let Some(host) = overrides.origin_host.as_ref() {
            self.origin.host = Some(host.clone());
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(workers) = overrides.pool_workers {
            self.pool.workers = Some(workers);
        }
        if let Some(command) = overrides.render.command.as_ref() {
            self.renderer.command = Some(command.clone());
        }
        if let Some(user_agent) = overrides.render.user_agent.as_ref() {
            self.renderer.user_agent = Some(user_agent.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            origin,
            cache,
            pool,
            scheduler,
            renderer,
            http,
            routes,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            origin: build_origin_settings(origin)?,
            cache: build_cache_settings(cache)?,
            pool: build_pool_settings(pool)?,
            scheduler: build_scheduler_settings(scheduler)?,
            renderer: build_renderer_settings(renderer)?,
            http: build_http_settings(http)?,
            routes: build_routes(routes)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = positive_duration(graceful_secs, "server.graceful_shutdown_seconds")
        .map(Duration::from_secs)?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let raw_host = origin
        .host
        .unwrap_or_else(|| DEFAULT_ORIGIN_HOST.to_string());
    let host = Url::parse(raw_host.trim())
        .map_err(|err| LoadError::invalid("origin.host", format!("invalid URL: {err}")))?;
    if host.cannot_be_a_base() || !matches!(host.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "origin.host",
            "must be an absolute http(s) URL",
        ));
    }
    Ok(OriginSettings { host })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl_secs = cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    let ttl = positive_duration(ttl_secs, "cache.ttl_seconds").map(Duration::from_secs)?;

    let backend = match cache.backend {
        Some(value) => StoreBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("cache.backend", reason))?,
        None => StoreBackend::Memory,
    };

    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.directory",
            "path must not be empty",
        ));
    }

    Ok(CacheSettings {
        ttl,
        backend,
        directory,
    })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let workers = match pool.workers {
        Some(count) => non_zero_usize(count, "pool.workers")?,
        None => thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
    };
    let job_timeout = positive_duration(
        pool.job_timeout_seconds.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
        "pool.job_timeout_seconds",
    )
    .map(Duration::from_secs)?;
    let startup_timeout = positive_duration(
        pool.startup_timeout_seconds
            .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
        "pool.startup_timeout_seconds",
    )
    .map(Duration::from_secs)?;
    let restart_backoff =
        Duration::from_millis(pool.restart_backoff_ms.unwrap_or(DEFAULT_RESTART_BACKOFF_MS));

    Ok(PoolSettings {
        workers,
        job_timeout,
        startup_timeout,
        max_restarts: pool.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
        restart_backoff,
    })
}

fn build_scheduler_settings(
    scheduler: RawSchedulerSettings,
) -> Result<SchedulerSettings, LoadError> {
    let concurrency = non_zero_usize(
        scheduler
            .concurrency
            .unwrap_or(DEFAULT_SCHEDULER_CONCURRENCY),
        "scheduler.concurrency",
    )?;
    let wait_timeout = positive_duration(
        scheduler
            .wait_timeout_seconds
            .unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS),
        "scheduler.wait_timeout_seconds",
    )
    .map(Duration::from_secs)?;
    let recovery_attempts = scheduler
        .recovery_attempts
        .unwrap_or(DEFAULT_RECOVERY_ATTEMPTS);
    if recovery_attempts == 0 {
        return Err(LoadError::invalid(
            "scheduler.recovery_attempts",
            "must be greater than zero",
        ));
    }

    Ok(SchedulerSettings {
        concurrency,
        wait_timeout,
        recovery_attempts,
    })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let command = renderer
        .command
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_COMMAND));
    if command.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.command",
            "path must not be empty",
        ));
    }

    let user_agent = renderer
        .user_agent
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_RENDERER_USER_AGENT.to_string());
    if user_agent.is_empty() {
        return Err(LoadError::invalid(
            "renderer.user_agent",
            "must not be empty",
        ));
    }

    Ok(RendererSettings {
        command,
        args: renderer.args.unwrap_or_default(),
        user_agent,
    })
}

fn build_http_settings(http: RawHttpSettings) -> Result<HttpSettings, LoadError> {
    let crawler_user_agents = http
        .crawler_user_agents
        .unwrap_or_default()
        .into_iter()
        .map(|agent| agent.trim().to_ascii_lowercase())
        .filter(|agent| !agent.is_empty())
        .collect();

    let regenerate_param = http
        .regenerate_param
        .unwrap_or_else(|| DEFAULT_REGENERATE_PARAM.to_string());
    if regenerate_param.trim().is_empty() {
        return Err(LoadError::invalid(
            "http.regenerate_param",
            "must not be empty",
        ));
    }

    let not_found_path = match http.not_found_path {
        Some(path) if path.trim().is_empty() => None,
        Some(path) if !path.starts_with('/') => {
            return Err(LoadError::invalid(
                "http.not_found_path",
                "must start with `/`",
            ));
        }
        other => other,
    };

    Ok(HttpSettings {
        crawler_user_agents,
        regenerate_param,
        not_found_path,
    })
}

fn build_routes(routes: Vec<RawRouteSettings>) -> Result<Vec<RoutePattern>, LoadError> {
    routes
        .into_iter()
        .map(|route| {
            let pattern = match (route.pattern, route.any_of, route.regex) {
                (Some(glob), None, None) => RoutePattern::glob(&glob),
                (None, Some(globs), None) => RoutePattern::any_of(globs),
                (None, None, Some(expression)) => RoutePattern::regex(&expression),
                _ => {
                    return Err(LoadError::invalid(
                        "routes",
                        "each route needs exactly one of `pattern`, `any_of`, `regex`",
                    ));
                }
            }
            .map_err(|err| LoadError::invalid("routes", err.to_string()))?;

            Ok(match route.sample {
                Some(sample) => pattern.with_sample(sample),
                None => pattern,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    host: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    ttl_seconds: Option<u64>,
    backend: Option<String>,
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    workers: Option<usize>,
    job_timeout_seconds: Option<u64>,
    startup_timeout_seconds: Option<u64>,
    max_restarts: Option<u32>,
    restart_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSchedulerSettings {
    concurrency: Option<usize>,
    wait_timeout_seconds: Option<u64>,
    recovery_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    command: Option<PathBuf>,
    args: Option<Vec<String>>,
    user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHttpSettings {
    crawler_user_agents: Option<Vec<String>>,
    regenerate_param: Option<String>,
    not_found_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRouteSettings {
    pattern: Option<String>,
    any_of: Option<Vec<String>>,
    regex: Option<String>,
    sample: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_duration(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
