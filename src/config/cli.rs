use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the crawlsnap binary.
#[derive(Debug, Parser)]
#[command(
    name = "crawlsnap",
    version,
    about = "Pre-rendered HTML snapshots for crawlers"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CRAWLSNAP_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve snapshots over HTTP.
    Serve(Box<ServeArgs>),
    /// Regenerate every configured route that has a sample pathname.
    Crawl(CrawlArgs),
    /// Render one pathname and print the snapshot.
    Render(RenderPathArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CrawlArgs {
    #[command(flatten)]
    pub overrides: BackendOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RenderPathArgs {
    #[command(flatten)]
    pub overrides: BackendOverrides,

    /// Regenerate even when a fresh snapshot is cached.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,

    /// Pathname to render, e.g. `/blog/first-post`.
    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RendererOverrides {
    /// Override the headless browser command.
    #[arg(long = "renderer-command", value_name = "PATH")]
    pub command: Option<PathBuf>,

    /// Override the user agent the renderer identifies itself with.
    #[arg(long = "renderer-user-agent", value_name = "UA")]
    pub user_agent: Option<String>,
}

/// Overrides shared by every command that renders.
#[derive(Debug, Args, Default, Clone)]
pub struct BackendOverrides {
    #[command(flatten)]
    pub render: RendererOverrides,

    /// Override the origin renders are fetched from.
    #[arg(long = "origin-host", value_name = "URL")]
    pub origin_host: Option<String>,

    /// Override the snapshot store (memory|file).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the file store directory.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub cache_directory: Option<PathBuf>,

    /// Override the number of render workers.
    #[arg(long = "pool-workers", value_name = "COUNT")]
    pub pool_workers: Option<usize>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub backend: BackendOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the snapshot TTL.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS")]
    pub cache_ttl_seconds: Option<u64>,

    /// Override the number of renders allowed in flight.
    #[arg(long = "scheduler-concurrency", value_name = "COUNT")]
    pub scheduler_concurrency: Option<usize>,
}
