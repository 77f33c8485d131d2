use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the prerender-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "prerender-cache",
    version,
    about = "Caching front for a prerender service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PRERENDER_CACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching HTTP service.
    Serve(Box<ServeArgs>),
    /// Print where the cache entry for a URL is stored.
    Locate(LocateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

/// Overrides that decide where entries live.
#[derive(Debug, Args, Default, Clone)]
pub struct StorageOverrides {
    /// Override the cache backend (disk|s3).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub backend: Option<String>,

    /// Override the disk cache root.
    #[arg(long = "cache-base-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub base_dir: Option<PathBuf>,

    /// Override the S3 bucket.
    #[arg(long = "cache-bucket", value_name = "BUCKET")]
    pub bucket: Option<String>,

    /// Override the S3 key prefix.
    #[arg(long = "cache-prefix", value_name = "PREFIX")]
    pub prefix: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub storage: StorageOverrides,

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

    /// Override the freshness window in milliseconds.
    #[arg(long = "cache-ttl-ms", value_name = "MS")]
    pub cache_ttl_ms: Option<u64>,

    /// Override the minimum length of a page worth caching.
    #[arg(long = "cache-min-html-length", value_name = "CHARS")]
    pub cache_min_html_length: Option<usize>,

    /// Override the S3 region.
    #[arg(long = "cache-region", value_name = "REGION")]
    pub cache_region: Option<String>,

    /// Override the S3 endpoint (S3-compatible stores).
    #[arg(long = "cache-endpoint", value_name = "URL")]
    pub cache_endpoint: Option<String>,

    /// Override the S3 storage class for new objects.
    #[arg(long = "cache-storage-class", value_name = "CLASS")]
    pub cache_storage_class: Option<String>,

    /// Override the upstream renderer base URL.
    #[arg(long = "renderer-url", value_name = "URL")]
    pub renderer_url: Option<String>,

    /// Override the upstream renderer timeout.
    #[arg(long = "renderer-timeout-seconds", value_name = "SECONDS")]
    pub renderer_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct LocateArgs {
    #[command(flatten)]
    pub storage: StorageOverrides,

    /// Absolute URL of the page.
    #[arg(value_name = "URL", value_hint = ValueHint::Url)]
    pub url: String,
}
