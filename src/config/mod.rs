//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, num::NonZeroU64, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{CliArgs, Command, LocateArgs, ServeArgs, ServeOverrides, StorageOverrides};

use crate::cache::{
    BackendConfig, BackendKind, DEFAULT_MIN_HTML_LENGTH, DEFAULT_PREFIX, DEFAULT_TTL_MS,
    ObjectStoreConfig, StaticCredentials,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "prerender-cache";
const ENV_PREFIX: &str = "PRERENDER_CACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BASE_DIR: &str = ".";
const DEFAULT_RENDERER_URL: &str = "http://127.0.0.1:3001";
const DEFAULT_RENDERER_TIMEOUT_SECS: u64 = 60;

/// Plain environment variables consulted when the matching cache key is unset.
const ENV_BUCKET: &str = "S3_BUCKET_NAME";
const ENV_REGION: &str = "AWS_REGION";
const ENV_PREFIX_KEY: &str = "S3_PREFIX_KEY";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub renderer: RendererSettings,
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
pub struct CacheSettings {
    pub backend: BackendConfig,
    pub ttl_ms: NonZeroU64,
    pub min_html_length: usize,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub url: Url,
    pub timeout: Duration,
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
        Some(Command::Locate(args)) => raw.apply_storage_overrides(&args.storage),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }
    raw.apply_env_fallbacks(|name| std::env::var(name).ok());

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    renderer: RawRendererSettings,
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
        if let Some(ttl) = overrides.cache_ttl_ms {
            self.cache.ttl_ms = Some(ttl);
        }
        if let Some(length) = overrides.cache_min_html_length {
            self.cache.min_html_length = Some(length);
        }
        if let Some(region) = overrides.cache_region.as_ref() {
            self.cache.region = Some(region.clone());
        }
        if let Some(endpoint) = overrides.cache_endpoint.as_ref() {
            self.cache.endpoint = Some(endpoint.clone());
        }
        if let Some(class) = overrides.cache_storage_class.as_ref() {
            self.cache.storage_class = Some(class.clone());
        }
        if let Some(url) = overrides.renderer_url.as_ref() {
            self.renderer.url = Some(url.clone());
        }
        if let Some(seconds) = overrides.renderer_timeout_seconds {
            self.renderer.timeout_seconds = Some(seconds);
        }

        self.apply_storage_overrides(&overrides.storage);
    }

    fn apply_storage_overrides(&mut self, overrides: &StorageOverrides) {
        if let Some(backend) = overrides.backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(dir) = overrides.base_dir.as_ref() {
            self.cache.base_dir = Some(dir.clone());
        }
        if let Some(bucket) = overrides.bucket.as_ref() {
            self.cache.bucket = Some(bucket.clone());
        }
        if let Some(prefix) = overrides.prefix.as_ref() {
            self.cache.prefix = Some(prefix.clone());
        }
    }

    /// Fill unset bucket, region and prefix from the conventional plain
    /// environment variables.
    fn apply_env_fallbacks(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let cache = &mut self.cache;
        if cache.bucket.is_none() {
            cache.bucket = lookup(ENV_BUCKET);
        }
        if cache.region.is_none() {
            cache.region = lookup(ENV_REGION);
        }
        if cache.prefix.is_none() {
            cache.prefix = lookup(ENV_PREFIX_KEY);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            renderer,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let renderer = build_renderer_settings(renderer)?;

        Ok(Self {
            server,
            logging,
            cache,
            renderer,
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
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let kind = match non_empty(cache.backend) {
        Some(value) => BackendKind::from_str(&value)
            .map_err(|reason| LoadError::invalid("cache.backend", reason))?,
        None => BackendKind::default(),
    };

    let ttl_ms = NonZeroU64::new(cache.ttl_ms.unwrap_or(DEFAULT_TTL_MS))
        .ok_or_else(|| LoadError::invalid("cache.ttl_ms", "must be greater than zero"))?;

    let min_html_length = cache.min_html_length.unwrap_or(DEFAULT_MIN_HTML_LENGTH);

    let backend = match kind {
        BackendKind::Disk => {
            let base_dir = cache
                .base_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
            if base_dir.as_os_str().is_empty() {
                return Err(LoadError::invalid(
                    "cache.base_dir",
                    "path must not be empty",
                ));
            }
            BackendConfig::Disk { base_dir }
        }
        BackendKind::ObjectStore => {
            let bucket = non_empty(cache.bucket).ok_or_else(|| {
                LoadError::invalid(
                    "cache.bucket",
                    format!("required by the s3 backend (or set {ENV_BUCKET})"),
                )
            })?;
            let credentials = match (
                non_empty(cache.access_key_id),
                non_empty(cache.secret_access_key),
            ) {
                (Some(access_key_id), Some(secret_access_key)) => Some(StaticCredentials {
                    access_key_id,
                    secret_access_key,
                }),
                (None, None) => None,
                _ => {
                    return Err(LoadError::invalid(
                        "cache.access_key_id",
                        "access_key_id and secret_access_key must be set together",
                    ));
                }
            };

            ObjectStoreConfig {
                bucket,
                region: non_empty(cache.region),
                prefix: cache.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
                credentials,
                endpoint: non_empty(cache.endpoint),
                storage_class: non_empty(cache.storage_class),
            }
            .into()
        }
    };

    Ok(CacheSettings {
        backend,
        ttl_ms,
        min_html_length,
    })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let raw_url = renderer
        .url
        .unwrap_or_else(|| DEFAULT_RENDERER_URL.to_string());
    let url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("renderer.url", format!("failed to parse: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "renderer.url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = renderer
        .timeout_seconds
        .unwrap_or(DEFAULT_RENDERER_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "renderer.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RendererSettings {
        url,
        timeout: Duration::from_secs(timeout_secs),
    })
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
struct RawCacheSettings {
    #[serde(alias = "cache")]
    backend: Option<String>,
    #[serde(alias = "ttl")]
    ttl_ms: Option<u64>,
    min_html_length: Option<usize>,
    #[serde(alias = "baseDir", alias = "basedir")]
    base_dir: Option<PathBuf>,
    bucket: Option<String>,
    region: Option<String>,
    prefix: Option<String>,
    #[serde(alias = "accessKeyId", alias = "accesskeyid")]
    access_key_id: Option<String>,
    #[serde(alias = "secretAccessKey", alias = "secretaccesskey")]
    secret_access_key: Option<String>,
    endpoint: Option<String>,
    storage_class: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
