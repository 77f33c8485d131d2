//! Cache configuration: which backend, how long entries stay fresh, and the
//! minimum size of a page worth storing.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::backend::ObjectStoreConfig;

/// Twelve hours.
pub const DEFAULT_TTL_MS: u64 = 12 * 60 * 60 * 1000;
/// Pages must be strictly longer than this to be stored.
pub const DEFAULT_MIN_HTML_LENGTH: usize = 2000;

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Disk,
    ObjectStore,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::ObjectStore => "s3",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disk" | "file" => Ok(Self::Disk),
            "s3" | "object-store" | "object_store" => Ok(Self::ObjectStore),
            other => Err(format!(
                "unknown cache backend `{other}` (expected disk or s3)"
            )),
        }
    }
}

/// Backend selection together with its settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Disk { base_dir: PathBuf },
    ObjectStore(ObjectStoreConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Disk { .. } => BackendKind::Disk,
            Self::ObjectStore(_) => BackendKind::ObjectStore,
        }
    }
}

impl From<ObjectStoreConfig> for BackendConfig {
    fn from(config: ObjectStoreConfig) -> Self {
        Self::ObjectStore(config)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Disk {
            base_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub backend: BackendConfig,
    /// Maximum entry age that still counts as fresh.
    pub ttl: Duration,
    pub min_html_length: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            ttl: Duration::from_millis(DEFAULT_TTL_MS),
            min_html_length: DEFAULT_MIN_HTML_LENGTH,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            backend: settings.backend.clone(),
            ttl: Duration::from_millis(settings.ttl_ms.get()),
            min_html_length: settings.min_html_length,
        }
    }
}
