//! Error kinds raised by the cache core.

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot derive cache key from `{url}`: {reason}")]
    KeyDerivation { url: String, reason: String },
    #[error("no cache entry for key {key}")]
    NotFound { key: String },
    #[error("storage transport failed: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("gzip transform failed")]
    Compression(#[source] std::io::Error),
    #[error("failed to create shard directory `{}`", path.display())]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The client stopped reading; storage was not at fault.
    #[error("client disconnected: {stage}")]
    Disconnected { stage: &'static str },
    #[error("response was partially sent before the failure")]
    PartialResponse {
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    pub fn key_derivation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KeyDerivation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn disconnected(stage: &'static str) -> Self {
        Self::Disconnected { stage }
    }

    pub fn partial(self) -> Self {
        match self {
            already @ Self::PartialResponse { .. } => already,
            other => Self::PartialResponse {
                source: Box::new(other),
            },
        }
    }

    /// True when the entry simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }

    /// Errors that indicate a configuration or programming defect rather than
    /// an unavailable entry. These are never folded into a cache miss.
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, Self::KeyDerivation { .. } | Self::Compression(_))
    }

    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeyDerivation { .. } => "key_derivation",
            Self::NotFound { .. } => "not_found",
            Self::Transport { .. } => "transport",
            Self::Compression(_) => "compression",
            Self::DirectoryCreate { .. } => "directory_create",
            Self::Disconnected { .. } => "client_disconnected",
            Self::PartialResponse { .. } => "partial_response",
        }
    }
}
