//! Storage backends.
//!
//! Every backend is a durable map from [`CacheKey`] to gzip bytes plus a
//! last-modified time. Backends only implement [`CacheBackend::lookup`] and
//! [`CacheBackend::store`]; header construction, encoding negotiation and
//! compression live in the provided `serve` / `save` methods so both
//! implementations behave identically on the wire.

mod disk;
mod object_store;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{
    HeaderMap, HeaderValue, StatusCode,
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED},
};
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::info;

pub use disk::DiskBackend;
pub use object_store::{DEFAULT_PREFIX, ObjectStoreBackend, ObjectStoreConfig, StaticCredentials};

use super::compression::{gunzip, gzip_html};
use super::config::{BackendConfig, CacheConfig};
use super::error::CacheError;
use super::http_date;
use super::keys::CacheKey;
use super::stream::{ByteStream, ResponseHead, ResponseSink, pipe};

/// Content type of every served page.
pub const HTML_CONTENT_TYPE: &str = "text/html;charset=UTF-8";

/// Request facts that influence how an entry is served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Client declared gzip in `Accept-Encoding`.
    pub accepts_gzip: bool,
    /// Parsed `If-Modified-Since`, if present and valid.
    pub if_modified_since: Option<OffsetDateTime>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let accepts_gzip = headers
            .get_all(ACCEPT_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(accepts_gzip);
        let if_modified_since = headers
            .get(IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
            .and_then(http_date::parse);

        Self {
            accepts_gzip,
            if_modified_since,
        }
    }
}

/// True if an `Accept-Encoding` value lists gzip with a non-zero quality.
fn accepts_gzip(header: &str) -> bool {
    header.split(',').any(|item| {
        let mut parts = item.split(';').map(str::trim);
        let coding = parts.next().unwrap_or_default();
        if !coding.eq_ignore_ascii_case("gzip") && !coding.eq_ignore_ascii_case("x-gzip") {
            return false;
        }
        parts
            .filter_map(|param| param.strip_prefix("q="))
            .all(|q| q.parse::<f32>().map(|q| q > 0.0).unwrap_or(true))
    })
}

/// An entry located in storage, not yet transferred.
pub struct StoredEntry {
    pub last_modified: OffsetDateTime,
    /// Gzip bytes exactly as stored.
    pub body: ByteStream,
}

/// Result of locating an entry.
pub enum Lookup {
    Entry(StoredEntry),
    /// The store confirmed the client's copy is current.
    NotModified { last_modified: OffsetDateTime },
}

/// What `serve` put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Full {
        last_modified: OffsetDateTime,
        bytes: u64,
    },
    NotModified {
        last_modified: OffsetDateTime,
    },
    /// The client went away before the response was complete.
    Interrupted {
        last_modified: OffsetDateTime,
    },
}

impl Delivery {
    pub fn last_modified(&self) -> OffsetDateTime {
        match self {
            Self::Full { last_modified, .. }
            | Self::NotModified { last_modified }
            | Self::Interrupted { last_modified } => *last_modified,
        }
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Whether the backend honours `If-Modified-Since` and advertises
    /// `Last-Modified` on served entries.
    fn conditional(&self) -> bool {
        false
    }

    /// Locate the entry for `key`. Absence is [`CacheError::NotFound`].
    async fn lookup(&self, key: &CacheKey, request: &RequestContext)
    -> Result<Lookup, CacheError>;

    /// Replace the entry for `key` with `compressed`. Readers must observe
    /// either the previous entry or the complete new one.
    async fn store(&self, key: &CacheKey, compressed: Bytes) -> Result<(), CacheError>;

    /// Serve the entry for `url` into `sink`.
    ///
    /// Nothing is written when the entry is missing. Failures after the head
    /// was committed come back as [`CacheError::PartialResponse`].
    async fn serve(
        &self,
        url: &str,
        request: &RequestContext,
        sink: &mut dyn ResponseSink,
    ) -> Result<Delivery, CacheError> {
        let key = CacheKey::derive(url)?;
        match self.lookup(&key, request).await? {
            Lookup::NotModified { last_modified } => {
                let mut headers = HeaderMap::new();
                insert_last_modified(&mut headers, last_modified);
                let head = ResponseHead {
                    status: StatusCode::NOT_MODIFIED,
                    headers,
                };
                if let Err(err) = sink.send_head(head).await {
                    return interrupted(err, last_modified);
                }
                sink.finish().await.map_err(CacheError::partial)?;
                Ok(Delivery::NotModified { last_modified })
            }
            Lookup::Entry(entry) => deliver(entry, request, self.conditional(), sink).await,
        }
    }

    /// Compress `html` and store it under the key for `url`.
    async fn save(&self, url: &str, html: &str) -> Result<(), CacheError> {
        let key = CacheKey::derive(url)?;
        let compressed = gzip_html(Bytes::copy_from_slice(html.as_bytes())).await?;
        self.store(&key, compressed).await
    }
}

async fn deliver(
    entry: StoredEntry,
    request: &RequestContext,
    advertise_last_modified: bool,
    sink: &mut dyn ResponseSink,
) -> Result<Delivery, CacheError> {
    let StoredEntry {
        last_modified,
        body,
    } = entry;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE));
    if advertise_last_modified {
        insert_last_modified(&mut headers, last_modified);
    }

    let body = if request.accepts_gzip {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        body
    } else {
        gunzip(body)
    };

    let head = ResponseHead {
        status: StatusCode::OK,
        headers,
    };
    if let Err(err) = sink.send_head(head).await {
        return interrupted(err, last_modified);
    }

    match pipe(body, sink).await {
        Ok(bytes) => Ok(Delivery::Full {
            last_modified,
            bytes,
        }),
        Err(err) if err.is_disconnect() => Ok(Delivery::Interrupted { last_modified }),
        Err(err) => {
            sink.abort(&err).await;
            Err(err.partial())
        }
    }
}

fn interrupted(err: CacheError, last_modified: OffsetDateTime) -> Result<Delivery, CacheError> {
    if err.is_disconnect() {
        Ok(Delivery::Interrupted { last_modified })
    } else {
        Err(err)
    }
}

fn insert_last_modified(headers: &mut HeaderMap, last_modified: OffsetDateTime) {
    if let Some(value) = http_date::format(last_modified)
        .and_then(|formatted| HeaderValue::from_str(&formatted).ok())
    {
        headers.insert(LAST_MODIFIED, value);
    }
}

/// Construct the backend selected by configuration.
pub async fn build_backend(config: &CacheConfig) -> Arc<dyn CacheBackend> {
    match &config.backend {
        BackendConfig::Disk { base_dir } => {
            info!(base_dir = %base_dir.display(), "Using disk cache");
            Arc::new(DiskBackend::new(base_dir.clone()))
        }
        BackendConfig::ObjectStore(store) => {
            info!(bucket = %store.bucket, prefix = %store.prefix, "Using S3 cache");
            Arc::new(ObjectStoreBackend::connect(store.clone()).await)
        }
    }
}
