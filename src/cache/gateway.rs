//! Cache policy: serve fresh entries, flag stale ones for rebuild, and decide
//! which rendered pages are worth storing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::backend::{CacheBackend, Delivery, RequestContext};
use super::config::{CacheConfig, DEFAULT_MIN_HTML_LENGTH};
use super::error::CacheError;
use super::stream::ResponseSink;

const METRIC_HIT: &str = "prerender_cache_hit_total";
const METRIC_STALE_HIT: &str = "prerender_cache_stale_hit_total";
const METRIC_MISS: &str = "prerender_cache_miss_total";
const METRIC_STORAGE_ERROR: &str = "prerender_cache_storage_error_total";
const METRIC_SAVE: &str = "prerender_cache_save_total";
const METRIC_SAVE_SKIPPED: &str = "prerender_cache_save_skipped_total";
const METRIC_SAVE_FAILED: &str = "prerender_cache_save_failed_total";
const METRIC_CLIENT_DISCONNECT: &str = "prerender_cache_client_disconnect_total";

/// Age class of an entry relative to the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

impl Freshness {
    /// `age <= ttl` is fresh. Timestamps in the future count as age zero.
    pub fn classify(last_modified: OffsetDateTime, now: OffsetDateTime, ttl: Duration) -> Self {
        let age = now - last_modified;
        if age.is_negative() || age.unsigned_abs() <= ttl {
            Self::Fresh
        } else {
            Self::Stale
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// A fresh entry went out in full. Do not render.
    Served,
    /// An expired entry went out. Render and save for the next request, but
    /// do not write another response.
    ServedStaleAndRebuild,
    /// Nothing usable. When `response_committed` is set the storage failed
    /// after the head went out, and the response must not be written again.
    Miss { response_committed: bool },
}

impl ServeOutcome {
    pub fn should_render(self) -> bool {
        !matches!(self, Self::Served)
    }

    /// Whether the client already received (part of) a response.
    pub fn response_sent(self) -> bool {
        match self {
            Self::Served | Self::ServedStaleAndRebuild => true,
            Self::Miss { response_committed } => response_committed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Status(StatusCode),
    TooShort { length: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "status {}", status.as_u16()),
            Self::TooShort { length } => write!(f, "html too short ({length} chars)"),
        }
    }
}

#[derive(Debug)]
pub enum SaveOutcome {
    Stored,
    Skipped(SkipReason),
    Failed(CacheError),
}

impl SaveOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored)
    }
}

#[derive(Clone)]
pub struct CacheGateway {
    backend: Arc<dyn CacheBackend>,
    min_html_length: usize,
    clock: fn() -> OffsetDateTime,
}

impl fmt::Debug for CacheGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheGateway")
            .field("backend", &self.backend.name())
            .field("min_html_length", &self.min_html_length)
            .finish_non_exhaustive()
    }
}

impl CacheGateway {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            min_html_length: DEFAULT_MIN_HTML_LENGTH,
            clock: OffsetDateTime::now_utc,
        }
    }

    pub fn from_config(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self::new(backend).with_min_html_length(config.min_html_length)
    }

    pub fn with_min_html_length(mut self, min_html_length: usize) -> Self {
        self.min_html_length = min_html_length;
        self
    }

    /// Replace the time source used for freshness decisions.
    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Try to answer the request from storage.
    ///
    /// Only key-derivation and compression failures come back as `Err`; every
    /// storage failure degrades to [`ServeOutcome::Miss`]. A client that hangs
    /// up mid-response is not a storage failure: the entry's freshness alone
    /// decides whether it gets rebuilt.
    pub async fn try_serve(
        &self,
        url: &str,
        request: &RequestContext,
        sink: &mut dyn ResponseSink,
        ttl: Duration,
    ) -> Result<ServeOutcome, CacheError> {
        let backend = self.backend.name();

        match self.backend.serve(url, request, sink).await {
            Ok(delivery) => {
                if matches!(delivery, Delivery::Interrupted { .. }) {
                    counter!(METRIC_CLIENT_DISCONNECT, "backend" => backend).increment(1);
                    debug!(url, backend, "Client disconnected during cached response");
                }
                let now = (self.clock)();
                match Freshness::classify(delivery.last_modified(), now, ttl) {
                    Freshness::Fresh => {
                        counter!(METRIC_HIT, "backend" => backend).increment(1);
                        debug!(url, backend, "Served fresh cache entry");
                        Ok(ServeOutcome::Served)
                    }
                    Freshness::Stale => {
                        counter!(METRIC_STALE_HIT, "backend" => backend).increment(1);
                        info!(url, backend, "Served stale cache entry; rebuilding");
                        Ok(ServeOutcome::ServedStaleAndRebuild)
                    }
                }
            }
            Err(err) if err.is_hard_failure() => Err(err),
            Err(err) if err.is_not_found() => {
                counter!(METRIC_MISS, "backend" => backend).increment(1);
                debug!(url, backend, "Cache miss");
                Ok(ServeOutcome::Miss {
                    response_committed: false,
                })
            }
            Err(err) => {
                let response_committed = sink.head_sent();
                counter!(
                    METRIC_STORAGE_ERROR,
                    "backend" => backend,
                    "kind" => err.kind()
                )
                .increment(1);
                counter!(METRIC_MISS, "backend" => backend).increment(1);
                warn!(
                    url,
                    backend,
                    kind = err.kind(),
                    response_committed,
                    error = %err,
                    "Cache read failed; treating as miss"
                );
                Ok(ServeOutcome::Miss { response_committed })
            }
        }
    }

    /// Store `html` if the render succeeded and the page is plausibly complete.
    ///
    /// Failures are logged and reported in the outcome, never raised.
    pub async fn maybe_save(&self, url: &str, status: StatusCode, html: &str) -> SaveOutcome {
        let backend = self.backend.name();

        if let Some(reason) = self.skip_reason(status, html) {
            counter!(METRIC_SAVE_SKIPPED, "backend" => backend).increment(1);
            debug!(url, backend, %reason, "Not caching render");
            return SaveOutcome::Skipped(reason);
        }

        match self.backend.save(url, html).await {
            Ok(()) => {
                counter!(METRIC_SAVE, "backend" => backend).increment(1);
                info!(url, backend, "Cached rendered page");
                SaveOutcome::Stored
            }
            Err(err) => {
                counter!(
                    METRIC_SAVE_FAILED,
                    "backend" => backend,
                    "kind" => err.kind()
                )
                .increment(1);
                error!(url, backend, kind = err.kind(), error = %err, "Failed to cache rendered page");
                SaveOutcome::Failed(err)
            }
        }
    }

    fn skip_reason(&self, status: StatusCode, html: &str) -> Option<SkipReason> {
        if status != StatusCode::OK {
            return Some(SkipReason::Status(status));
        }
        let length = html.chars().count();
        if length <= self.min_html_length {
            return Some(SkipReason::TooShort { length });
        }
        None
    }
}
