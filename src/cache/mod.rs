//! Content-addressed cache for pre-rendered HTML.
//!
//! Pages are keyed by the SHA-1 of their URL and stored gzip-compressed in a
//! [`CacheBackend`] (local disk or S3). The [`CacheGateway`] decides between
//! serving, serving-and-rebuilding and missing; [`PrerenderHooks`] wire the
//! gateway into a render pipeline.
//!
//! ```text
//! request ─▶ before_render ─▶ gateway.try_serve ─▶ backend.serve ─▶ sink
//!                 │ (miss / stale)
//!                 ▼
//!             renderer ─▶ before_send ─▶ gateway.maybe_save ─▶ backend.save
//! ```

mod backend;
mod compression;
mod config;
mod error;
mod gateway;
mod hooks;
pub mod http_date;
mod keys;
mod stream;

pub use backend::{
    CacheBackend, DEFAULT_PREFIX, Delivery, DiskBackend, HTML_CONTENT_TYPE, Lookup,
    ObjectStoreBackend, ObjectStoreConfig, RequestContext, StaticCredentials, StoredEntry,
    build_backend,
};
pub use compression::{gunzip, gzip_bytes, gzip_html};
pub use config::{
    BackendConfig, BackendKind, CacheConfig, DEFAULT_MIN_HTML_LENGTH, DEFAULT_TTL_MS,
};
pub use error::CacheError;
pub use gateway::{CacheGateway, Freshness, SaveOutcome, ServeOutcome, SkipReason};
pub use hooks::{AfterRender, BeforeRender, PrerenderHooks, PrerenderRequest, RenderedPage};
pub use keys::{CacheKey, hash_url};
pub use stream::{
    ByteStream, ChannelSink, MemorySink, PendingResponse, ResponseHead, ResponseSink,
    channel_sink, pipe,
};
