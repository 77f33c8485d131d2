//! Hooks that attach the cache to a render pipeline.
//!
//! [`PrerenderHooks::before_render`] runs ahead of the renderer and may answer
//! the request from storage. [`PrerenderHooks::before_send`] runs after the
//! renderer and hands the page to the gateway for storage.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::debug;

use super::backend::RequestContext;
use super::error::CacheError;
use super::gateway::{CacheGateway, SaveOutcome, ServeOutcome};
use super::stream::ResponseSink;

/// One request travelling through the render pipeline.
#[derive(Debug, Clone)]
pub struct PrerenderRequest {
    pub method: Method,
    /// Absolute URL of the page to render.
    pub url: String,
    pub headers: HeaderMap,
    /// Skip the storage lookup. The render result may still be saved.
    pub skip_cache: bool,
    /// Set once a response went to the client; later steps must not write one.
    pub dont_send: bool,
}

impl PrerenderRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            skip_cache: false,
            dont_send: false,
        }
    }

    /// GET for an `http://` or `https://` URL.
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET && is_http_url(&self.url)
    }
}

fn is_http_url(url: &str) -> bool {
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Output of the renderer as seen by the cache.
///
/// The HTML buffer is shared between the response and the background save.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub status: StatusCode,
    pub html: Arc<str>,
}

impl RenderedPage {
    pub fn new(status: StatusCode, html: impl Into<Arc<str>>) -> Self {
        Self {
            status,
            html: html.into(),
        }
    }

    /// Response body backed by the same buffer as `html`.
    pub fn body_bytes(&self) -> Bytes {
        Bytes::from_owner(SharedHtml(Arc::clone(&self.html)))
    }
}

struct SharedHtml(Arc<str>);

impl AsRef<[u8]> for SharedHtml {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeforeRender {
    /// Answered from storage; skip the renderer.
    Handled,
    /// Run the renderer. Check `dont_send` before responding.
    Render,
}

/// Result of the post-render hook.
#[derive(Debug)]
pub struct AfterRender {
    /// Whether the caller should still write the rendered page to the client.
    pub forward: bool,
    /// Background save, if one was started.
    pub save: Option<JoinHandle<SaveOutcome>>,
}

#[derive(Debug, Clone)]
pub struct PrerenderHooks {
    gateway: CacheGateway,
    ttl: Duration,
}

impl PrerenderHooks {
    pub fn new(gateway: CacheGateway, ttl: Duration) -> Self {
        Self { gateway, ttl }
    }

    pub fn gateway(&self) -> &CacheGateway {
        &self.gateway
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Pre-render hook. May write a cached response into `sink`.
    pub async fn before_render(
        &self,
        request: &mut PrerenderRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<BeforeRender, CacheError> {
        if !request.is_cacheable() {
            debug!(method = %request.method, url = %request.url, "Not a cacheable request");
            return Ok(BeforeRender::Render);
        }
        if request.skip_cache {
            debug!(url = %request.url, "Cache lookup skipped by request");
            return Ok(BeforeRender::Render);
        }

        let context = RequestContext::from_headers(&request.headers);
        let outcome = self
            .gateway
            .try_serve(&request.url, &context, sink, self.ttl)
            .await?;

        request.dont_send = outcome.response_sent();
        Ok(match outcome {
            ServeOutcome::Served => BeforeRender::Handled,
            ServeOutcome::ServedStaleAndRebuild | ServeOutcome::Miss { .. } => {
                BeforeRender::Render
            }
        })
    }

    /// Post-render hook. Starts a background save and tells the caller
    /// whether to forward the rendered page.
    pub fn before_send(&self, request: &PrerenderRequest, page: &RenderedPage) -> AfterRender {
        let forward = !request.dont_send;
        if !request.is_cacheable() {
            return AfterRender {
                forward,
                save: None,
            };
        }

        let gateway = self.gateway.clone();
        let url = request.url.clone();
        let status = page.status;
        let html = Arc::clone(&page.html);
        let save = tokio::spawn(async move { gateway.maybe_save(&url, status, &html).await });

        AfterRender {
            forward,
            save: Some(save),
        }
    }
}
