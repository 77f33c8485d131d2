//! HTTP surface: `GET /{absolute-url}` answered from the cache or the renderer.

mod error;
mod middleware;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::{
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
        header::{ALLOW, CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware::from_fn,
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use error::{ErrorReport, HttpError};
pub use middleware::{RequestId, log_responses, set_request_id};

use crate::cache::{
    BeforeRender, CacheError, HTML_CONTENT_TYPE, PrerenderHooks, PrerenderRequest,
    channel_sink,
};
use crate::infra::error::InfraError;
use crate::infra::render::Renderer;

/// Body chunks buffered between the storage read and the client.
const BODY_CHANNEL_CAPACITY: usize = 8;

type LookupTask = JoinHandle<(PrerenderRequest, Result<BeforeRender, CacheError>)>;

#[derive(Clone)]
pub struct AppState {
    pub hooks: PrerenderHooks,
    pub renderer: Arc<dyn Renderer>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(prerender)
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_id))
        .with_state(state)
}

async fn prerender(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET {
        let mut response = HttpError::new(
            "infra::http::prerender",
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            format!("{method} is not supported"),
        )
        .into_response();
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }

    let Some(url) = page_url(&uri) else {
        return HttpError::new(
            "infra::http::prerender",
            StatusCode::BAD_REQUEST,
            "Missing page URL",
            format!("request target `{uri}` does not name a page"),
        )
        .into_response();
    };

    let skip_cache = wants_fresh_render(&headers);
    let mut request = PrerenderRequest {
        method,
        url,
        headers,
        skip_cache,
        dont_send: false,
    };

    let (mut sink, pending) = channel_sink(BODY_CHANNEL_CAPACITY);
    let hooks = state.hooks.clone();
    let lookup: LookupTask = tokio::spawn(async move {
        let result = hooks.before_render(&mut request, &mut sink).await;
        (request, result)
    });

    if let Some(response) = pending.into_response().await {
        tokio::spawn(rebuild_after_cached_response(state, lookup));
        return response;
    }

    let (request, result) = match lookup.await {
        Ok(done) => done,
        Err(err) => {
            return HttpError::from_error(
                "infra::http::prerender",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &err,
            )
            .into_response();
        }
    };

    match result {
        Ok(_) => render_and_respond(&state, request).await,
        Err(err) => HttpError::from(err).into_response(),
    }
}

/// Finish the lookup that produced a cached response and, when the entry
/// was stale or broken, render and save a replacement.
async fn rebuild_after_cached_response(state: AppState, lookup: LookupTask) {
    let (request, result) = match lookup.await {
        Ok(done) => done,
        Err(err) => {
            error!(error = %err, "Cache lookup task failed");
            return;
        }
    };

    match result {
        Ok(BeforeRender::Handled) => {}
        Ok(BeforeRender::Render) => {
            info!(url = %request.url, "Rebuilding cache entry in background");
            match state.renderer.render(&request.url).await {
                Ok(page) => {
                    let after = state.hooks.before_send(&request, &page);
                    debug!(url = %request.url, forward = after.forward, "Background render done");
                }
                Err(err) => {
                    warn!(url = %request.url, error = %err, "Background render failed");
                }
            }
        }
        Err(err) => {
            error!(url = %request.url, error = %err, "Cache lookup failed after response started");
        }
    }
}

async fn render_and_respond(state: &AppState, request: PrerenderRequest) -> Response {
    let page = match state.renderer.render(&request.url).await {
        Ok(page) => page,
        Err(err) => return HttpError::from(err).into_response(),
    };

    // `dont_send` is only set once a cached head went out, and that path
    // never reaches here, so the page is always forwarded.
    state.hooks.before_send(&request, &page);

    let mut response = (page.status, page.body_bytes()).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE));
    response
}

/// Absolute page URL addressed by the request target, query included.
fn page_url(uri: &Uri) -> Option<String> {
    let path = uri.path().trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    Some(match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    })
}

fn wants_fresh_render(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"))
}

/// Serve `router` on `addr` until Ctrl-C or SIGTERM, then give in-flight
/// requests up to `grace` to finish.
pub async fn serve(router: Router, addr: SocketAddr, grace: Duration) -> Result<(), InfraError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Listening");
    serve_listener(listener, router, shutdown_signal(), grace).await
}

pub async fn serve_listener<F>(
    listener: TcpListener,
    router: Router,
    signal: F,
    grace: Duration,
) -> Result<(), InfraError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            signal.await;
            let _ = stop_tx.send(true);
        })
        .into_future();
    tokio::pin!(server);

    let deadline = async move {
        if stop_rx.changed().await.is_ok() {
            info!(grace_seconds = grace.as_secs(), "Shutting down");
            tokio::time::sleep(grace).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = &mut server => result.map_err(InfraError::from),
        () = deadline => {
            warn!("Graceful shutdown timed out; dropping open connections");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
