//! Client for the upstream rendering engine.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::cache::RenderedPage;
use crate::config::RendererSettings;

use super::error::InfraError;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid render target `{url}`: {source}")]
    InvalidTarget {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("renderer request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Produces HTML for an absolute page URL.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, page_url: &str) -> Result<RenderedPage, RenderError>;
}

/// Renders by asking a prerender-compatible service for `{base}/{page_url}`.
#[derive(Debug, Clone)]
pub struct UpstreamRenderer {
    client: Client,
    base: Url,
}

impl UpstreamRenderer {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base })
    }

    pub fn from_settings(settings: &RendererSettings) -> Result<Self, InfraError> {
        Self::new(settings.url.clone(), settings.timeout)
    }

    pub fn user_agent() -> &'static str {
        concat!("prerender-cache/", env!("CARGO_PKG_VERSION"))
    }

    fn target(&self, page_url: &str) -> Result<Url, RenderError> {
        let raw = format!("{}/{}", self.base.as_str().trim_end_matches('/'), page_url);
        Url::parse(&raw).map_err(|source| RenderError::InvalidTarget { url: raw, source })
    }
}

#[async_trait]
impl Renderer for UpstreamRenderer {
    async fn render(&self, page_url: &str) -> Result<RenderedPage, RenderError> {
        let target = self.target(page_url)?;
        let response = self.client.get(target).send().await?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let html = response.text().await?;
        Ok(RenderedPage::new(status, html))
    }
}
