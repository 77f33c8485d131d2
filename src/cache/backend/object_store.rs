//! S3 object store backend: flat keys `prefix/digest`.

use std::fmt;

use async_stream::stream;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream as S3Body, DateTime};
use aws_sdk_s3::types::StorageClass;
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::debug;

use super::{CacheBackend, HTML_CONTENT_TYPE, Lookup, RequestContext, StoredEntry};
use crate::cache::error::CacheError;
use crate::cache::http_date;
use crate::cache::keys::CacheKey;
use crate::cache::stream::ByteStream;

/// Default object key prefix.
pub const DEFAULT_PREFIX: &str = "prerender-ba-cache";

const CREDENTIALS_PROVIDER: &str = "prerender-cache";

/// Static access key pair. Without one the default AWS provider chain is used.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Everything needed to reach the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub prefix: String,
    pub credentials: Option<StaticCredentials>,
    /// Custom endpoint for S3-compatible stores. Enables path-style addressing.
    pub endpoint: Option<String>,
    /// Storage class for new objects, e.g. `REDUCED_REDUNDANCY`.
    pub storage_class: Option<String>,
}

impl ObjectStoreConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            prefix: DEFAULT_PREFIX.to_string(),
            credentials: None,
            endpoint: None,
            storage_class: None,
        }
    }
}

pub struct ObjectStoreBackend {
    client: Client,
    config: ObjectStoreConfig,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreBackend {
    /// Build a client from `config` layered over the default AWS provider chain.
    pub async fn connect(config: ObjectStoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(credentials) = &config.credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                None,
                None,
                CREDENTIALS_PROVIDER,
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::with_client(Client::from_conf(builder.build()), config)
    }

    pub fn with_client(client: Client, config: ObjectStoreConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ObjectStoreConfig {
        &self.config
    }

    fn object_key(&self, key: &CacheKey) -> String {
        key.object_key(&self.config.prefix)
    }
}

#[async_trait]
impl CacheBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn conditional(&self) -> bool {
        true
    }

    async fn lookup(&self, key: &CacheKey, request: &RequestContext) -> Result<Lookup, CacheError> {
        let object_key = self.object_key(key);
        let result = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .set_if_modified_since(request.if_modified_since.map(to_smithy))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let status = err.raw_response().map(|raw| raw.status().as_u16());
                if status == Some(304) {
                    let last_modified = err
                        .raw_response()
                        .and_then(|raw| raw.headers().get("last-modified"))
                        .and_then(http_date::parse)
                        .ok_or_else(|| {
                            CacheError::transport("304 from object store without Last-Modified")
                        })?;
                    return Ok(Lookup::NotModified { last_modified });
                }
                let no_such_key = err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key());
                if no_such_key || status == Some(404) {
                    return Err(CacheError::not_found(object_key));
                }
                return Err(CacheError::transport(format!(
                    "get_object `{object_key}` failed: {}",
                    DisplayErrorContext(&err)
                )));
            }
        };

        let last_modified = output
            .last_modified()
            .and_then(from_smithy)
            .ok_or_else(|| {
                CacheError::transport(format!("object `{object_key}` has no Last-Modified"))
            })?;

        Ok(Lookup::Entry(StoredEntry {
            last_modified,
            body: body_stream(output.body),
        }))
    }

    async fn store(&self, key: &CacheKey, compressed: Bytes) -> Result<(), CacheError> {
        let object_key = self.object_key(key);
        let size = compressed.len();
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .content_type(HTML_CONTENT_TYPE)
            .set_storage_class(self.config.storage_class.as_deref().map(StorageClass::from))
            .body(S3Body::from(compressed))
            .send()
            .await
            .map_err(|err| {
                CacheError::transport(format!(
                    "put_object `{object_key}` failed: {}",
                    DisplayErrorContext(&err)
                ))
            })?;

        debug!(key = %object_key, bytes = size, "Uploaded cache object");
        Ok(())
    }
}

fn body_stream(body: S3Body) -> ByteStream {
    Box::pin(stream! {
        let mut body = body;
        loop {
            match body.try_next().await {
                Ok(Some(chunk)) => yield Ok(chunk),
                Ok(None) => break,
                Err(err) => {
                    yield Err(CacheError::transport_with("object body read failed", err));
                    break;
                }
            }
        }
    })
}

fn to_smithy(value: OffsetDateTime) -> DateTime {
    DateTime::from_secs(value.unix_timestamp())
}

fn from_smithy(value: &DateTime) -> Option<OffsetDateTime> {
    let nanos = i128::from(value.secs()) * 1_000_000_000 + i128::from(value.subsec_nanos());
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_smithy_http_client::test_util::{ReplayEvent, StaticReplayClient};
    use aws_smithy_runtime_api::http::{
        Request as HttpRequest, Response as HttpResponse, StatusCode as HttpStatus,
    };
    use aws_smithy_types::body::SdkBody;
    use axum::http::{
        StatusCode,
        header::{CONTENT_ENCODING, LAST_MODIFIED},
    };
    use time::macros::datetime;

    use crate::cache::backend::Delivery;
    use crate::cache::compression::gzip_bytes;
    use crate::cache::stream::MemorySink;

    const PAGE_URL: &str = "https://example.com/landing";
    const STORED_AT: &str = "Wed, 01 May 2024 12:00:00 GMT";
    const NO_SUCH_KEY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"#;

    fn canned(status: u16, headers: &[(&'static str, &'static str)], body: Bytes) -> HttpResponse {
        let mut response = HttpResponse::new(
            HttpStatus::try_from(status).expect("valid status"),
            SdkBody::from(body),
        );
        for (name, value) in headers {
            response.headers_mut().insert(*name, *value);
        }
        response
    }

    fn replay_backend(response: HttpResponse) -> (ObjectStoreBackend, StaticReplayClient) {
        let replay = StaticReplayClient::new(vec![ReplayEvent::new(
            HttpRequest::new(SdkBody::empty()),
            response,
        )]);
        let conf = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
            .http_client(replay.clone())
            .build();
        let backend =
            ObjectStoreBackend::with_client(Client::from_conf(conf), ObjectStoreConfig::new("pages"));
        (backend, replay)
    }

    #[tokio::test]
    async fn stored_object_is_served_with_last_modified() {
        let html = "<html><body>from s3</body></html>";
        let gzipped = gzip_bytes(html.as_bytes()).expect("compresses");
        let (backend, _) = replay_backend(canned(
            200,
            &[("last-modified", STORED_AT), ("content-type", HTML_CONTENT_TYPE)],
            gzipped,
        ));

        let mut sink = MemorySink::new();
        let delivery = backend
            .serve(PAGE_URL, &RequestContext::default(), &mut sink)
            .await
            .expect("served");

        assert_eq!(delivery.last_modified(), datetime!(2024-05-01 12:00:00 UTC));
        let head = sink.head().expect("head sent");
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers[LAST_MODIFIED], STORED_AT);
        assert!(head.headers.get(CONTENT_ENCODING).is_none());
        assert_eq!(sink.body(), html.as_bytes());
    }

    #[tokio::test]
    async fn object_without_last_modified_is_a_transport_error() {
        let gzipped = gzip_bytes(b"<html></html>").expect("compresses");
        let (backend, _) = replay_backend(canned(200, &[], gzipped));

        let mut sink = MemorySink::new();
        let err = backend
            .serve(PAGE_URL, &RequestContext::default(), &mut sink)
            .await
            .expect_err("missing timestamp");

        assert_eq!(err.kind(), "transport");
        assert!(!err.is_hard_failure());
        assert!(sink.head().is_none());
    }

    #[tokio::test]
    async fn not_modified_carries_only_last_modified() {
        let (backend, replay) = replay_backend(canned(
            304,
            &[("last-modified", STORED_AT)],
            Bytes::new(),
        ));
        let request = RequestContext {
            accepts_gzip: true,
            if_modified_since: Some(datetime!(2024-05-02 00:00:00 UTC)),
        };

        let mut sink = MemorySink::new();
        let delivery = backend
            .serve(PAGE_URL, &request, &mut sink)
            .await
            .expect("served");

        assert_eq!(
            delivery,
            Delivery::NotModified {
                last_modified: datetime!(2024-05-01 12:00:00 UTC)
            }
        );
        let head = sink.head().expect("head sent");
        assert_eq!(head.status, StatusCode::NOT_MODIFIED);
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers[LAST_MODIFIED], STORED_AT);
        assert!(sink.body().is_empty());

        let sent = replay.actual_requests().next().expect("one request");
        assert_eq!(
            sent.headers().get("if-modified-since"),
            Some("Thu, 02 May 2024 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn not_modified_without_last_modified_is_a_transport_error() {
        let (backend, _) = replay_backend(canned(304, &[], Bytes::new()));
        let request = RequestContext {
            accepts_gzip: false,
            if_modified_since: Some(datetime!(2024-05-02 00:00:00 UTC)),
        };

        let mut sink = MemorySink::new();
        let err = backend
            .serve(PAGE_URL, &request, &mut sink)
            .await
            .expect_err("unusable 304");

        assert_eq!(err.kind(), "transport");
        assert!(sink.head().is_none());
    }

    #[tokio::test]
    async fn no_such_key_is_not_found() {
        let (backend, _) = replay_backend(canned(
            404,
            &[("content-type", "application/xml")],
            Bytes::from_static(NO_SUCH_KEY.as_bytes()),
        ));

        let mut sink = MemorySink::new();
        let err = backend
            .serve(PAGE_URL, &RequestContext::default(), &mut sink)
            .await
            .expect_err("missing object");

        assert!(err.is_not_found());
        assert!(sink.head().is_none());
    }

    #[tokio::test]
    async fn bare_404_is_not_found() {
        let (backend, _) = replay_backend(canned(404, &[], Bytes::new()));

        let mut sink = MemorySink::new();
        let err = backend
            .serve(PAGE_URL, &RequestContext::default(), &mut sink)
            .await
            .expect_err("missing object");

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn access_denied_is_a_transport_error() {
        let (backend, _) = replay_backend(canned(403, &[], Bytes::new()));

        let mut sink = MemorySink::new();
        let err = backend
            .serve(PAGE_URL, &RequestContext::default(), &mut sink)
            .await
            .expect_err("forbidden");

        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn smithy_datetime_conversion_preserves_seconds() {
        let value = datetime!(2024-05-01 12:30:15 UTC);
        let smithy = to_smithy(value);
        assert_eq!(smithy.secs(), value.unix_timestamp());
        assert_eq!(from_smithy(&smithy), Some(value));
    }

    #[test]
    fn smithy_datetime_keeps_subsecond_precision() {
        let smithy = DateTime::from_secs_and_nanos(1_700_000_000, 250_000_000);
        let converted = from_smithy(&smithy).expect("in range");
        assert_eq!(converted.unix_timestamp(), 1_700_000_000);
        assert_eq!(converted.nanosecond(), 250_000_000);
    }

    #[test]
    fn config_defaults_prefix() {
        let config = ObjectStoreConfig::new("pages");
        assert_eq!(config.bucket, "pages");
        assert_eq!(config.prefix, DEFAULT_PREFIX);
        assert!(config.credentials.is_none());
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let credentials = StaticCredentials {
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "very-secret".into(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("AKIAEXAMPLE"));
        assert!(!rendered.contains("very-secret"));
    }

    #[test]
    fn object_keys_use_configured_prefix() {
        let config = ObjectStoreConfig {
            prefix: "pages/".into(),
            ..ObjectStoreConfig::new("bucket")
        };
        let backend = ObjectStoreBackend::with_client(
            Client::from_conf(
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(Region::new("us-east-1"))
                    .build(),
            ),
            config,
        );
        let key = CacheKey::derive("https://example.com/").expect("valid url");
        assert_eq!(backend.object_key(&key), format!("pages/{}", key.digest()));
    }
}
