//! Live round trip against a real S3 (or S3-compatible) bucket.
//!
//! - Marked `#[ignore]`; run with `cargo test -- --ignored` once a bucket exists.
//! - Reads `S3_BUCKET_NAME`, plus optional `AWS_REGION`, `S3_ENDPOINT` and
//!   `S3_PREFIX_KEY`. Credentials come from the default AWS provider chain.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, StatusCode, header::IF_MODIFIED_SINCE};
use prerender_cache::cache::{
    CacheBackend, MemorySink, ObjectStoreBackend, ObjectStoreConfig, RequestContext, http_date,
};
use time::OffsetDateTime;
use uuid::Uuid;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn store_config() -> TestResult<ObjectStoreConfig> {
    let bucket = std::env::var("S3_BUCKET_NAME")?;
    let mut config = ObjectStoreConfig::new(bucket);
    config.region = std::env::var("AWS_REGION").ok();
    config.endpoint = std::env::var("S3_ENDPOINT").ok();
    if let Ok(prefix) = std::env::var("S3_PREFIX_KEY") {
        config.prefix = prefix;
    }
    Ok(config)
}

#[tokio::test]
#[ignore]
async fn live_object_store_round_trip_and_conditional_get() -> TestResult<()> {
    let backend = ObjectStoreBackend::connect(store_config()?).await;
    let url = format!("https://live-test.example.com/{}", Uuid::new_v4());
    let html = format!("<html><body>{}</body></html>", "<p>live</p>".repeat(500));

    let before = OffsetDateTime::now_utc() - time::Duration::seconds(5);
    backend.save(&url, &html).await?;

    let mut sink = MemorySink::new();
    let delivery = backend
        .serve(&url, &RequestContext::default(), &mut sink)
        .await?;
    assert!(delivery.last_modified() >= before);
    assert_eq!(sink.head().map(|head| head.status), Some(StatusCode::OK));
    assert_eq!(sink.body(), html.as_bytes());

    // A conditional request at the stored timestamp is answered with 304.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut headers = HeaderMap::new();
    let since = http_date::format(OffsetDateTime::now_utc()).ok_or("unformattable date")?;
    headers.insert(IF_MODIFIED_SINCE, HeaderValue::from_str(&since)?);
    let mut sink = MemorySink::new();
    backend
        .serve(&url, &RequestContext::from_headers(&headers), &mut sink)
        .await?;
    assert_eq!(
        sink.head().map(|head| head.status),
        Some(StatusCode::NOT_MODIFIED)
    );
    assert!(sink.body().is_empty());

    Ok(())
}

#[tokio::test]
#[ignore]
async fn live_object_store_unknown_key_is_not_found() -> TestResult<()> {
    let backend = ObjectStoreBackend::connect(store_config()?).await;
    let url = format!("https://live-test.example.com/missing/{}", Uuid::new_v4());

    let mut sink = MemorySink::new();
    let err = backend
        .serve(&url, &RequestContext::default(), &mut sink)
        .await
        .expect_err("object was never written");
    assert!(err.is_not_found());
    assert!(sink.head().is_none());

    Ok(())
}
