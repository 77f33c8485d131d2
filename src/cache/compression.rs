//! Gzip encoding for stored pages and the streaming decode stage used when a
//! client cannot accept gzip.

use std::io::Write;

use async_stream::stream;
use bytes::Bytes;
use flate2::{Compression, write::GzDecoder, write::GzEncoder};
use futures::StreamExt;

use super::error::CacheError;
use super::stream::ByteStream;

/// Compress a rendered page at the default level on the blocking pool.
pub async fn gzip_html(html: Bytes) -> Result<Bytes, CacheError> {
    tokio::task::spawn_blocking(move || gzip_bytes(&html))
        .await
        .map_err(|err| CacheError::Compression(std::io::Error::other(err)))?
}

pub fn gzip_bytes(data: &[u8]) -> Result<Bytes, CacheError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data).map_err(CacheError::Compression)?;
    encoder
        .finish()
        .map(Bytes::from)
        .map_err(CacheError::Compression)
}

/// Decompress a gzip byte stream chunk by chunk.
///
/// Each input chunk yields whatever output the decoder could produce from it,
/// so memory use is bounded by the chunk size and the deflate window.
pub fn gunzip(input: ByteStream) -> ByteStream {
    Box::pin(stream! {
        let mut input = input;
        let mut decoder = GzDecoder::new(Vec::new());

        while let Some(chunk) = input.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            match inflate(&mut decoder, &chunk) {
                Ok(out) => {
                    if !out.is_empty() {
                        yield Ok(out);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }

        match finish(&mut decoder) {
            Ok(out) => {
                if !out.is_empty() {
                    yield Ok(out);
                }
            }
            Err(err) => {
                yield Err(err);
            }
        }
    })
}

fn inflate(decoder: &mut GzDecoder<Vec<u8>>, chunk: &[u8]) -> Result<Bytes, CacheError> {
    decoder.write_all(chunk).map_err(CacheError::Compression)?;
    decoder.flush().map_err(CacheError::Compression)?;
    Ok(Bytes::from(std::mem::take(decoder.get_mut())))
}

fn finish(decoder: &mut GzDecoder<Vec<u8>>) -> Result<Bytes, CacheError> {
    decoder.try_finish().map_err(CacheError::Compression)?;
    Ok(Bytes::from(std::mem::take(decoder.get_mut())))
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn chunked(data: Bytes, size: usize) -> ByteStream {
        let chunks: Vec<Result<Bytes, CacheError>> = data
            .chunks(size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    async fn collect(stream: ByteStream) -> Result<Vec<u8>, CacheError> {
        let mut stream = stream;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn sample_page() -> String {
        let mut html = String::from("<!doctype html><html><body>");
        for i in 0..2_000 {
            html.push_str(&format!("<p>paragraph {i} with some text</p>"));
        }
        html.push_str("</body></html>");
        html
    }

    #[tokio::test]
    async fn gzip_shrinks_repetitive_html() {
        let html = sample_page();
        let compressed = gzip_html(Bytes::from(html.clone()))
            .await
            .expect("compresses");
        assert!(compressed.len() < html.len());
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn gunzip_restores_input_across_tiny_chunks() {
        let html = sample_page();
        let compressed = gzip_bytes(html.as_bytes()).expect("compresses");

        let restored = collect(gunzip(chunked(compressed, 7)))
            .await
            .expect("decodes");
        assert_eq!(restored, html.as_bytes());
    }

    #[tokio::test]
    async fn gunzip_reports_corrupt_input() {
        let garbage = Bytes::from_static(b"this is not gzip at all");
        let err = collect(gunzip(chunked(garbage, 8)))
            .await
            .expect_err("must fail");
        assert!(matches!(err, CacheError::Compression(_)));
    }

    #[tokio::test]
    async fn gunzip_reports_truncated_input() {
        let compressed = gzip_bytes(sample_page().as_bytes()).expect("compresses");
        let truncated = compressed.slice(..compressed.len() / 2);
        let err = collect(gunzip(chunked(truncated, 64)))
            .await
            .expect_err("must fail");
        assert!(matches!(err, CacheError::Compression(_)));
    }

    #[tokio::test]
    async fn gunzip_forwards_upstream_errors() {
        let items: Vec<Result<Bytes, CacheError>> = vec![
            Ok(gzip_bytes(b"hello").expect("compresses").slice(..4)),
            Err(CacheError::transport("connection reset")),
        ];
        let err = collect(gunzip(Box::pin(stream::iter(items))))
            .await
            .expect_err("must fail");
        assert!(matches!(err, CacheError::Transport { .. }));
    }
}
