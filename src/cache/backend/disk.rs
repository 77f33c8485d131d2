//! Local filesystem backend: `base/host/shard/digest`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_stream::stream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use time::OffsetDateTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CacheBackend, Lookup, RequestContext, StoredEntry};
use crate::cache::error::CacheError;
use crate::cache::keys::CacheKey;
use crate::cache::stream::ByteStream;

const READ_CHUNK: usize = 64 * 1024;

/// Gzip files under a base directory.
///
/// Disk entries never advertise `Last-Modified` and ignore
/// `If-Modified-Since`; freshness still comes from the file mtime.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    base_dir: PathBuf,
}

impl DiskBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[async_trait]
impl CacheBackend for DiskBackend {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn lookup(
        &self,
        key: &CacheKey,
        _request: &RequestContext,
    ) -> Result<Lookup, CacheError> {
        let path = key.disk_path(&self.base_dir);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CacheError::not_found(key.digest()));
            }
            Err(err) => {
                return Err(CacheError::transport_with(
                    format!("failed to open `{}`", path.display()),
                    err,
                ));
            }
        };

        let metadata = file.metadata().await.map_err(|err| {
            CacheError::transport_with(format!("failed to stat `{}`", path.display()), err)
        })?;
        if !metadata.is_file() {
            return Err(CacheError::not_found(key.digest()));
        }
        let modified = metadata.modified().map_err(|err| {
            CacheError::transport_with(format!("no mtime for `{}`", path.display()), err)
        })?;

        Ok(Lookup::Entry(StoredEntry {
            last_modified: OffsetDateTime::from(modified),
            body: read_chunks(file),
        }))
    }

    async fn store(&self, key: &CacheKey, compressed: Bytes) -> Result<(), CacheError> {
        let dir = key.shard_dir(&self.base_dir);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| CacheError::DirectoryCreate {
                path: dir.clone(),
                source,
            })?;

        let target = key.disk_path(&self.base_dir);
        let temp = dir.join(format!("{}.{}.tmp", key.digest(), Uuid::new_v4().simple()));

        if let Err(err) = write_and_rename(&temp, &target, &compressed).await {
            match fs::remove_file(&temp).await {
                Err(cleanup) if cleanup.kind() != ErrorKind::NotFound => {
                    warn!(
                        path = %temp.display(),
                        error = %cleanup,
                        "Failed to remove temporary cache file"
                    );
                }
                _ => {}
            }
            return Err(CacheError::transport_with(
                format!("failed to write `{}`", target.display()),
                err,
            ));
        }

        debug!(path = %target.display(), bytes = compressed.len(), "Wrote cache file");
        Ok(())
    }
}

async fn write_and_rename(temp: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(temp).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp, target).await
}

fn read_chunks(file: File) -> ByteStream {
    Box::pin(stream! {
        let mut file = file;
        loop {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            match file.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => yield Ok(buf.freeze()),
                Err(err) => {
                    yield Err(CacheError::transport_with("cache file read failed", err));
                    break;
                }
            }
        }
    })
}
