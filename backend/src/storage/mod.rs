//! Storage backends.
//!
//! Every backend stores opaque byte streams under `/`-separated keys of the form
//! `<database scope>/<file name>`. Writes become visible only once complete.

pub mod filesystem;
pub mod retry;
pub mod s3;
pub mod smb;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

use crate::error::{AppError, Result};
use crate::models::{StorageBackendConfig, StorageTarget};

pub use filesystem::FilesystemStorage;
pub use retry::RetryConfig;
pub use s3::S3Backend;
pub use smb::SmbBackend;

/// Owned byte stream handed to and returned from backends.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Size and modification time of a stored object, reported identically by every backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stream `content` to `key`, returning a human-readable location. A failed or
    /// abandoned write leaves nothing visible at `key`.
    async fn put(&self, key: &str, content: ByteStream) -> Result<String>;

    /// Open the object at `key` for streaming reads.
    async fn get(&self, key: &str) -> Result<ByteStream>;

    /// Objects directly under `scope`, sidecars included.
    async fn list(&self, scope: &str) -> Result<Vec<ObjectMeta>>;

    /// Delete `key`; `NotFound` when it does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Metadata for a single object.
    async fn stat(&self, key: &str) -> Result<ObjectMeta>;

    /// Human-readable root of this backend, free of credentials.
    fn describe(&self) -> String;

    async fn put_bytes(&self, key: &str, content: Bytes) -> Result<String> {
        self.put(key, Box::new(std::io::Cursor::new(content))).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Instantiate the backend for a configured target.
pub async fn open_backend(target: &StorageTarget, spool_dir: &Path) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match &target.backend {
        StorageBackendConfig::Local(cfg) => Arc::new(FilesystemStorage::new(cfg.path.clone())),
        StorageBackendConfig::ObjectStore(cfg) => {
            Arc::new(S3Backend::new(cfg, spool_dir.to_path_buf(), RetryConfig::default()).await?)
        }
        StorageBackendConfig::FileShare(cfg) => Arc::new(SmbBackend::new(
            cfg.clone(),
            spool_dir.to_path_buf(),
            RetryConfig::default(),
        )),
    };
    tracing::debug!(target = %target.id, backend = %backend.describe(), "Opened storage backend");
    Ok(backend)
}

/// Reject keys that could escape the backend root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(AppError::Config(format!("Invalid storage key '{}'", key)));
    }
    Ok(())
}

/// A local temporary file removed when dropped.
pub(crate) struct SpooledFile {
    file: tokio::fs::File,
    _path: tempfile::TempPath,
}

impl SpooledFile {
    pub(crate) async fn open(path: tempfile::TempPath) -> Result<Self> {
        let file = tokio::fs::File::open(&path).await?;
        Ok(Self { file, _path: path })
    }
}

impl AsyncRead for SpooledFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

/// Drain `content` into a fresh temporary file under `dir`.
pub(crate) async fn spool(mut content: ByteStream, dir: &Path) -> Result<(tempfile::TempPath, u64)> {
    tokio::fs::create_dir_all(dir).await?;
    let (file, path) = tempfile::Builder::new()
        .prefix("spool-")
        .tempfile_in(dir)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);
    let size = tokio::io::copy(&mut content, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok((path, size))
}

/// Fresh empty temporary file under `dir` for downloads.
pub(crate) async fn spool_target(dir: &Path) -> Result<tempfile::TempPath> {
    tokio::fs::create_dir_all(dir).await?;
    let (_file, path) = tempfile::Builder::new()
        .prefix("download-")
        .tempfile_in(dir)?
        .into_parts();
    Ok(path)
}
