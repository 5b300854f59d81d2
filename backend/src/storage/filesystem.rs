//! Filesystem storage backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{validate_key, ByteStream, ObjectMeta, StorageBackend};
use crate::error::{AppError, Result};

const PARTIAL_SUFFIX: &str = ".partial";

/// Filesystem-based storage backend
pub struct FilesystemStorage {
    base_path: PathBuf,
}

impl FilesystemStorage {
    /// Create new filesystem storage
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key
            .split('/')
            .fold(self.base_path.clone(), |path, part| path.join(part)))
    }

    fn meta_from(key: String, metadata: &std::fs::Metadata) -> ObjectMeta {
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        ObjectMeta {
            key,
            size: metadata.len(),
            last_modified,
        }
    }
}

fn not_found_or(key: &str, e: std::io::Error, action: &str) -> AppError {
    if e.kind() == std::io::ErrorKind::NotFound {
        AppError::NotFound(format!("Storage key not found: {}", key))
    } else {
        AppError::storage(format!("Failed to {} {}: {}", action, key, e))
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    async fn put(&self, key: &str, mut content: ByteStream) -> Result<String> {
        let path = self.key_to_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| AppError::Config(format!("Invalid storage key '{}'", key)))?
            .to_path_buf();
        fs::create_dir_all(&parent).await?;

        // Temp file in the same directory so the final rename is atomic; it is
        // removed automatically if this future fails or is dropped.
        let file_name = crate::models::artifact::file_name_of(key).to_string();
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&parent)?;
        let mut file = fs::File::from_std(temp.as_file().try_clone()?);
        tokio::io::copy(&mut content, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        temp.persist(&path)
            .map_err(|e| AppError::storage(format!("Failed to finalize {}: {}", key, e.error)))?;

        tracing::debug!(key = %key, path = %path.display(), "Stored artifact");
        Ok(path.display().to_string())
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let path = self.key_to_path(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or(key, e, "read"))?;
        Ok(Box::new(file))
    }

    async fn list(&self, scope: &str) -> Result<Vec<ObjectMeta>> {
        let dir = self.key_to_path(scope)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::storage(format!("Failed to list {}: {}", scope, e))),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            objects.push(Self::meta_from(format!("{}/{}", scope, name), &metadata));
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or(key, e, "delete"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn stat(&self, key: &str) -> Result<ObjectMeta> {
        let path = self.key_to_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or(key, e, "stat"))?;
        Ok(Self::meta_from(key.to_string(), &metadata))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.base_path.display())
    }
}
