//! S3 storage backend using rust-s3 crate.
//!
//! Supports AWS S3 and S3-compatible services (MinIO, etc.). Uploads are spooled
//! to a local temp file first so that a transient failure can be retried from the
//! start, then streamed with a multipart upload; memory use stays bounded by the
//! part size. Downloads land in a spool file that is removed once the reader drops.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::retry::RetryConfig;
use super::{spool, spool_target, validate_key, ByteStream, ObjectMeta, SpooledFile, StorageBackend};
use crate::error::{AppError, Result};
use crate::models::storage_target::S3TargetConfig;

/// S3-compatible storage backend
pub struct S3Backend {
    bucket: Box<Bucket>,
    bucket_name: String,
    prefix: Option<String>,
    spool_dir: PathBuf,
    retry: RetryConfig,
}

impl S3Backend {
    /// Create new S3 backend from a target configuration
    pub async fn new(config: &S3TargetConfig, spool_dir: PathBuf, retry: RetryConfig) -> Result<Self> {
        // Static keys when configured, otherwise the default chain:
        // env vars -> ~/.aws/credentials -> container credentials -> instance metadata
        let credentials = match (&config.access_key_id, &config.secret_access_key) {
            (Some(ak), Some(sk)) => Credentials::new(Some(ak.as_str()), Some(sk.as_str()), None, None, None)
                .map_err(|e| AppError::Config(format!("Invalid S3 credentials: {}", e)))?,
            (None, None) => Credentials::default()
                .map_err(|e| AppError::Config(format!("Failed to load AWS credentials: {}", e)))?,
            _ => {
                return Err(AppError::Config(
                    "S3 access_key_id and secret_access_key must be set together".into(),
                ))
            }
        };

        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid S3 region: {}", config.region)))?,
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| AppError::Config(format!("Failed to create S3 bucket: {}", e)))?;

        // Path-style access for MinIO and other custom endpoints
        let bucket = if config.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self {
            bucket,
            bucket_name: config.bucket.clone(),
            prefix: config
                .prefix
                .as_ref()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            spool_dir,
            retry,
        })
    }

    /// Generate the full S3 key with optional prefix
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Strip the prefix from an S3 key
    fn strip_prefix(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => {
                let prefix_with_slash = format!("{}/", prefix);
                key.strip_prefix(&prefix_with_slash)
                    .unwrap_or(key)
                    .to_string()
            }
            None => key.to_string(),
        }
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let full_key = self.full_key(key);
        let full_key = full_key.as_str();
        let bucket = &self.bucket;
        let (head, _status) = self
            .retry
            .run("S3 head", || async move {
                bucket
                    .head_object(full_key)
                    .await
                    .map_err(|e| classify_error(key, "stat", e))
            })
            .await?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: head.content_length.unwrap_or(0).max(0) as u64,
            last_modified: head
                .last_modified
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        })
    }
}

/// Map rust-s3 errors onto the storage taxonomy.
fn classify_error(key: &str, action: &str, err: S3Error) -> AppError {
    let message = format!("Failed to {} '{}': {}", action, key, err);
    match &err {
        S3Error::HttpFailWithBody(404, _) => {
            AppError::NotFound(format!("Storage key not found: {}", key))
        }
        S3Error::HttpFailWithBody(status, _) if *status == 429 || *status >= 500 => {
            AppError::transient(message)
        }
        S3Error::HttpFailWithBody(_, _) => AppError::storage(message),
        _ => {
            let text = err.to_string();
            if text.contains("NoSuchKey") {
                AppError::NotFound(format!("Storage key not found: {}", key))
            } else if text.contains("AccessDenied")
                || text.contains("InvalidAccessKeyId")
                || text.contains("SignatureDoesNotMatch")
                || text.contains("NoSuchBucket")
            {
                AppError::storage(message)
            } else {
                // connection, TLS and body streaming failures
                AppError::transient(message)
            }
        }
    }
}

/// S3 reports RFC 3339 in listings and RFC 2822 in HEAD responses.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn put(&self, key: &str, content: ByteStream) -> Result<String> {
        validate_key(key)?;
        let (spooled, size) = spool(content, &self.spool_dir).await?;
        let full_key = self.full_key(key);
        let full_key_ref = full_key.as_str();
        let spooled_path: &Path = &spooled;
        let bucket = &self.bucket;

        self.retry
            .run("S3 upload", || async move {
                let mut file = tokio::fs::File::open(spooled_path).await?;
                bucket
                    .put_object_stream(&mut file, full_key_ref)
                    .await
                    .map_err(|e| classify_error(key, "put object", e))?;
                Ok(())
            })
            .await?;

        tracing::debug!(key = %key, size, "S3 put object successful");
        Ok(format!("s3://{}/{}", self.bucket_name, full_key))
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        validate_key(key)?;
        let target = spool_target(&self.spool_dir).await?;
        let full_key = self.full_key(key);
        let full_key_ref = full_key.as_str();
        let target_path: &Path = &target;
        let bucket = &self.bucket;

        self.retry
            .run("S3 download", || async move {
                let mut file = tokio::fs::File::create(target_path).await?;
                let status = bucket
                    .get_object_to_writer(full_key_ref, &mut file)
                    .await
                    .map_err(|e| classify_error(key, "get object", e))?;
                if status == 404 {
                    return Err(AppError::NotFound(format!("Storage key not found: {}", key)));
                }
                file.flush().await?;
                Ok(())
            })
            .await?;

        tracing::debug!(key = %key, "S3 get object successful");
        Ok(Box::new(SpooledFile::open(target).await?))
    }

    async fn list(&self, scope: &str) -> Result<Vec<ObjectMeta>> {
        validate_key(scope)?;
        let prefix = format!("{}/", self.full_key(scope));
        let prefix_ref = prefix.as_str();
        let bucket = &self.bucket;

        let results = self
            .retry
            .run("S3 list", || async move {
                bucket
                    .list(prefix_ref.to_string(), Some("/".to_string()))
                    .await
                    .map_err(|e| classify_error(prefix_ref, "list", e))
            })
            .await?;

        let mut objects: Vec<ObjectMeta> = results
            .into_iter()
            .flat_map(|page| page.contents)
            .filter(|obj| obj.key != prefix)
            .map(|obj| ObjectMeta {
                key: self.strip_prefix(&obj.key),
                size: obj.size,
                last_modified: parse_timestamp(&obj.last_modified).unwrap_or_else(Utc::now),
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        // S3 deletes are idempotent; check first so a missing key reports NotFound.
        self.head(key).await?;
        let full_key = self.full_key(key);
        let full_key_ref = full_key.as_str();
        let bucket = &self.bucket;
        self.retry
            .run("S3 delete", || async move {
                bucket
                    .delete_object(full_key_ref)
                    .await
                    .map_err(|e| classify_error(key, "delete object", e))
            })
            .await?;
        tracing::debug!(key = %key, "S3 delete object successful");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn stat(&self, key: &str) -> Result<ObjectMeta> {
        validate_key(key)?;
        self.head(key).await
    }

    fn describe(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket_name, prefix),
            None => format!("s3://{}", self.bucket_name),
        }
    }
}
