//! Moving a database's artifacts from one storage target to another.
//!
//! Each artifact is staged locally (hashing it on the way), checked against its
//! source sidecar, written to the destination, re-read and compared, and only then
//! removed from the source. One failed artifact does not stop the rest.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::mpsc;

use super::catalog;
use super::task_tracker::TaskProgress;
use crate::error::{AppError, Result};
use crate::models::BackupArtifact;
use crate::pipeline::checksum::{hash_stream, stage_to_file};
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Remove each artifact from the source once its copy is verified
    pub delete_source: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            delete_source: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationEstimate {
    pub artifact_count: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovedArtifact {
    pub filename: String,
    pub size: u64,
    pub source_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationFailure {
    pub filename: String,
    pub error: String,
}

/// Per-artifact outcome of a migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub source: String,
    pub destination: String,
    pub moved: Vec<MovedArtifact>,
    pub failed: Vec<MigrationFailure>,
    pub bytes_moved: u64,
}

impl MigrationSummary {
    pub fn total(&self) -> usize {
        self.moved.len() + self.failed.len()
    }
}

/// Two storage targets taking part in a migration.
pub struct MigrationEndpoints<'a> {
    pub source: &'a dyn StorageBackend,
    pub source_id: &'a str,
    pub destination: &'a dyn StorageBackend,
    pub destination_id: &'a str,
}

pub async fn estimate(backend: &dyn StorageBackend, target_id: &str, scope: &str) -> Result<MigrationEstimate> {
    let artifacts = catalog::list_artifacts(backend, target_id, scope).await?;
    Ok(MigrationEstimate {
        artifact_count: artifacts.len(),
        total_bytes: artifacts.iter().map(|a| a.size).sum(),
    })
}

pub async fn migrate_artifacts(
    endpoints: MigrationEndpoints<'_>,
    scope: &str,
    options: MigrationOptions,
    staging_dir: &Path,
    progress: Option<&mpsc::UnboundedSender<TaskProgress>>,
) -> Result<MigrationSummary> {
    if endpoints.source_id == endpoints.destination_id {
        return Err(AppError::Config("Source and destination targets are the same".into()));
    }
    let mut artifacts = catalog::list_artifacts(endpoints.source, endpoints.source_id, scope).await?;
    // oldest first, so an interrupted run leaves the newest backups where retention expects them
    artifacts.reverse();

    let mut summary = MigrationSummary {
        source: endpoints.source_id.to_string(),
        destination: endpoints.destination_id.to_string(),
        ..Default::default()
    };
    let total = artifacts.len();
    tracing::info!(
        scope = %scope,
        source = %endpoints.source_id,
        destination = %endpoints.destination_id,
        artifacts = total,
        "Starting migration"
    );

    for (index, artifact) in artifacts.into_iter().enumerate() {
        if let Some(tx) = progress {
            let pct = (index * 100 / total.max(1)) as u8;
            let _ = tx.send(
                TaskProgress::step("copying", pct)
                    .with_message(format!("{} ({}/{})", artifact.filename, index + 1, total)),
            );
        }
        match copy_one(&endpoints, &artifact, staging_dir).await {
            Ok(size) => {
                let source_deleted = options.delete_source
                    && match catalog::delete_artifact(endpoints.source, &artifact.location.key).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(key = %artifact.location.key, "Copied but could not remove source: {}", e);
                            false
                        }
                    };
                summary.bytes_moved += size;
                summary.moved.push(MovedArtifact {
                    filename: artifact.filename,
                    size,
                    source_deleted,
                });
            }
            Err(e) => {
                tracing::warn!(key = %artifact.location.key, "Migration of artifact failed: {}", e);
                summary.failed.push(MigrationFailure {
                    filename: artifact.filename,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        scope = %scope,
        moved = summary.moved.len(),
        failed = summary.failed.len(),
        bytes = summary.bytes_moved,
        "Migration finished"
    );
    Ok(summary)
}

/// Copy one artifact and its sidecar; the destination holds nothing for it on error.
async fn copy_one(endpoints: &MigrationEndpoints<'_>, artifact: &BackupArtifact, staging_dir: &Path) -> Result<u64> {
    let key = artifact.location.key.as_str();
    let expected = catalog::read_checksum(endpoints.source, key).await?;

    let staged = stage_to_file(endpoints.source.get(key).await?, staging_dir).await?;
    if let Some(record) = &expected {
        if record.digest != staged.checksum.digest {
            return Err(AppError::Integrity(format!(
                "{} does not match its checksum at the source; not copied",
                artifact.filename
            )));
        }
    }

    let file = tokio::fs::File::open(&staged.path).await?;
    endpoints.destination.put(key, Box::new(file)).await?;

    let verified = async {
        let copied = hash_stream(endpoints.destination.get(key).await?).await?;
        if copied != staged.checksum {
            return Err(AppError::Integrity(format!(
                "{} differs at the destination after copy",
                artifact.filename
            )));
        }
        if expected.is_some() {
            catalog::write_checksum(endpoints.destination, key, &staged.checksum.digest).await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = verified {
        if let Err(cleanup) = catalog::delete_artifact(endpoints.destination, key).await {
            tracing::warn!(key = %key, "Could not remove unverified copy: {}", cleanup);
        }
        return Err(e);
    }
    Ok(staged.checksum.size)
}
