//! Artifact listing, deletion and verification on a single storage target.

use std::collections::HashSet;

use crate::error::{AppError, Result};
use crate::models::artifact::{file_name_of, is_sidecar_key, sidecar_key};
use crate::models::{ArtifactLocation, ArtifactName, BackupArtifact, ChecksumRecord, VerificationReport};
use crate::pipeline::checksum::hash_stream;
use crate::storage::StorageBackend;

/// Backup artifacts stored under `scope`, newest first. Objects whose names do not
/// parse as artifact names are ignored.
pub async fn list_artifacts(
    backend: &dyn StorageBackend,
    target_id: &str,
    scope: &str,
) -> Result<Vec<BackupArtifact>> {
    let objects = backend.list(scope).await?;
    let sidecars: HashSet<&str> = objects
        .iter()
        .filter(|o| is_sidecar_key(&o.key))
        .map(|o| o.key.as_str())
        .collect();

    let mut artifacts: Vec<BackupArtifact> = objects
        .iter()
        .filter(|o| !is_sidecar_key(&o.key))
        .filter_map(|object| {
            let filename = file_name_of(&object.key);
            let name = ArtifactName::parse(filename)?;
            Some(BackupArtifact {
                filename: filename.to_string(),
                location: ArtifactLocation::new(target_id, object.key.clone()),
                size: object.size,
                // the name carries the backup time; mtime changes when an artifact is copied
                created_at: name.timestamp,
                engine: Some(name.engine),
                tag: name.tag,
                compression: name.chain.compression,
                encrypted: name.chain.encrypted,
                has_checksum: sidecars.contains(sidecar_key(&object.key).as_str()),
            })
        })
        .collect();
    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.filename.cmp(&a.filename)));
    Ok(artifacts)
}

/// Delete an artifact and its checksum sidecar.
pub async fn delete_artifact(backend: &dyn StorageBackend, key: &str) -> Result<()> {
    backend.delete(key).await?;
    match backend.delete(&sidecar_key(key)).await {
        Ok(()) | Err(AppError::NotFound(_)) => {}
        Err(e) => tracing::warn!(key = %key, "Artifact deleted but its checksum sidecar was not: {}", e),
    }
    tracing::info!(key = %key, "Deleted artifact");
    Ok(())
}

/// Read the checksum sidecar for `key`, if there is one.
pub async fn read_checksum(backend: &dyn StorageBackend, key: &str) -> Result<Option<ChecksumRecord>> {
    let sidecar = sidecar_key(key);
    let content = match backend.get_bytes(&sidecar).await {
        Ok(content) => content,
        Err(AppError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let text = String::from_utf8_lossy(&content);
    ChecksumRecord::parse(&text)
        .map(Some)
        .ok_or_else(|| AppError::Integrity(format!("Checksum sidecar {} is malformed", sidecar)))
}

/// Write the checksum sidecar for `key`.
pub async fn write_checksum(backend: &dyn StorageBackend, key: &str, digest: &str) -> Result<()> {
    let record = ChecksumRecord::sha256(digest, file_name_of(key));
    backend
        .put_bytes(&sidecar_key(key), bytes::Bytes::from(record.render()))
        .await?;
    Ok(())
}

/// Re-hash a stored artifact and compare it with its sidecar.
pub async fn verify_artifact(
    backend: &dyn StorageBackend,
    location: &ArtifactLocation,
) -> Result<VerificationReport> {
    let meta = backend.stat(&location.key).await?;
    let mut report = VerificationReport {
        location: location.clone(),
        valid: false,
        size: meta.size,
        checksum_present: false,
        expected: None,
        actual: None,
        errors: Vec::new(),
    };

    if ArtifactName::parse(location.filename()).is_none() {
        report.errors.push("file name is not a recognized artifact name".into());
    }
    if meta.size == 0 {
        report.errors.push("artifact is empty".into());
    }

    match read_checksum(backend, &location.key).await {
        Ok(Some(record)) => {
            report.checksum_present = true;
            report.expected = Some(record.digest);
        }
        Ok(None) => {}
        Err(AppError::Integrity(message)) => report.errors.push(message),
        Err(e) => return Err(e),
    }

    let hashed = hash_stream(backend.get(&location.key).await?).await?;
    if hashed.size != meta.size {
        report.errors.push(format!(
            "read {} bytes but the backend reports {}",
            hashed.size, meta.size
        ));
    }
    if let Some(expected) = &report.expected {
        if *expected != hashed.digest {
            report.errors.push("checksum mismatch".into());
        }
    }
    report.actual = Some(hashed.digest);
    report.valid = report.errors.is_empty();

    if report.valid {
        tracing::info!(location = %location, checksum = report.checksum_present, "Artifact verified");
    } else {
        tracing::warn!(location = %location, errors = ?report.errors, "Artifact failed verification");
    }
    Ok(report)
}
