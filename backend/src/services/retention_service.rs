//! Retention cleanup: keep the newest N artifacts and/or artifacts younger than D days.
//!
//! Both criteria apply; an artifact failing either is deleted. The newest artifact
//! of a database is never deleted by policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::catalog;
use crate::error::{AppError, Result};
use crate::models::{BackupArtifact, DatabaseConnection, StorageTarget};
use crate::storage::StorageBackend;

/// Retention policy for one database on one target. Zero disables a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_last: u32,
    pub keep_days: u32,
}

impl RetentionPolicy {
    /// Policy for `db` on `target`: the remote count applies to object stores and
    /// file shares, the local count to local directories.
    pub fn for_target(db: &DatabaseConnection, target: &StorageTarget) -> Self {
        Self {
            keep_last: if target.is_remote() {
                db.retention_remote
            } else {
                db.retention_local
            },
            keep_days: db.retention_days,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.keep_last == 0 && self.keep_days == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub target_id: String,
    pub kept: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<RetentionFailure>,
    /// Set when the target could not be reached or listed at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RetentionReport {
    pub fn unreachable(target_id: &str, error: &AppError) -> Self {
        Self {
            target_id: target_id.to_string(),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionFailure {
    pub filename: String,
    pub error: String,
}

/// Artifacts `policy` removes. Pure; `artifacts` may be in any order.
pub fn select_for_deletion(
    artifacts: &[BackupArtifact],
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<BackupArtifact> {
    if policy.is_unbounded() || artifacts.is_empty() {
        return Vec::new();
    }
    let mut ordered: Vec<&BackupArtifact> = artifacts.iter().collect();
    ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.filename.cmp(&a.filename)));

    let cutoff = (policy.keep_days > 0).then(|| now - Duration::days(i64::from(policy.keep_days)));
    ordered
        .into_iter()
        .enumerate()
        // index 0 is the newest and always survives
        .skip(1)
        .filter(|(index, artifact)| {
            let over_count = policy.keep_last > 0 && *index >= policy.keep_last as usize;
            let too_old = cutoff.is_some_and(|cutoff| artifact.created_at < cutoff);
            over_count || too_old
        })
        .map(|(_, artifact)| artifact.clone())
        .collect()
}

/// Apply `policy` to the artifacts under `scope`. Individual deletion failures are
/// logged and reported; they do not stop the remaining deletions.
pub async fn apply_policy(
    backend: &dyn StorageBackend,
    target_id: &str,
    scope: &str,
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<RetentionReport> {
    let artifacts = catalog::list_artifacts(backend, target_id, scope).await?;
    let doomed = select_for_deletion(&artifacts, policy, now);
    let mut report = RetentionReport {
        target_id: target_id.to_string(),
        kept: artifacts.len() - doomed.len(),
        ..Default::default()
    };

    for artifact in doomed {
        match catalog::delete_artifact(backend, &artifact.location.key).await {
            Ok(()) => report.deleted.push(artifact.filename),
            Err(e) => {
                tracing::warn!(
                    target = %target_id,
                    key = %artifact.location.key,
                    "Retention could not delete artifact: {}",
                    e
                );
                report.failed.push(RetentionFailure {
                    filename: artifact.filename,
                    error: e.to_string(),
                });
            }
        }
    }

    if !report.deleted.is_empty() || !report.failed.is_empty() {
        tracing::info!(
            target = %target_id,
            scope = %scope,
            kept = report.kept,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Retention cleanup finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArtifactLocation;
    use chrono::TimeZone;

    fn artifact(day: u32) -> BackupArtifact {
        let created_at = Utc.with_ymd_and_hms(2026, 3, day, 2, 0, 0).unwrap();
        let filename = format!("orders_postgres_{}.dump", created_at.format("%Y%m%dT%H%M%SZ"));
        BackupArtifact {
            location: ArtifactLocation::new("local", format!("orders/{}", filename)),
            filename,
            size: 10,
            created_at,
            engine: None,
            tag: None,
            compression: None,
            encrypted: false,
            has_checksum: false,
        }
    }

    fn days(selected: &[BackupArtifact]) -> Vec<u32> {
        use chrono::Datelike;
        let mut d: Vec<u32> = selected.iter().map(|a| a.created_at.day()).collect();
        d.sort();
        d
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_keep_last_three_any_order() {
        let policy = RetentionPolicy { keep_last: 3, keep_days: 0 };
        let shuffled = vec![artifact(4), artifact(1), artifact(6), artifact(2), artifact(5), artifact(3)];
        assert_eq!(days(&select_for_deletion(&shuffled, policy, now())), vec![1, 2, 3]);
    }

    #[test]
    fn test_newest_always_survives() {
        let all = vec![artifact(1), artifact(2)];
        // every criterion would delete everything
        let policy = RetentionPolicy { keep_last: 0, keep_days: 1 };
        assert_eq!(days(&select_for_deletion(&all, policy, now())), vec![1]);
        let single = vec![artifact(1)];
        assert!(select_for_deletion(&single, policy, now()).is_empty());
    }

    #[test]
    fn test_keep_zero_is_unbounded() {
        let all = vec![artifact(1), artifact(2), artifact(3)];
        assert!(select_for_deletion(&all, RetentionPolicy::default(), now()).is_empty());
    }

    #[test]
    fn test_count_and_age_both_apply() {
        let all: Vec<_> = (1..=10).map(artifact).collect();
        // keep 5 newest (6..=10) but also drop anything older than 13 days (day 7 and earlier)
        let policy = RetentionPolicy { keep_last: 5, keep_days: 13 };
        assert_eq!(days(&select_for_deletion(&all, policy, now())), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_policy_for_target() {
        let mut db = crate::providers::test_support::database(crate::models::EngineKind::Mysql);
        db.retention_local = 7;
        db.retention_remote = 30;
        db.retention_days = 90;
        let local = StorageTarget::local("local", "/tmp");
        assert_eq!(RetentionPolicy::for_target(&db, &local), RetentionPolicy { keep_last: 7, keep_days: 90 });
    }

    #[tokio::test]
    async fn test_apply_deletes_with_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let backend = crate::storage::FilesystemStorage::new(dir.path().to_path_buf());
        for day in 1..=5 {
            let a = artifact(day);
            backend.put_bytes(&a.location.key, bytes::Bytes::from_static(b"dump")).await.unwrap();
            catalog::write_checksum(&backend, &a.location.key, &"0".repeat(64)).await.unwrap();
        }

        let policy = RetentionPolicy { keep_last: 3, keep_days: 0 };
        let report = apply_policy(&backend, "local", "orders", policy, now()).await.unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.kept, 3);

        let remaining = backend.list("orders").await.unwrap();
        assert_eq!(remaining.len(), 6, "three artifacts plus three sidecars");

        // running again is a no-op
        let again = apply_policy(&backend, "local", "orders", policy, now()).await.unwrap();
        assert!(again.deleted.is_empty());
    }
}
