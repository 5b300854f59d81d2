//! End-to-end backup and restore through real subprocesses and the local target.

mod common;

use common::{expected_dump, Harness, DUMP_SCRIPT};
use db_keeper_backend::error::{AppError, ErrorKind};
use db_keeper_backend::models::{ArtifactLocation, CompressionAlgorithm, TaskStatus};
use db_keeper_backend::services::backup_service::{BackupOutcome, RestoreOutcome};
use futures::StreamExt;

fn outcome<T: serde::de::DeserializeOwned>(task: &db_keeper_backend::models::Task) -> T {
    serde_json::from_value(task.result.clone().expect("task result")).unwrap()
}

#[tokio::test]
async fn test_encrypted_backup_restores_byte_identical() {
    let h = Harness::new().await;
    h.set_settings(|s| {
        s.compression.enabled = true;
        s.compression.algorithm = CompressionAlgorithm::Gzip;
        s.encryption.enabled = true;
    })
    .await;

    let id = h.service.backup("orders").await.unwrap();
    let mut updates = h.service.subscribe_task_updates(id).await.unwrap();
    let mut seen = Vec::new();
    while let Some(task) = updates.next().await {
        seen.push(task);
    }
    let task = seen.last().unwrap().clone();
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    assert!(seen.windows(2).all(|w| w[0].percentage <= w[1].percentage));
    assert_eq!(task.percentage, 100);

    let backup: BackupOutcome = outcome(&task);
    assert!(backup.filename.starts_with("orders_postgres_"));
    assert!(backup.filename.ends_with(".sql.gz.enc"));
    assert!(backup.failed_targets.is_empty());
    assert_eq!(backup.locations, vec![ArtifactLocation::new("local", format!("orders/{}", backup.filename))]);

    let stored = std::fs::read(h.backup_dir().join("orders").join(&backup.filename)).unwrap();
    assert!(!String::from_utf8_lossy(&stored).contains("INSERT INTO"));
    let sidecar = std::fs::read_to_string(h.backup_dir().join("orders").join(format!("{}.sha256", backup.filename))).unwrap();
    assert_eq!(sidecar, format!("{}  {}\n", backup.checksum, backup.filename));

    let listed = h.service.list_artifacts("orders", None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].encrypted && listed[0].has_checksum);

    let restore_id = h.service.restore("orders", &backup.locations[0], false).await.unwrap();
    let task = h.service.wait_for_task(restore_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    let restored: RestoreOutcome = outcome(&task);
    assert_eq!(std::fs::read(&h.restored).unwrap(), expected_dump());

    // the safety snapshot is a separate, tagged artifact
    let snapshot = restored.safety_snapshot.expect("safety snapshot");
    assert!(snapshot.filename.contains("_pre-restore."));
    assert!(snapshot.retention.is_empty());
    assert_eq!(h.service.list_artifacts("orders", None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_flipped_byte_fails_with_integrity_error() {
    let h = Harness::new().await;
    let id = h.service.backup("orders").await.unwrap();
    let backup: BackupOutcome = outcome(&h.service.wait_for_task(id).await.unwrap());

    let path = h.backup_dir().join("orders").join(&backup.filename);
    let mut bytes = std::fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    std::fs::write(&path, bytes).unwrap();

    let report = h.service.verify_artifact(&backup.locations[0]).await.unwrap();
    assert!(!report.valid);
    assert!(report.checksum_present);

    let restore_id = h.service.restore("orders", &backup.locations[0], true).await.unwrap();
    let task = h.service.wait_for_task(restore_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().kind, ErrorKind::Integrity);
    assert!(!h.restored.exists(), "restore tool must not have run");
}

#[tokio::test]
async fn test_failed_dump_leaves_no_artifact() {
    let h = Harness::with_dump_script("echo 'partial row'; echo 'could not connect to server' >&2; exit 3").await;
    let id = h.service.backup("orders").await.unwrap();
    let task = h.service.wait_for_task(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ToolExecution);
    assert!(error.message.contains("could not connect to server"));
    assert!(h.local_files("orders").is_empty(), "found {:?}", h.local_files("orders"));
}

#[tokio::test]
async fn test_second_operation_on_busy_database_conflicts() {
    let h = Harness::with_dump_script(&format!("sleep 1; {}", DUMP_SCRIPT)).await;
    let first = h.service.backup("orders").await.unwrap();

    assert!(matches!(h.service.backup("orders").await, Err(AppError::Conflict(_))));
    let location = ArtifactLocation::new("local", "orders/orders_postgres_20260101T000000Z.sql.gz");
    assert!(matches!(
        h.service.restore("orders", &location, true).await,
        Err(AppError::Conflict(_))
    ));
    // other databases are unaffected
    let other = h.service.backup("catalog").await.unwrap();

    let running = h
        .service
        .list_tasks()
        .await
        .into_iter()
        .filter(|t| t.target == "orders")
        .count();
    assert_eq!(running, 1);

    assert_eq!(h.service.wait_for_task(first).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(h.service.wait_for_task(other).await.unwrap().status, TaskStatus::Completed);
    // released as soon as the task finished
    let again = h.service.backup("orders").await.unwrap();
    h.service.wait_for_task(again).await.unwrap();
}

#[tokio::test]
async fn test_directory_dump_round_trip() {
    let h = Harness::new().await;
    let id = h.service.backup("catalog").await.unwrap();
    let task = h.service.wait_for_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    let backup: BackupOutcome = outcome(&task);
    assert!(backup.filename.ends_with(".tar.gz"));

    let restore_id = h.service.restore("catalog", &backup.locations[0], true).await.unwrap();
    let task = h.service.wait_for_task(restore_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    let items = std::fs::read_to_string(h.restored.join("catalog").join("items.bson")).unwrap();
    assert_eq!(items.trim(), "{\"sku\":1}");
}

#[tokio::test]
async fn test_server_side_file_dump_round_trip() {
    let h = Harness::new().await;
    h.set_settings(|s| {
        s.compression.enabled = true;
        s.compression.algorithm = CompressionAlgorithm::Zstd;
        s.encryption.enabled = true;
    })
    .await;

    let id = h.service.backup("ledger").await.unwrap();
    let task = h.service.wait_for_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    let backup: BackupOutcome = outcome(&task);
    assert!(backup.filename.starts_with("ledger_sqlserver_"));
    assert!(backup.filename.ends_with(".bak.zst.enc"));

    let stored = std::fs::read(h.backup_dir().join("ledger").join(&backup.filename)).unwrap();
    assert!(!String::from_utf8_lossy(&stored).contains("INSERT INTO"));
    // the server-side dump file does not outlive the backup
    let staging = h.service.config().staging_dir();
    let leftovers: Vec<_> = std::fs::read_dir(&staging)
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "staging not cleaned: {:?}", leftovers);

    let restore_id = h.service.restore("ledger", &backup.locations[0], true).await.unwrap();
    let task = h.service.wait_for_task(restore_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    assert_eq!(std::fs::read(&h.restored).unwrap(), expected_dump());
}

#[tokio::test]
async fn test_one_failing_target_does_not_fail_backup() {
    let h = Harness::new().await;
    let blocker = h.dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"x").unwrap();
    h.add_local_target("broken", &blocker.join("backups"), "orders").await;

    let id = h.service.backup("orders").await.unwrap();
    let task = h.service.wait_for_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);

    let backup: BackupOutcome = outcome(&task);
    assert_eq!(backup.locations.len(), 1);
    assert_eq!(backup.locations[0].target_id, "local");
    assert_eq!(backup.failed_targets.len(), 1);
    assert_eq!(backup.failed_targets[0].target_id, "broken");
}

#[tokio::test]
async fn test_cancelled_backup_stores_nothing() {
    let h = Harness::with_dump_script(&format!("sleep 5; {}", DUMP_SCRIPT)).await;
    let id = h.service.backup("orders").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    h.service.cancel_task(id).await.unwrap();

    let task = h.service.wait_for_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().kind, ErrorKind::Cancelled);
    assert!(matches!(h.service.cancel_task(id).await, Err(AppError::Conflict(_))));
    assert!(h.local_files("orders").is_empty());
}

#[tokio::test]
async fn test_restore_rejects_foreign_artifact() {
    let h = Harness::new().await;
    let mongo = ArtifactLocation::new("local", "catalog/catalog_mongodb_20260101T000000Z.tar.gz");
    assert!(matches!(h.service.restore("orders", &mongo, true).await, Err(AppError::Config(_))));
    let junk = ArtifactLocation::new("local", "orders/notes.txt");
    assert!(matches!(h.service.restore("orders", &junk, true).await, Err(AppError::Config(_))));
    assert!(matches!(
        h.service.restore("missing", &junk, true).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_connection_probe() {
    let h = Harness::new().await;
    h.service.test_connection("orders").await.unwrap();
    assert!(matches!(h.service.test_connection("nope").await, Err(AppError::NotFound(_))));
}
