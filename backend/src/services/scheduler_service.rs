//! Cron-driven backup scheduling.
//!
//! Each enabled schedule persists its next due time. A tick that finds the due time
//! in the past triggers one backup and moves the due time past `now`, so a window
//! missed while the process was down fires a single catch-up run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config_store::ConfigStore;
use crate::error::{AppError, Result};

/// Parse a cron expression. Five-field (minute-first) expressions get a leading
/// seconds field.
pub fn parse_cron(cron_expr: &str) -> Result<Schedule> {
    let normalized = if cron_expr.split_whitespace().count() == 5 {
        format!("0 {}", cron_expr)
    } else {
        cron_expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| AppError::Config(format!("Invalid cron expression '{}': {}", cron_expr, e)))
}

/// First occurrence strictly after `after`.
pub fn next_run_after(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_cron(cron_expr)?
        .after(&after)
        .next()
        .ok_or_else(|| AppError::Config(format!("Cron expression '{}' never fires again", cron_expr)))
}

/// Starts a backup for a database.
#[async_trait]
pub trait BackupTrigger: Send + Sync {
    async fn trigger_backup(&self, database_id: &str) -> Result<Uuid>;
}

pub struct Scheduler {
    store: Arc<ConfigStore>,
    trigger: Arc<dyn BackupTrigger>,
}

impl Scheduler {
    pub fn new(store: Arc<ConfigStore>, trigger: Arc<dyn BackupTrigger>) -> Self {
        Self { store, trigger }
    }

    /// Evaluate every schedule against `now`; returns the ids that fired.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let schedules = self.store.snapshot().await.schedules;
        let mut fired = Vec::new();

        for entry in schedules.iter().filter(|s| s.enabled) {
            let next = match next_run_after(&entry.cron_expression, now) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(schedule = %entry.id, "Skipping schedule: {}", e);
                    continue;
                }
            };

            match entry.next_run_at {
                None => {
                    tracing::debug!(schedule = %entry.id, next_run = %next, "Schedule armed");
                    self.store.record_schedule(&entry.id, None, Some(next)).await?;
                }
                Some(due) if due <= now => {
                    tracing::info!(
                        schedule = %entry.id,
                        database = %entry.database_id,
                        due = %due,
                        "Executing scheduled backup"
                    );
                    match self.trigger.trigger_backup(&entry.database_id).await {
                        Ok(task_id) => {
                            tracing::info!(schedule = %entry.id, task_id = %task_id, "Scheduled backup started")
                        }
                        Err(e) => tracing::warn!(
                            schedule = %entry.id,
                            database = %entry.database_id,
                            "Scheduled backup could not start: {}",
                            e
                        ),
                    }
                    // the occurrence is consumed whether or not the backup started
                    self.store.record_schedule(&entry.id, Some(now), Some(next)).await?;
                    fired.push(entry.id.clone());
                }
                Some(_) => {}
            }
        }
        Ok(fired)
    }

    /// Tick every `period` until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(period_secs = period.as_secs(), "Backup scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            tracing::warn!("Backup schedule check failed: {}", e);
                        }
                    }
                }
            }
            tracing::info!("Backup scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionParams, DatabaseConnection, EngineKind, ScheduleEntry};
    use crate::services::encryption::CredentialEncryption;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTrigger {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BackupTrigger for RecordingTrigger {
        async fn trigger_backup(&self, database_id: &str) -> Result<Uuid> {
            self.calls.lock().unwrap().push(database_id.to_string());
            Ok(Uuid::new_v4())
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, hour, minute, 0).unwrap()
    }

    async fn scheduler(dir: &std::path::Path) -> (Scheduler, Arc<RecordingTrigger>, Arc<ConfigStore>) {
        let store = Arc::new(
            ConfigStore::open(dir.join("config.json"), dir.join("backups"), CredentialEncryption::new(&[1u8; 32]).unwrap())
                .await
                .unwrap(),
        );
        store
            .update(|doc| {
                doc.databases.push(DatabaseConnection {
                    id: "orders".into(),
                    name: "orders".into(),
                    engine: EngineKind::Postgres,
                    connection: ConnectionParams::default(),
                    retention_local: 0,
                    retention_remote: 0,
                    retention_days: 0,
                    storage_target_ids: Vec::new(),
                });
                doc.schedules.push(ScheduleEntry {
                    id: "nightly".into(),
                    database_id: "orders".into(),
                    cron_expression: "0 2 * * *".into(),
                    enabled: true,
                    next_run_at: None,
                    last_run_at: None,
                });
                Ok(())
            })
            .await
            .unwrap();
        let trigger = Arc::new(RecordingTrigger::default());
        (Scheduler::new(store.clone(), trigger.clone()), trigger, store)
    }

    #[test]
    fn test_five_field_expression_normalized() {
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(parse_cron("30 0 2 * * *").is_ok());
        assert!(matches!(parse_cron("every night"), Err(AppError::Config(_))));
    }

    #[test]
    fn test_next_run_after_just_past_two() {
        let next = next_run_after("0 2 * * *", at(10, 2, 0) + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(next, at(11, 2, 0));
        // strictly after
        assert_eq!(next_run_after("0 2 * * *", at(10, 2, 0)).unwrap(), at(11, 2, 0));
    }

    #[tokio::test]
    async fn test_missed_window_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, trigger, store) = scheduler(dir.path()).await;

        // armed at 01:00 on day 10, process then sleeps until 03:00 on day 12
        assert!(scheduler.tick(at(10, 1, 0)).await.unwrap().is_empty());
        assert_eq!(store.snapshot().await.schedules[0].next_run_at, Some(at(10, 2, 0)));

        assert_eq!(scheduler.tick(at(12, 3, 0)).await.unwrap(), vec!["nightly".to_string()]);
        assert!(scheduler.tick(at(12, 3, 1)).await.unwrap().is_empty());
        assert_eq!(trigger.calls.lock().unwrap().as_slice(), ["orders".to_string()]);

        let entry = store.snapshot().await.schedules[0].clone();
        assert_eq!(entry.last_run_at, Some(at(12, 3, 0)));
        assert_eq!(entry.next_run_at, Some(at(13, 2, 0)));
    }

    #[tokio::test]
    async fn test_edited_expression_rearms() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, trigger, store) = scheduler(dir.path()).await;
        assert!(scheduler.tick(at(10, 1, 0)).await.unwrap().is_empty());
        assert_eq!(store.snapshot().await.schedules[0].next_run_at, Some(at(10, 2, 0)));

        store
            .update(|doc| {
                doc.schedules[0].cron_expression = "30 1 * * *".into();
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.snapshot().await.schedules[0].next_run_at, None);

        // re-armed for 01:30 by the next tick, fires at 01:31, not at the old 02:00
        assert!(scheduler.tick(at(10, 1, 10)).await.unwrap().is_empty());
        assert_eq!(store.snapshot().await.schedules[0].next_run_at, Some(at(10, 1, 30)));
        assert_eq!(scheduler.tick(at(10, 1, 31)).await.unwrap(), vec!["nightly".to_string()]);
        assert!(scheduler.tick(at(10, 2, 0)).await.unwrap().is_empty());
        assert_eq!(trigger.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reenabled_schedule_skips_missed_windows() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, trigger, store) = scheduler(dir.path()).await;
        assert!(scheduler.tick(at(10, 1, 0)).await.unwrap().is_empty());

        store
            .update(|doc| {
                doc.schedules[0].enabled = false;
                Ok(())
            })
            .await
            .unwrap();
        assert!(scheduler.tick(at(15, 3, 0)).await.unwrap().is_empty());
        store
            .update(|doc| {
                doc.schedules[0].enabled = true;
                Ok(())
            })
            .await
            .unwrap();

        assert!(scheduler.tick(at(20, 12, 0)).await.unwrap().is_empty());
        assert_eq!(store.snapshot().await.schedules[0].next_run_at, Some(at(21, 2, 0)));
        assert!(trigger.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_schedule_never_fires() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, trigger, store) = scheduler(dir.path()).await;
        store
            .update(|doc| {
                doc.schedules[0].enabled = false;
                doc.schedules[0].next_run_at = Some(at(1, 2, 0));
                Ok(())
            })
            .await
            .unwrap();
        assert!(scheduler.tick(at(12, 3, 0)).await.unwrap().is_empty());
        assert!(trigger.calls.lock().unwrap().is_empty());
    }
}
