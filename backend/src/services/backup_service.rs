//! Backup and restore orchestration.
//!
//! `BackupService` is the command surface: every long-running operation is
//! accepted synchronously (validation, exclusivity), then runs as a tracked task.
//! A backup streams tool output through compress/encrypt/checksum into every
//! configured target at once; a restore verifies the artifact before the tool
//! sees a single byte.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::catalog;
use super::config_store::ConfigStore;
use super::config_sync_service::{self, BundleInfo, PullOutcome};
use super::exclusivity::{ExclusivityGuard, ExclusivityRegistry};
use super::migration_service::{self, MigrationEndpoints, MigrationEstimate, MigrationOptions, MigrationSummary};
use super::notification_service::NotificationService;
use super::retention_service::{self, RetentionPolicy, RetentionReport};
use super::scheduler_service::BackupTrigger;
use super::task_tracker::{TaskProgress, TaskTracker};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{
    ArtifactLocation, ArtifactName, BackupArtifact, DatabaseConnection, GlobalSettings, StorageTarget,
    Task, TaskKind, TransformChain, VerificationReport,
};
use crate::pipeline::checksum::stage_to_file;
use crate::pipeline::{
    self, archive, pipe, root_cause, run_blocking, stage_error, Checksummed, EncodePlan, KeyRing,
    PipeWriter, DEFAULT_CAPACITY,
};
use crate::providers::process::{ProgressTx, ToolRun};
use crate::providers::{DumpOutput, ProgressSignal, ProviderRegistry, RestoreInput};
use crate::storage::{open_backend, StorageBackend};

/// Tag on the backup a restore takes of the database it is about to overwrite.
pub const SAFETY_SNAPSHOT_TAG: &str = "pre-restore";

/// Exclusivity key shared by configuration push and pull.
const CONFIG_SYNC_KEY: &str = "configuration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetFailure {
    pub target_id: String,
    pub error: String,
}

/// Result recorded on a completed backup task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub filename: String,
    pub locations: Vec<ArtifactLocation>,
    pub failed_targets: Vec<TargetFailure>,
    pub size: u64,
    pub checksum: String,
    pub retention: Vec<RetentionReport>,
}

/// Result recorded on a completed restore task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub location: ArtifactLocation,
    pub size: u64,
    pub safety_snapshot: Option<BackupOutcome>,
}

type TaskOutput = (String, serde_json::Value);

/// How long a finished task waits for queued progress before its terminal update.
const PROGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle a running task uses to report progress.
#[derive(Clone)]
struct TaskContext {
    id: Uuid,
    tracker: Arc<TaskTracker>,
    forwarders: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskContext {
    fn new(id: Uuid, tracker: Arc<TaskTracker>) -> Self {
        Self {
            id,
            tracker,
            forwarders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn track(&self, forwarder: JoinHandle<()>) {
        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.push(forwarder);
        }
    }

    /// Wait for progress still in flight so no update lands after the terminal one.
    async fn drain(&self) {
        let pending: Vec<JoinHandle<()>> = match self.forwarders.lock() {
            Ok(mut forwarders) => forwarders.drain(..).collect(),
            Err(_) => return,
        };
        if tokio::time::timeout(PROGRESS_DRAIN_TIMEOUT, join_all(pending)).await.is_err() {
            tracing::debug!(task_id = %self.id, "Progress forwarders still running at task end");
        }
    }

    async fn report(&self, update: TaskProgress) {
        if let Err(e) = self.tracker.progress(self.id, update).await {
            tracing::debug!(task_id = %self.id, "Progress update dropped: {}", e);
        }
    }

    async fn step(&self, step: &str, percentage: u8) {
        self.report(TaskProgress::step(step, percentage)).await;
    }

    /// Channel for tool progress, mapped into `from..=to` of the task's percentage.
    fn tool_progress(&self, step: &'static str, from: u8, to: u8) -> ProgressTx {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressSignal>();
        let ctx = self.clone();
        self.track(tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                ctx.report(TaskProgress {
                    step: Some(step.to_string()),
                    percentage: signal.percentage.map(|p| scale(p, from, to)),
                    message: signal.step,
                })
                .await;
            }
        }));
        tx
    }

    /// Channel for service-level progress, mapped into `from..=to`.
    fn scaled(&self, from: u8, to: u8) -> mpsc::UnboundedSender<TaskProgress> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskProgress>();
        let ctx = self.clone();
        self.track(tokio::spawn(async move {
            while let Some(mut update) = rx.recv().await {
                update.percentage = update.percentage.map(|p| scale(p, from, to));
                ctx.report(update).await;
            }
        }));
        tx
    }
}

fn scale(percentage: u8, from: u8, to: u8) -> u8 {
    let span = u16::from(to.saturating_sub(from));
    from + (span * u16::from(percentage.min(100)) / 100) as u8
}

#[derive(Clone)]
pub struct BackupService {
    config: Config,
    store: Arc<ConfigStore>,
    providers: Arc<ProviderRegistry>,
    tracker: Arc<TaskTracker>,
    locks: ExclusivityRegistry,
    notifier: Arc<NotificationService>,
}

impl BackupService {
    pub fn new(config: Config, store: Arc<ConfigStore>, providers: ProviderRegistry) -> Self {
        let tracker = Arc::new(TaskTracker::new(config.task_retention()));
        Self {
            config,
            store,
            providers: Arc::new(providers),
            tracker,
            locks: ExclusivityRegistry::new(),
            notifier: Arc::new(NotificationService::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    fn key_ring(&self, settings: &GlobalSettings) -> KeyRing {
        KeyRing::new(self.store.cipher().key()).with_passphrase(settings.encryption.passphrase.clone())
    }

    fn workdir(&self, prefix: &str) -> Result<tempfile::TempDir> {
        let staging = self.config.staging_dir();
        std::fs::create_dir_all(&staging)?;
        Ok(tempfile::Builder::new().prefix(prefix).tempdir_in(&staging)?)
    }

    /// Run `work` as task `task`. The guard is released before the terminal update
    /// is published, so a caller woken by it can immediately start the next operation.
    fn spawn_task<F, Fut>(&self, task: Task, guard: ExclusivityGuard, notify: Option<GlobalSettings>, work: F)
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<TaskOutput>> + Send + 'static,
    {
        let tracker = self.tracker.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let id = task.id;
            let outcome = match tracker.cancellation(id).await {
                Ok(cancel) => match tracker.start(id).await {
                    Ok(_) => {
                        let ctx = TaskContext::new(id, tracker.clone());
                        let result = tokio::select! {
                            result = work(ctx.clone()) => result,
                            _ = cancel.cancelled() => Err(AppError::Cancelled(format!(
                                "{} of '{}' cancelled by request",
                                task.kind, task.target
                            ))),
                        };
                        ctx.drain().await;
                        result
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            drop(guard);

            let finished = match outcome {
                Ok((message, result)) => tracker.complete(id, message, Some(result)).await,
                Err(e) => tracker.fail(id, &e).await,
            };
            match finished {
                Ok(task) => {
                    if let Some(settings) = notify {
                        notifier.notify(&settings.notifications, &task).await;
                    }
                }
                Err(e) => tracing::debug!(task_id = %id, "Task outcome not recorded: {}", e),
            }
            tracker.prune(Utc::now()).await;
        });
    }

    // --- backup -----------------------------------------------------------

    /// Start a backup of `database_id` to all of its targets.
    pub async fn backup(&self, database_id: &str) -> Result<Uuid> {
        let db = self.store.database(database_id).await?;
        self.providers.get(db.engine)?.validate(&db)?;
        let targets = self.store.targets_for(&db).await?;
        let guard = self.locks.acquire_database(&db.id, "backup")?;
        let settings = self.store.settings().await;

        let task = self.tracker.create(TaskKind::Backup, &db.id).await;
        let id = task.id;
        let this = self.clone();
        self.spawn_task(task, guard, Some(settings.clone()), move |ctx| async move {
            let outcome = this.execute_backup(&ctx, &db, &settings, &targets, None, (5, 90)).await?;
            let message = format!(
                "Backed up '{}' to {} target(s) as {}",
                db.id,
                outcome.locations.len(),
                outcome.filename
            );
            Ok((message, serde_json::to_value(&outcome)?))
        });
        Ok(id)
    }

    /// Dump `db` into every target. Succeeds when at least one target holds a
    /// complete artifact (and sidecar, when checksums are on). Retention runs
    /// only for untagged backups.
    async fn execute_backup(
        &self,
        ctx: &TaskContext,
        db: &DatabaseConnection,
        settings: &GlobalSettings,
        targets: &[StorageTarget],
        tag: Option<&str>,
        (from, to): (u8, u8),
    ) -> Result<BackupOutcome> {
        let adapter = self.providers.get(db.engine)?;
        let plan = EncodePlan::from_settings(settings);
        let staging = self.config.staging_dir();
        let workdir = self.workdir("backup-")?;
        let dump = adapter.build_dump_command(db, workdir.path())?;

        let mut name = ArtifactName::new(&db.name, db.engine, Utc::now(), &dump.base_extension, plan.chain());
        if let Some(tag) = tag {
            name = name.with_tag(tag);
        }
        let filename = name.filename();
        let key = format!("{}/{}", db.scope(), filename);

        let mut failed_targets = Vec::new();
        let mut backends = Vec::new();
        let mut first_error = None;
        for target in targets {
            match open_backend(target, &staging).await {
                Ok(backend) => backends.push((target.clone(), backend)),
                Err(e) => {
                    tracing::warn!(target = %target.id, "Storage target unavailable: {}", e);
                    failed_targets.push(TargetFailure {
                        target_id: target.id.clone(),
                        error: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
            }
        }
        if backends.is_empty() {
            return Err(first_error.unwrap_or_else(|| AppError::Config(format!("'{}' has no storage targets", db.id))));
        }

        let dump_end = scale(75, from, to);
        ctx.step("dumping", from).await;
        let tool = ToolRun {
            command: &dump.command,
            adapter: adapter.clone(),
            progress: Some(ctx.tool_progress("dumping", from, dump_end)),
            timeout: self.config.dump_timeout(),
        };
        let streamed = stream_dump(&tool, &dump.output, plan, self.key_ring(settings), &key, &backends).await;
        if let DumpOutput::File(path) = &dump.output {
            if !path.starts_with(workdir.path()) {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
        let (checksum, uploads) = streamed?;

        ctx.step("finalizing", dump_end).await;
        let mut stored = Vec::new();
        for ((target, backend), upload) in backends.into_iter().zip(uploads) {
            let result = match upload {
                Ok(_) if settings.checksum_enabled => {
                    match catalog::write_checksum(&*backend, &key, &checksum.digest).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            if let Err(cleanup) = backend.delete(&key).await {
                                tracing::warn!(target = %target.id, key = %key, "Could not remove artifact without checksum: {}", cleanup);
                            }
                            Err(e)
                        }
                    }
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => stored.push((target, backend)),
                Err(e) => {
                    tracing::warn!(target = %target.id, key = %key, "Backup not stored on target: {}", e);
                    failed_targets.push(TargetFailure {
                        target_id: target.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        if stored.is_empty() {
            let detail = failed_targets
                .iter()
                .map(|f| format!("{}: {}", f.target_id, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AppError::storage(format!("No target stored {}: {}", filename, detail)));
        }

        let mut retention = Vec::new();
        if tag.is_none() {
            ctx.step("retention", to.saturating_sub(5)).await;
            for (target, backend) in &stored {
                let policy = RetentionPolicy::for_target(db, target);
                if policy.is_unbounded() {
                    continue;
                }
                match retention_service::apply_policy(&**backend, &target.id, &db.scope(), policy, Utc::now()).await {
                    Ok(report) => retention.push(report),
                    Err(e) => tracing::warn!(target = %target.id, "Retention after backup failed: {}", e),
                }
            }
        }

        let locations: Vec<ArtifactLocation> = stored
            .iter()
            .map(|(target, _)| ArtifactLocation::new(target.id.clone(), key.clone()))
            .collect();
        tracing::info!(
            database = %db.id,
            artifact = %filename,
            size = checksum.size,
            targets = locations.len(),
            failed_targets = failed_targets.len(),
            "Backup stored"
        );
        Ok(BackupOutcome {
            filename,
            locations,
            failed_targets,
            size: checksum.size,
            checksum: checksum.digest,
            retention,
        })
    }

    // --- restore ----------------------------------------------------------

    /// Start a restore of `location` into `database_id`. Unless skipped, the
    /// current database is backed up first under the `pre-restore` tag.
    pub async fn restore(
        &self,
        database_id: &str,
        location: &ArtifactLocation,
        skip_safety_snapshot: bool,
    ) -> Result<Uuid> {
        let db = self.store.database(database_id).await?;
        self.providers.get(db.engine)?.validate(&db)?;
        let name = ArtifactName::parse(location.filename())
            .ok_or_else(|| AppError::Config(format!("'{}' is not a backup artifact", location.filename())))?;
        if name.engine != db.engine {
            return Err(AppError::Config(format!(
                "{} is a {} backup; '{}' is a {} database",
                location.filename(),
                name.engine,
                db.id,
                db.engine
            )));
        }
        let source = self.store.target(&location.target_id).await?;
        let targets = self.store.targets_for(&db).await?;
        let guard = self.locks.acquire_database(&db.id, "restore")?;
        let settings = self.store.settings().await;

        let task = self.tracker.create(TaskKind::Restore, &db.id).await;
        let id = task.id;
        let this = self.clone();
        let location = location.clone();
        self.spawn_task(task, guard, Some(settings.clone()), move |ctx| async move {
            let snapshot = if skip_safety_snapshot {
                None
            } else {
                ctx.step("safety snapshot", 2).await;
                Some(
                    this.execute_backup(&ctx, &db, &settings, &targets, Some(SAFETY_SNAPSHOT_TAG), (2, 35))
                        .await?,
                )
            };
            let size = this.execute_restore(&ctx, &db, &settings, &source, &location, &name).await?;
            let outcome = RestoreOutcome {
                location,
                size,
                safety_snapshot: snapshot,
            };
            let message = format!("Restored '{}' from {}", db.id, outcome.location);
            Ok((message, serde_json::to_value(&outcome)?))
        });
        Ok(id)
    }

    async fn execute_restore(
        &self,
        ctx: &TaskContext,
        db: &DatabaseConnection,
        settings: &GlobalSettings,
        source: &StorageTarget,
        location: &ArtifactLocation,
        name: &ArtifactName,
    ) -> Result<u64> {
        ctx.step("downloading", 40).await;
        let staging = self.config.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;
        let backend = open_backend(source, &staging).await?;
        let staged = stage_to_file(backend.get(&location.key).await?, &staging).await?;
        check_staged(&*backend, location, &staged.checksum).await?;

        ctx.step("restoring", 50).await;
        let adapter = self.providers.get(db.engine)?;
        let workdir = self.workdir("restore-")?;
        let plan = adapter.build_restore_command(db, &name.base_extension, workdir.path())?;
        let tool = ToolRun {
            command: &plan.command,
            adapter,
            progress: Some(ctx.tool_progress("restoring", 50, 95)),
            timeout: self.config.restore_timeout(),
        };
        feed_restore(&tool, &plan.input, name.chain, self.key_ring(settings), staged.path.to_path_buf()).await?;

        tracing::info!(database = %db.id, artifact = %location, size = staged.checksum.size, "Restore finished");
        Ok(staged.checksum.size)
    }

    // --- migration --------------------------------------------------------

    /// Start moving `database_id`'s artifacts from one target to another.
    pub async fn migrate(
        &self,
        database_id: &str,
        from_target: &str,
        to_target: &str,
        options: MigrationOptions,
    ) -> Result<Uuid> {
        let db = self.store.database(database_id).await?;
        if from_target == to_target {
            return Err(AppError::Config("Source and destination targets are the same".into()));
        }
        let source = self.store.target(from_target).await?;
        let destination = self.store.target(to_target).await?;
        let guard = self.locks.acquire_database(&db.id, "migration")?;

        let task = self.tracker.create(TaskKind::Migrate, &db.id).await;
        let id = task.id;
        let this = self.clone();
        self.spawn_task(task, guard, None, move |ctx| async move {
            let summary = this.execute_migration(&ctx, &db, &source, &destination, options).await?;
            let message = format!(
                "Moved {} of {} artifact(s) from '{}' to '{}'",
                summary.moved.len(),
                summary.total(),
                summary.source,
                summary.destination
            );
            Ok((message, serde_json::to_value(&summary)?))
        });
        Ok(id)
    }

    async fn execute_migration(
        &self,
        ctx: &TaskContext,
        db: &DatabaseConnection,
        source: &StorageTarget,
        destination: &StorageTarget,
        options: MigrationOptions,
    ) -> Result<MigrationSummary> {
        ctx.step("listing", 2).await;
        let staging = self.config.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;
        let from = open_backend(source, &staging).await?;
        let to = open_backend(destination, &staging).await?;
        let progress = ctx.scaled(5, 95);
        let summary = migration_service::migrate_artifacts(
            MigrationEndpoints {
                source: &*from,
                source_id: &source.id,
                destination: &*to,
                destination_id: &destination.id,
            },
            &db.scope(),
            options,
            &staging,
            Some(&progress),
        )
        .await?;

        if summary.moved.is_empty() {
            if let Some(first) = summary.failed.first() {
                return Err(AppError::storage(format!(
                    "None of {} artifact(s) could be migrated; {}: {}",
                    summary.failed.len(),
                    first.filename,
                    first.error
                )));
            }
        }
        Ok(summary)
    }

    pub async fn estimate_migration(&self, database_id: &str, from_target: &str) -> Result<MigrationEstimate> {
        let db = self.store.database(database_id).await?;
        let target = self.store.target(from_target).await?;
        let backend = open_backend(&target, &self.config.staging_dir()).await?;
        migration_service::estimate(&*backend, &target.id, &db.scope()).await
    }

    // --- synchronous commands ---------------------------------------------

    /// Run the engine's connectivity probe.
    pub async fn test_connection(&self, database_id: &str) -> Result<()> {
        let db = self.store.database(database_id).await?;
        let adapter = self.providers.get(db.engine)?;
        adapter.validate(&db)?;
        let workdir = self.workdir("probe-")?;
        let command = adapter.build_test_command(&db, workdir.path())?;
        ToolRun {
            command: &command,
            adapter,
            progress: None,
            timeout: self.config.connection_timeout(),
        }
        .run(false)
        .await?;
        tracing::info!(database = %db.id, "Connection test succeeded");
        Ok(())
    }

    /// Artifacts of `database_id` on every target (or just `target_id`), newest first.
    /// Unreachable targets are skipped when listing all of them.
    pub async fn list_artifacts(&self, database_id: &str, target_id: Option<&str>) -> Result<Vec<BackupArtifact>> {
        let db = self.store.database(database_id).await?;
        let staging = self.config.staging_dir();
        let targets = match target_id {
            Some(id) => vec![self.store.target(id).await?],
            None => self.store.targets_for(&db).await?,
        };

        let mut artifacts = Vec::new();
        for target in &targets {
            let listed = async {
                let backend = open_backend(target, &staging).await?;
                catalog::list_artifacts(&*backend, &target.id, &db.scope()).await
            }
            .await;
            match listed {
                Ok(found) => artifacts.extend(found),
                Err(e) if target_id.is_none() => {
                    tracing::warn!(target = %target.id, "Skipping unreachable target: {}", e)
                }
                Err(e) => return Err(e),
            }
        }
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(artifacts)
    }

    pub async fn delete_artifact(&self, location: &ArtifactLocation) -> Result<()> {
        let target = self.store.target(&location.target_id).await?;
        let backend = open_backend(&target, &self.config.staging_dir()).await?;
        if !backend.exists(&location.key).await? {
            return Err(AppError::NotFound(format!("Artifact {} not found", location)));
        }
        catalog::delete_artifact(&*backend, &location.key).await?;
        tracing::info!(artifact = %location, "Artifact deleted");
        Ok(())
    }

    pub async fn verify_artifact(&self, location: &ArtifactLocation) -> Result<VerificationReport> {
        let target = self.store.target(&location.target_id).await?;
        let backend = open_backend(&target, &self.config.staging_dir()).await?;
        catalog::verify_artifact(&*backend, location).await
    }

    /// Apply retention for `database_id` now, on one target or all of its targets.
    /// Across all targets an unreachable one is reported and skipped; a single
    /// requested target propagates its error.
    pub async fn cleanup(&self, database_id: &str, target_id: Option<&str>) -> Result<Vec<RetentionReport>> {
        let db = self.store.database(database_id).await?;
        let _guard = self.locks.acquire_database(&db.id, "cleanup")?;
        let targets = match target_id {
            Some(id) => vec![self.store.target(id).await?],
            None => self.store.targets_for(&db).await?,
        };

        let staging = self.config.staging_dir();
        let mut reports = Vec::with_capacity(targets.len());
        for target in &targets {
            let policy = RetentionPolicy::for_target(&db, target);
            let applied = match open_backend(target, &staging).await {
                Ok(backend) => {
                    retention_service::apply_policy(&*backend, &target.id, &db.scope(), policy, Utc::now()).await
                }
                Err(e) => Err(e),
            };
            match applied {
                Ok(report) => reports.push(report),
                Err(e) if target_id.is_none() => {
                    tracing::warn!(database = %db.id, target = %target.id, "Cleanup skipped target: {}", e);
                    reports.push(RetentionReport::unreachable(&target.id, &e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }

    pub async fn update_settings(&self, settings: GlobalSettings) -> Result<GlobalSettings> {
        settings.validate()?;
        let doc = self
            .store
            .update(move |doc| {
                doc.settings = settings;
                Ok(())
            })
            .await?;
        tracing::info!("Settings updated");
        Ok(doc.settings)
    }

    // --- tasks ------------------------------------------------------------

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.tracker.get(id).await
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.tracker.list().await
    }

    pub async fn cancel_task(&self, id: Uuid) -> Result<()> {
        self.tracker.cancel(id).await
    }

    pub async fn subscribe_task_updates(&self, id: Uuid) -> Result<BoxStream<'static, Task>> {
        self.tracker.subscribe_task(id).await
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Task> {
        self.tracker.subscribe_all()
    }

    /// Wait until task `id` reaches a terminal state.
    pub async fn wait_for_task(&self, id: Uuid) -> Result<Task> {
        let mut updates = self.tracker.subscribe_task(id).await?;
        let mut last = None;
        while let Some(task) = updates.next().await {
            last = Some(task);
        }
        match last {
            Some(task) if task.status.is_terminal() => Ok(task),
            _ => self.tracker.get(id).await,
        }
    }

    // --- configuration sync -----------------------------------------------

    async fn sync_backend(&self, target_id: Option<&str>) -> Result<Arc<dyn StorageBackend>> {
        let settings = self.store.settings().await;
        let id = target_id
            .map(str::to_string)
            .or(settings.config_sync.target_id)
            .ok_or_else(|| AppError::Config("No configuration sync target is configured".into()))?;
        let target = self.store.target(&id).await?;
        open_backend(&target, &self.config.staging_dir()).await
    }

    /// Start pushing the configuration to the sync target.
    pub async fn push_config(&self, target_id: Option<&str>) -> Result<Uuid> {
        let backend = self.sync_backend(target_id).await?;
        let guard = self.locks.acquire(CONFIG_SYNC_KEY, "configuration push")?;
        let task = self.tracker.create(TaskKind::Sync, "push").await;
        let id = task.id;
        let store = self.store.clone();
        self.spawn_task(task, guard, None, move |ctx| async move {
            ctx.step("pushing", 10).await;
            let info: BundleInfo = config_sync_service::push(&store, &*backend).await?;
            Ok((format!("Configuration pushed to {}", backend.describe()), serde_json::to_value(&info)?))
        });
        Ok(id)
    }

    /// Start pulling the configuration from the sync target.
    pub async fn pull_config(&self, target_id: Option<&str>, force: bool) -> Result<Uuid> {
        let backend = self.sync_backend(target_id).await?;
        let guard = self.locks.acquire(CONFIG_SYNC_KEY, "configuration pull")?;
        let task = self.tracker.create(TaskKind::Sync, "pull").await;
        let id = task.id;
        let store = self.store.clone();
        self.spawn_task(task, guard, None, move |ctx| async move {
            ctx.step("pulling", 10).await;
            let outcome = config_sync_service::pull(&store, &*backend, force).await?;
            let message = if outcome.applied {
                format!("Configuration from {} applied", outcome.remote.hostname)
            } else {
                "Local configuration is current".to_string()
            };
            Ok((message, serde_json::to_value(&outcome)?))
        });
        Ok(id)
    }

    /// Pull once at startup when the settings ask for it. Failures are logged.
    pub async fn pull_on_startup(&self) -> Option<PullOutcome> {
        let settings = self.store.settings().await;
        if !settings.config_sync.pull_on_startup {
            return None;
        }
        let pulled = async {
            let backend = self.sync_backend(None).await?;
            config_sync_service::pull(&self.store, &*backend, false).await
        }
        .await;
        match pulled {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!("Configuration pull on startup failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl BackupTrigger for BackupService {
    async fn trigger_backup(&self, database_id: &str) -> Result<Uuid> {
        self.backup(database_id).await
    }
}

/// Reject an empty artifact, or one whose sidecar disagrees with what was staged.
async fn check_staged(backend: &dyn StorageBackend, location: &ArtifactLocation, staged: &Checksummed) -> Result<()> {
    if staged.size == 0 {
        return Err(AppError::Integrity(format!("{} is empty", location)));
    }
    match catalog::read_checksum(backend, &location.key).await? {
        Some(record) if record.digest != staged.digest => Err(AppError::Integrity(format!(
            "{} does not match its checksum: expected {}, got {}",
            location, record.digest, staged.digest
        ))),
        Some(_) => Ok(()),
        None => {
            tracing::warn!(artifact = %location, "No checksum sidecar; restoring unverified");
            Ok(())
        }
    }
}

async fn abort_sinks(sinks: &[PipeWriter], cause: &AppError) {
    let cause = io::Error::other(cause.to_string());
    for sink in sinks {
        sink.fail_async(&cause).await;
    }
}

/// Upload every sink's stream while the dump is produced. Returns the checksum and
/// one upload result per backend.
async fn stream_dump(
    tool: &ToolRun<'_>,
    output: &DumpOutput,
    plan: EncodePlan,
    keys: KeyRing,
    key: &str,
    backends: &[(StorageTarget, Arc<dyn StorageBackend>)],
) -> Result<(Checksummed, Vec<Result<String>>)> {
    let (sinks, readers): (Vec<_>, Vec<_>) = backends.iter().map(|_| pipe(DEFAULT_CAPACITY)).unzip();
    let uploads = join_all(
        backends
            .iter()
            .zip(readers)
            .map(|((_, backend), reader)| backend.put(key, Box::new(reader))),
    );
    let (produced, uploads) = tokio::join!(produce_artifact(tool, output, plan, keys, sinks), uploads);

    match produced {
        Ok(checksum) if uploads.iter().any(|u| u.is_ok()) => Ok((checksum, uploads)),
        Ok(_) => Err(root_cause(uploads.into_iter().filter_map(|u| u.err()))
            .unwrap_or_else(|| AppError::Internal("No upload finished".into()))),
        Err(mut errors) => {
            errors.extend(uploads.into_iter().filter_map(|u| u.err()));
            Err(root_cause(errors).unwrap_or_else(|| AppError::Internal("Backup pipeline failed".into())))
        }
    }
}

/// Drive the dump tool and the encoder into `sinks`. Errors come back in pipeline
/// order for root-cause selection.
async fn produce_artifact(
    tool: &ToolRun<'_>,
    output: &DumpOutput,
    plan: EncodePlan,
    keys: KeyRing,
    sinks: Vec<PipeWriter>,
) -> std::result::Result<Checksummed, Vec<AppError>> {
    match output {
        DumpOutput::Stdout => {
            let (tx, mut rx) = pipe(DEFAULT_CAPACITY);
            let encoder = run_blocking(move || pipeline::encode(&plan, &keys, &mut rx, sinks));
            let (dumped, encoded) = tokio::join!(tool.dump_to(tx), encoder);
            collect(vec![dumped.err()], encoded)
        }
        DumpOutput::File(path) => {
            if let Err(e) = tool.run(false).await {
                abort_sinks(&sinks, &e).await;
                return Err(vec![e]);
            }
            let path = path.clone();
            let encoded = run_blocking(move || encode_file(&plan, &keys, &path, sinks)).await;
            collect(Vec::new(), encoded)
        }
        DumpOutput::Directory(dir) => {
            if let Err(e) = tool.run(false).await {
                abort_sinks(&sinks, &e).await;
                return Err(vec![e]);
            }
            let (tx, mut rx) = pipe(DEFAULT_CAPACITY);
            let dir = dir.clone();
            let archiver = run_blocking(move || {
                let guard = tx.clone();
                archive::write_tree(&dir, tx).map(drop).inspect_err(|e| guard.fail(e))
            });
            let encoder = run_blocking(move || pipeline::encode(&plan, &keys, &mut rx, sinks));
            let (archived, encoded) = tokio::join!(archiver, encoder);
            collect(vec![archived.err().map(stage_error)], encoded)
        }
    }
}

fn encode_file(plan: &EncodePlan, keys: &KeyRing, path: &Path, sinks: Vec<PipeWriter>) -> io::Result<Checksummed> {
    match std::fs::File::open(path) {
        Ok(file) => pipeline::encode(plan, keys, &mut BufReader::new(file), sinks),
        Err(e) => {
            for sink in &sinks {
                sink.fail(&e);
            }
            Err(e)
        }
    }
}

fn collect(
    earlier: Vec<Option<AppError>>,
    encoded: io::Result<Checksummed>,
) -> std::result::Result<Checksummed, Vec<AppError>> {
    let mut errors: Vec<AppError> = earlier.into_iter().flatten().collect();
    match encoded {
        Ok(checksum) if errors.is_empty() => Ok(checksum),
        Ok(_) => Err(errors),
        Err(e) => {
            errors.push(stage_error(e));
            Err(errors)
        }
    }
}

/// Decode the staged artifact into `tx`; the reader sees an error instead of a
/// clean end of stream if decoding fails.
fn decode_into(chain: TransformChain, keys: &KeyRing, staged: &Path, tx: PipeWriter) -> io::Result<u64> {
    let guard = tx.clone();
    let result = std::fs::File::open(staged).and_then(|file| {
        let mut tx = tx;
        pipeline::decode(chain, keys, BufReader::new(file), &mut tx)
    });
    if let Err(e) = &result {
        guard.fail(e);
    }
    result
}

fn finish(results: Vec<Result<()>>) -> Result<()> {
    let errors: Vec<AppError> = results.into_iter().filter_map(|r| r.err()).collect();
    match root_cause(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Reverse the artifact's transforms and hand the result to the restore tool in
/// the form it reads.
async fn feed_restore(
    tool: &ToolRun<'_>,
    input: &RestoreInput,
    chain: TransformChain,
    keys: KeyRing,
    staged: PathBuf,
) -> Result<()> {
    match input {
        RestoreInput::Stdin => {
            let (tx, rx) = pipe(DEFAULT_CAPACITY);
            let decoder = run_blocking(move || decode_into(chain, &keys, &staged, tx));
            let (decoded, restored) = tokio::join!(decoder, tool.restore_from(rx));
            finish(vec![decoded.map(drop).map_err(stage_error), restored])
        }
        RestoreInput::File(path) => {
            let target = path.clone();
            run_blocking(move || {
                let input = BufReader::new(std::fs::File::open(&staged)?);
                let mut output = io::BufWriter::new(std::fs::File::create(&target)?);
                pipeline::decode(chain, &keys, input, &mut output)?;
                output.into_inner().map_err(|e| e.into_error())?.sync_all()
            })
            .await
            .map_err(stage_error)?;
            let restored = tool.run(true).await.map(drop);
            let _ = tokio::fs::remove_file(path).await;
            restored
        }
        RestoreInput::Directory(dir) => {
            let (tx, rx) = pipe(DEFAULT_CAPACITY);
            let decoder = run_blocking(move || decode_into(chain, &keys, &staged, tx));
            let dest = dir.clone();
            let extractor = run_blocking(move || {
                let mut rx = rx;
                archive::extract(&mut rx, &dest)?;
                // drain end-of-archive padding so the decoder finishes cleanly
                io::copy(&mut rx, &mut io::sink())?;
                Ok(())
            });
            let (decoded, extracted) = tokio::join!(decoder, extractor);
            finish(vec![
                decoded.map(drop).map_err(stage_error),
                extracted.map_err(stage_error),
            ])?;
            tool.run(true).await.map(drop)
        }
    }
}
