//! Execution of CLI commands against a `BackupService`.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cli::commands::{error, output, table_row, Cli, Command};
use crate::error::{AppError, ErrorKind, Result};
use crate::models::{ArtifactLocation, Task, TaskStatus};
use crate::services::backup_service::BackupService;
use crate::services::migration_service::MigrationOptions;
use crate::services::scheduler_service::Scheduler;

/// Run one CLI command. Task-backed commands wait for the task and fail when it fails.
pub async fn run(cli: Cli, service: BackupService) -> Result<()> {
    let format = cli.format.as_str();
    let result = dispatch(format, cli.command, &service).await;
    if let Err(e) = &result {
        error(format, &format!("{} ({})", e, e.code()));
    }
    result
}

async fn dispatch(format: &str, command: Command, service: &BackupService) -> Result<()> {
    match command {
        Command::Run => run_daemon(service).await,
        Command::Backup { database } => {
            let id = service.backup(&database).await?;
            follow(format, service, id).await
        }
        Command::Restore {
            database,
            location,
            skip_safety_snapshot,
        } => {
            let location: ArtifactLocation = location.parse()?;
            let id = service.restore(&database, &location, skip_safety_snapshot).await?;
            follow(format, service, id).await
        }
        Command::List { database, target } => {
            let artifacts = service.list_artifacts(&database, target.as_deref()).await?;
            if format == "json" {
                output(format, "", Some(serde_json::to_value(&artifacts)?));
            } else if artifacts.is_empty() {
                println!("No artifacts for '{}'", database);
            } else {
                table_row(&["LOCATION", "SIZE", "CREATED", "CHECKSUM"]);
                for artifact in &artifacts {
                    table_row(&[
                        &artifact.location.to_string(),
                        &artifact.size.to_string(),
                        &artifact.created_at.to_rfc3339(),
                        if artifact.has_checksum { "yes" } else { "no" },
                    ]);
                }
            }
            Ok(())
        }
        Command::Verify { location } => {
            let location: ArtifactLocation = location.parse()?;
            let report = service.verify_artifact(&location).await?;
            let message = if report.valid {
                format!("{} is valid ({} bytes)", location, report.size)
            } else {
                format!("{} is INVALID: {}", location, report.errors.join("; "))
            };
            output(format, &message, Some(serde_json::to_value(&report)?));
            if report.valid {
                Ok(())
            } else {
                Err(AppError::Integrity(report.errors.join("; ")))
            }
        }
        Command::Delete { location } => {
            let location: ArtifactLocation = location.parse()?;
            service.delete_artifact(&location).await?;
            output(format, &format!("Deleted {}", location), None);
            Ok(())
        }
        Command::TestConnection { database } => {
            service.test_connection(&database).await?;
            output(format, &format!("Connection to '{}' succeeded", database), None);
            Ok(())
        }
        Command::Migrate {
            database,
            from,
            to,
            keep_source,
            dry_run,
        } => {
            if dry_run {
                let estimate = service.estimate_migration(&database, &from).await?;
                let message = format!(
                    "{} artifact(s), {} bytes would move from '{}' to '{}'",
                    estimate.artifact_count, estimate.total_bytes, from, to
                );
                output(format, &message, Some(serde_json::to_value(&estimate)?));
                return Ok(());
            }
            let options = MigrationOptions {
                delete_source: !keep_source,
            };
            let id = service.migrate(&database, &from, &to, options).await?;
            follow(format, service, id).await
        }
        Command::Cleanup { database, target } => {
            let reports = service.cleanup(&database, target.as_deref()).await?;
            if format == "json" {
                output(format, "", Some(serde_json::to_value(&reports)?));
            } else {
                for report in &reports {
                    if let Some(e) = &report.error {
                        println!("{}: skipped, {}", report.target_id, e);
                        continue;
                    }
                    println!(
                        "{}: kept {}, deleted {}, failed {}",
                        report.target_id,
                        report.kept,
                        report.deleted.len(),
                        report.failed.len()
                    );
                }
            }
            Ok(())
        }
        Command::ConfigPush { target } => {
            let id = service.push_config(target.as_deref()).await?;
            follow(format, service, id).await
        }
        Command::ConfigPull { target, force } => {
            let id = service.pull_config(target.as_deref(), force).await?;
            follow(format, service, id).await
        }
    }
}

/// Print progress of task `id` until it finishes.
async fn follow(format: &str, service: &BackupService, id: Uuid) -> Result<()> {
    let mut updates = service.subscribe_task_updates(id).await?;
    let mut last = None;
    while let Some(task) = updates.next().await {
        if format == "text" && task.status == TaskStatus::Running {
            eprintln!("[{:>3}%] {} {}", task.percentage, task.step, task.message);
        }
        last = Some(task);
    }
    let task = match last {
        Some(task) if task.status.is_terminal() => task,
        _ => service.get_task(id).await?,
    };

    let value = serde_json::to_value(&task)?;
    match task.status {
        TaskStatus::Completed => {
            output(format, &task.message, Some(value));
            Ok(())
        }
        _ => {
            if format == "json" {
                output(format, "", Some(value));
            }
            Err(task_failure(&task))
        }
    }
}

/// Rebuild an error of the task's recorded kind.
fn task_failure(task: &Task) -> AppError {
    let Some(detail) = &task.error else {
        return AppError::Internal(format!("{} of '{}' did not complete", task.kind, task.target));
    };
    let message = detail.message.clone();
    match detail.kind {
        ErrorKind::Configuration => AppError::Config(message),
        ErrorKind::ToolExecution => AppError::ToolExecution {
            tool: task.kind.to_string(),
            exit_code: None,
            stderr: message,
        },
        ErrorKind::Timeout => AppError::Timeout(message),
        ErrorKind::Integrity => AppError::Integrity(message),
        ErrorKind::Storage => AppError::storage(message),
        ErrorKind::NotFound => AppError::NotFound(message),
        ErrorKind::Conflict => AppError::Conflict(message),
        ErrorKind::Cancelled => AppError::Cancelled(message),
        ErrorKind::Internal => AppError::Internal(message),
    }
}

/// Run the scheduler until Ctrl-C.
async fn run_daemon(service: &BackupService) -> Result<()> {
    if let Some(outcome) = service.pull_on_startup().await {
        tracing::info!(applied = outcome.applied, "Startup configuration pull finished");
    }

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(service.store().clone(), Arc::new(service.clone())));
    let tick = Duration::from_secs(service.config().scheduler_tick_secs.max(1));
    let handle = scheduler.spawn(tick, shutdown.clone());

    let mut updates = service.subscribe_all();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => {
                if let Ok(task) = update {
                    if task.status.is_terminal() {
                        tracing::info!(
                            task_id = %task.id,
                            kind = %task.kind,
                            target = %task.target,
                            status = %task.status,
                            "Task finished"
                        );
                    }
                }
            }
        }
    }

    tracing::info!("Shutting down");
    shutdown.cancel();
    let _ = handle.await;
    Ok(())
}
