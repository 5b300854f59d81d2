//! In-memory lifecycle and progress tracking for long-running operations.
//!
//! `pending -> running -> completed | failed` are the only transitions; terminal
//! records never change again. Every mutation is broadcast on an [`EventBus`].
//! Records are volatile: they live until pruned or until the process exits.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::event_bus::EventBus;
use crate::error::{AppError, Result};
use crate::models::{Task, TaskError, TaskKind, TaskStatus};

const BUS_CAPACITY: usize = 1024;

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

type TaskMap = Arc<RwLock<HashMap<Uuid, TaskEntry>>>;

/// Progress update applied to a running task.
#[derive(Debug, Clone, Default)]
pub struct TaskProgress {
    pub step: Option<String>,
    pub percentage: Option<u8>,
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn step(step: impl Into<String>, percentage: u8) -> Self {
        Self {
            step: Some(step.into()),
            percentage: Some(percentage),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub struct TaskTracker {
    tasks: TaskMap,
    bus: EventBus<Task>,
    retention: Duration,
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("Task {} not found", id))
}

impl TaskTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            bus: EventBus::new(BUS_CAPACITY),
            retention,
        }
    }

    /// Register a new pending task.
    pub async fn create(&self, kind: TaskKind, target: &str) -> Task {
        let task = Task::new(kind, target);
        let mut tasks = self.tasks.write().await;
        tasks.insert(
            task.id,
            TaskEntry {
                task: task.clone(),
                cancel: CancellationToken::new(),
            },
        );
        self.bus.publish(task.clone());
        tracing::debug!(task_id = %task.id, kind = %kind, target = %target, "Task created");
        task
    }

    /// Apply `change` to a task and broadcast the result.
    async fn mutate<F>(&self, id: Uuid, change: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get_mut(&id).ok_or_else(|| not_found(id))?;
        change(&mut entry.task)?;
        let snapshot = entry.task.clone();
        self.bus.publish(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn start(&self, id: Uuid) -> Result<Task> {
        self.mutate(id, |task| {
            if task.status != TaskStatus::Pending {
                return Err(illegal(task, TaskStatus::Running));
            }
            task.status = TaskStatus::Running;
            task.step = "started".to_string();
            task.started_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// Record progress. Percentages never move backwards; updates to tasks that are
    /// not running are ignored.
    pub async fn progress(&self, id: Uuid, update: TaskProgress) -> Result<Task> {
        self.mutate(id, |task| {
            if task.status != TaskStatus::Running {
                return Ok(());
            }
            if let Some(step) = update.step {
                task.step = step;
            }
            if let Some(pct) = update.percentage {
                task.percentage = task.percentage.max(pct.min(100));
            }
            if let Some(message) = update.message {
                task.message = message;
            }
            Ok(())
        })
        .await
    }

    pub async fn complete(
        &self,
        id: Uuid,
        message: impl Into<String>,
        result: Option<serde_json::Value>,
    ) -> Result<Task> {
        let message = message.into();
        let task = self
            .mutate(id, |task| {
                if task.status != TaskStatus::Running {
                    return Err(illegal(task, TaskStatus::Completed));
                }
                task.status = TaskStatus::Completed;
                task.step = "completed".to_string();
                task.percentage = 100;
                task.message = message;
                task.result = result;
                task.ended_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        tracing::info!(task_id = %id, kind = %task.kind, target = %task.target, "Task completed");
        Ok(task)
    }

    /// Mark a task failed. Allowed from `pending` (rejected before it ran) and `running`.
    pub async fn fail(&self, id: Uuid, error: &AppError) -> Result<Task> {
        let task = self
            .mutate(id, |task| {
                if task.status.is_terminal() {
                    return Err(illegal(task, TaskStatus::Failed));
                }
                task.status = TaskStatus::Failed;
                task.step = "failed".to_string();
                task.message = error.to_string();
                task.error = Some(TaskError::from(error));
                task.ended_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        tracing::warn!(task_id = %id, kind = %task.kind, target = %task.target, code = error.code(), "Task failed: {}", error);
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(&id).map(|e| e.task.clone()).ok_or_else(|| not_found(id))
    }

    /// All tracked tasks, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<Task> = tasks.values().map(|e| e.task.clone()).collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    /// Token a worker watches for cancellation.
    pub async fn cancellation(&self, id: Uuid) -> Result<CancellationToken> {
        let tasks = self.tasks.read().await;
        tasks.get(&id).map(|e| e.cancel.clone()).ok_or_else(|| not_found(id))
    }

    /// Request cancellation. The worker observes it, stops its processes and fails
    /// the task with a cancelled error.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let tasks = self.tasks.read().await;
        let entry = tasks.get(&id).ok_or_else(|| not_found(id))?;
        if entry.task.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Task {} already {}",
                id, entry.task.status
            )));
        }
        entry.cancel.cancel();
        tracing::info!(task_id = %id, "Cancellation requested");
        Ok(())
    }

    /// Every update for every task.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Task> {
        self.bus.subscribe()
    }

    /// Current state of one task followed by each later update, ending after the
    /// terminal update.
    pub async fn subscribe_task(&self, id: Uuid) -> Result<BoxStream<'static, Task>> {
        // subscribe before the snapshot so nothing falls in between
        let rx = self.bus.subscribe();
        let current = self.get(id).await?;
        let tasks = self.tasks.clone();

        struct Cursor {
            first: Option<Task>,
            rx: broadcast::Receiver<Task>,
            tasks: TaskMap,
            done: bool,
        }

        let cursor = Cursor {
            first: Some(current),
            rx,
            tasks,
            done: false,
        };

        Ok(stream::unfold(cursor, move |mut cursor| async move {
            if let Some(task) = cursor.first.take() {
                cursor.done = task.status.is_terminal();
                return Some((task, cursor));
            }
            if cursor.done {
                return None;
            }
            loop {
                match cursor.rx.recv().await {
                    Ok(task) if task.id == id => {
                        cursor.done = task.status.is_terminal();
                        return Some((task, cursor));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // missed updates; resynchronize from the tracker
                        let task = cursor.tasks.read().await.get(&id).map(|e| e.task.clone())?;
                        cursor.done = task.status.is_terminal();
                        return Some((task, cursor));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }

    /// Drop terminal tasks that ended more than the retention window before `now`.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, entry| {
            !(entry.task.status.is_terminal() && entry.task.ended_at.is_some_and(|ended| ended < cutoff))
        });
        let removed = before - tasks.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned finished tasks");
        }
        removed
    }
}

fn illegal(task: &Task, to: TaskStatus) -> AppError {
    AppError::Conflict(format!(
        "Task {} cannot move from {} to {}",
        task.id, task.status, to
    ))
}
