//! Per-database exclusivity markers.
//!
//! Backup, restore, migration and retention cleanup for one database never overlap.
//! A second request is rejected with `Conflict` instead of queueing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{AppError, Result};

#[derive(Debug, Default, Clone)]
pub struct ExclusivityRegistry {
    held: Arc<Mutex<HashMap<String, String>>>,
}

/// Releases its marker when dropped.
#[derive(Debug)]
pub struct ExclusivityGuard {
    held: Arc<Mutex<HashMap<String, String>>>,
    key: String,
}

fn lock(held: &Mutex<HashMap<String, String>>) -> MutexGuard<'_, HashMap<String, String>> {
    // a panic while holding this lock cannot leave the map half-updated
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExclusivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `operation`, or fail with `Conflict` naming the holder.
    pub fn acquire(&self, key: &str, operation: &str) -> Result<ExclusivityGuard> {
        let mut held = lock(&self.held);
        if let Some(holder) = held.get(key) {
            return Err(AppError::Conflict(format!(
                "{} is busy with a running {}",
                key, holder
            )));
        }
        held.insert(key.to_string(), operation.to_string());
        tracing::debug!(key = %key, operation = %operation, "Acquired exclusivity marker");
        Ok(ExclusivityGuard {
            held: self.held.clone(),
            key: key.to_string(),
        })
    }

    /// Claim the marker for a database.
    pub fn acquire_database(&self, database_id: &str, operation: &str) -> Result<ExclusivityGuard> {
        self.acquire(&database_key(database_id), operation)
    }

    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.held).contains_key(key)
    }
}

pub fn database_key(database_id: &str) -> String {
    format!("database '{}'", database_id)
}

impl Drop for ExclusivityGuard {
    fn drop(&mut self) {
        lock(&self.held).remove(&self.key);
        tracing::debug!(key = %self.key, "Released exclusivity marker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_conflicts() {
        let registry = ExclusivityRegistry::new();
        let _guard = registry.acquire_database("orders", "backup").unwrap();
        let err = registry.acquire_database("orders", "restore").unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m.contains("backup")));
        assert!(registry.acquire_database("billing", "backup").is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let registry = ExclusivityRegistry::new();
        let guard = registry.acquire_database("orders", "backup").unwrap();
        assert!(registry.is_held(&database_key("orders")));
        drop(guard);
        assert!(!registry.is_held(&database_key("orders")));
        assert!(registry.acquire_database("orders", "migrate").is_ok());
    }

    #[tokio::test]
    async fn test_guard_moves_into_task() {
        let registry = ExclusivityRegistry::new();
        let guard = registry.acquire_database("orders", "backup").unwrap();
        let handle = tokio::spawn(async move {
            let _guard = guard;
        });
        handle.await.unwrap();
        assert!(!registry.is_held(&database_key("orders")));
    }
}
