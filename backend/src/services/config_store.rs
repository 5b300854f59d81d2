//! Persisted configuration document.
//!
//! One JSON file holds databases, storage targets, schedules and global settings.
//! Secrets are encrypted under the master key on disk and decrypted in memory.
//! Saves write a sibling temp file and rename it into place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::encryption::CredentialEncryption;
use super::scheduler_service::parse_cron;
use crate::error::{AppError, Result};
use crate::models::storage_target::DEFAULT_LOCAL_TARGET;
use crate::models::{
    DatabaseConnection, GlobalSettings, ScheduleEntry, StorageBackendConfig, StorageTarget,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub databases: Vec<DatabaseConnection>,
    #[serde(default)]
    pub storage_targets: Vec<StorageTarget>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// Last user-visible change; drives last-write-wins during config sync
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Visit every secret-bearing field.
fn for_each_secret<F>(doc: &mut ConfigDocument, mut visit: F) -> Result<()>
where
    F: FnMut(&mut String) -> Result<()>,
{
    for db in &mut doc.databases {
        if let Some(password) = db.connection.password.as_mut() {
            visit(password)?;
        }
        if let Some(uri) = db.connection.uri.as_mut() {
            visit(uri)?;
        }
    }
    for target in &mut doc.storage_targets {
        match &mut target.backend {
            StorageBackendConfig::ObjectStore(s3) => {
                if let Some(key) = s3.access_key_id.as_mut() {
                    visit(key)?;
                }
                if let Some(secret) = s3.secret_access_key.as_mut() {
                    visit(secret)?;
                }
            }
            StorageBackendConfig::FileShare(smb) => {
                if let Some(password) = smb.password.as_mut() {
                    visit(password)?;
                }
            }
            StorageBackendConfig::Local(_) => {}
        }
    }
    for channel in &mut doc.settings.notifications.channels {
        visit(&mut channel.webhook_url)?;
    }
    if let Some(passphrase) = doc.settings.encryption.passphrase.as_mut() {
        visit(passphrase)?;
    }
    Ok(())
}

impl ConfigDocument {
    /// Copy with every secret encrypted.
    pub fn sealed(&self, cipher: &CredentialEncryption) -> Result<ConfigDocument> {
        let mut doc = self.clone();
        for_each_secret(&mut doc, |value| {
            *value = cipher.encrypt_field(value)?;
            Ok(())
        })?;
        Ok(doc)
    }

    /// Copy with every secret decrypted.
    pub fn unsealed(&self, cipher: &CredentialEncryption) -> Result<ConfigDocument> {
        let mut doc = self.clone();
        for_each_secret(&mut doc, |value| {
            *value = cipher.decrypt_field(value)?;
            Ok(())
        })?;
        Ok(doc)
    }

    /// Drop the due time of schedules whose timing changed relative to `previous`,
    /// so the scheduler re-arms them from the new expression instead of firing at
    /// the old time or catching up on windows missed while disabled.
    pub fn disarm_changed_schedules(&mut self, previous: &[ScheduleEntry]) {
        for entry in &mut self.schedules {
            if !entry.enabled {
                entry.next_run_at = None;
                continue;
            }
            let changed = previous
                .iter()
                .find(|p| p.id == entry.id)
                .is_some_and(|p| !p.enabled || p.cron_expression != entry.cron_expression);
            if changed {
                entry.next_run_at = None;
            }
        }
    }

    pub fn database(&self, id: &str) -> Result<&DatabaseConnection> {
        self.databases
            .iter()
            .find(|db| db.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Database '{}' not found", id)))
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;

        let mut target_ids = HashSet::new();
        for target in &self.storage_targets {
            if target.id.trim().is_empty() {
                return Err(AppError::Config("Storage target id must not be empty".into()));
            }
            if !target_ids.insert(target.id.as_str()) {
                return Err(AppError::Config(format!("Duplicate storage target id '{}'", target.id)));
            }
        }

        let mut db_ids = HashSet::new();
        let mut scopes = HashSet::new();
        for db in &self.databases {
            if db.id.trim().is_empty() {
                return Err(AppError::Config("Database id must not be empty".into()));
            }
            if !db_ids.insert(db.id.as_str()) {
                return Err(AppError::Config(format!("Duplicate database id '{}'", db.id)));
            }
            if !scopes.insert(db.scope()) {
                return Err(AppError::Config(format!(
                    "Database name '{}' collides with another database's artifact directory",
                    db.name
                )));
            }
            for target_id in &db.storage_target_ids {
                if target_id != DEFAULT_LOCAL_TARGET && !target_ids.contains(target_id.as_str()) {
                    return Err(AppError::Config(format!(
                        "Database '{}' references unknown storage target '{}'",
                        db.id, target_id
                    )));
                }
            }
        }

        let mut schedule_ids = HashSet::new();
        for schedule in &self.schedules {
            if !schedule_ids.insert(schedule.id.as_str()) {
                return Err(AppError::Config(format!("Duplicate schedule id '{}'", schedule.id)));
            }
            if !db_ids.contains(schedule.database_id.as_str()) {
                return Err(AppError::Config(format!(
                    "Schedule '{}' references unknown database '{}'",
                    schedule.id, schedule.database_id
                )));
            }
            parse_cron(&schedule.cron_expression)?;
        }

        if let Some(target) = &self.settings.config_sync.target_id {
            if target != DEFAULT_LOCAL_TARGET && !target_ids.contains(target.as_str()) {
                return Err(AppError::Config(format!(
                    "Config sync references unknown storage target '{}'",
                    target
                )));
            }
        }
        Ok(())
    }
}

/// Configuration document with file persistence.
pub struct ConfigStore {
    path: PathBuf,
    local_root: PathBuf,
    cipher: CredentialEncryption,
    doc: RwLock<ConfigDocument>,
}

impl ConfigStore {
    /// Load `path` (an absent file is an empty configuration). `local_root` backs the
    /// built-in `local` storage target.
    pub async fn open(
        path: impl Into<PathBuf>,
        local_root: impl Into<PathBuf>,
        cipher: CredentialEncryption,
    ) -> Result<Self> {
        let path = path.into();
        let doc = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let stored: ConfigDocument = serde_json::from_slice(&raw).map_err(|e| {
                    AppError::Config(format!("Invalid configuration file {}: {}", path.display(), e))
                })?;
                let doc = stored.unsealed(&cipher)?;
                doc.validate()?;
                tracing::info!(
                    path = %path.display(),
                    databases = doc.databases.len(),
                    targets = doc.storage_targets.len(),
                    schedules = doc.schedules.len(),
                    "Loaded configuration"
                );
                doc
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No configuration file yet, starting empty");
                ConfigDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            local_root: local_root.into(),
            cipher,
            doc: RwLock::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cipher(&self) -> &CredentialEncryption {
        &self.cipher
    }

    /// Decrypted copy of the whole document.
    pub async fn snapshot(&self) -> ConfigDocument {
        self.doc.read().await.clone()
    }

    pub async fn settings(&self) -> GlobalSettings {
        self.doc.read().await.settings.clone()
    }

    pub async fn database(&self, id: &str) -> Result<DatabaseConnection> {
        self.doc.read().await.database(id).cloned()
    }

    /// A configured target, or the built-in local one.
    pub async fn target(&self, id: &str) -> Result<StorageTarget> {
        let doc = self.doc.read().await;
        if let Some(target) = doc.storage_targets.iter().find(|t| t.id == id) {
            return Ok(target.clone());
        }
        if id == DEFAULT_LOCAL_TARGET {
            return Ok(StorageTarget::local(DEFAULT_LOCAL_TARGET, self.local_root.clone()));
        }
        Err(AppError::NotFound(format!("Storage target '{}' not found", id)))
    }

    /// Targets a database backs up to; the built-in local target when none are set.
    pub async fn targets_for(&self, db: &DatabaseConnection) -> Result<Vec<StorageTarget>> {
        if db.storage_target_ids.is_empty() {
            return Ok(vec![self.target(DEFAULT_LOCAL_TARGET).await?]);
        }
        let mut targets = Vec::with_capacity(db.storage_target_ids.len());
        for id in &db.storage_target_ids {
            targets.push(self.target(id).await?);
        }
        Ok(targets)
    }

    /// Apply a user change: validate, stamp `updated_at`, persist.
    pub async fn update<F>(&self, change: F) -> Result<ConfigDocument>
    where
        F: FnOnce(&mut ConfigDocument) -> Result<()>,
    {
        self.apply(change, true).await
    }

    /// Record scheduler bookkeeping without counting as a user change.
    pub async fn record_schedule(
        &self,
        schedule_id: &str,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.apply(
            |doc| {
                let entry = doc
                    .schedules
                    .iter_mut()
                    .find(|s| s.id == schedule_id)
                    .ok_or_else(|| AppError::NotFound(format!("Schedule '{}' not found", schedule_id)))?;
                if last_run_at.is_some() {
                    entry.last_run_at = last_run_at;
                }
                entry.next_run_at = next_run_at;
                Ok(())
            },
            false,
        )
        .await
        .map(|_| ())
    }

    async fn apply<F>(&self, change: F, stamp: bool) -> Result<ConfigDocument>
    where
        F: FnOnce(&mut ConfigDocument) -> Result<()>,
    {
        let mut current = self.doc.write().await;
        let mut next = current.clone();
        change(&mut next)?;
        next.validate()?;
        if stamp {
            next.disarm_changed_schedules(&current.schedules);
            next.updated_at = Some(Utc::now());
        }
        self.persist(&next).await?;
        *current = next.clone();
        Ok(next)
    }

    /// Replace the whole document (config pull). The previous file is kept as `.bak`.
    pub async fn replace(&self, mut incoming: ConfigDocument) -> Result<()> {
        incoming.validate()?;
        let mut current = self.doc.write().await;
        incoming.disarm_changed_schedules(&current.schedules);
        if tokio::fs::try_exists(&self.path).await? {
            let backup = self.path.with_extension("json.bak");
            tokio::fs::copy(&self.path, &backup).await?;
            tracing::info!(backup = %backup.display(), "Saved previous configuration");
        }
        self.persist(&incoming).await?;
        *current = incoming;
        Ok(())
    }

    async fn persist(&self, doc: &ConfigDocument) -> Result<()> {
        let sealed = doc.sealed(&self.cipher)?;
        let json = serde_json::to_vec_pretty(&sealed)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(
            ".{}.tmp-{}",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("config.json"),
            uuid::Uuid::new_v4().simple()
        ));
        let written = async {
            tokio::fs::write(&tmp, &json).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
            }
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }
}
