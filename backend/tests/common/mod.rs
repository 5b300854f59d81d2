//! Shared fixtures for integration tests: a service rooted in a temp directory,
//! `sh`-driven fake engine adapters and an in-memory storage backend with
//! failure injection.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use db_keeper_backend::config::Config;
use db_keeper_backend::error::{AppError, Result};
use db_keeper_backend::models::{
    ConnectionParams, DatabaseConnection, EngineKind, GlobalSettings, StorageTarget,
};
use db_keeper_backend::providers::{
    DumpOutput, DumpPlan, ProgressSignal, ProviderAdapter, ProviderRegistry, RestoreInput,
    RestorePlan, ToolCommand,
};
use db_keeper_backend::services::config_store::ConfigStore;
use db_keeper_backend::services::encryption::CredentialEncryption;
use db_keeper_backend::services::BackupService;
use db_keeper_backend::storage::{ByteStream, ObjectMeta, StorageBackend};

pub const MASTER_KEY: [u8; 32] = [7u8; 32];

/// Shell snippet printing a deterministic, compressible dump.
pub const DUMP_SCRIPT: &str =
    "i=0; while [ $i -lt 3000 ]; do echo \"INSERT INTO orders VALUES ($i, 'widget');\"; i=$((i+1)); done";

fn sh(script: &str, args: &[&str]) -> ToolCommand {
    ToolCommand::new("sh")
        .arg("-c")
        .arg(script)
        .arg("sh")
        .args(args.iter().map(|a| a.to_string()))
}

/// Relational engine stand-in: dumps `script` on stdout and restores stdin into
/// `restored`.
pub struct StreamingAdapter {
    pub engine: EngineKind,
    pub script: String,
    pub restored: PathBuf,
}

impl ProviderAdapter for StreamingAdapter {
    fn engine(&self) -> EngineKind {
        self.engine
    }

    fn validate(&self, _db: &DatabaseConnection) -> Result<()> {
        Ok(())
    }

    fn build_dump_command(&self, _db: &DatabaseConnection, _workdir: &Path) -> Result<DumpPlan> {
        Ok(DumpPlan {
            command: sh(&self.script, &[]),
            output: DumpOutput::Stdout,
            base_extension: "sql".into(),
        })
    }

    fn build_restore_command(
        &self,
        _db: &DatabaseConnection,
        _base_extension: &str,
        _workdir: &Path,
    ) -> Result<RestorePlan> {
        Ok(RestorePlan {
            command: sh("cat > \"$1\"", &[&self.restored.display().to_string()]),
            input: RestoreInput::Stdin,
        })
    }

    fn build_test_command(&self, _db: &DatabaseConnection, _workdir: &Path) -> Result<ToolCommand> {
        Ok(sh("echo ok", &[]))
    }

    fn parse_progress(&self, line: &str) -> Option<ProgressSignal> {
        line.strip_prefix("progress ")
            .and_then(|p| p.trim().parse::<u8>().ok())
            .map(ProgressSignal::percent)
    }
}

/// Document engine stand-in: dumps a directory tree and restores by copying the
/// unpacked tree to `restored`.
pub struct TreeAdapter {
    pub restored: PathBuf,
}

impl ProviderAdapter for TreeAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Mongodb
    }

    fn validate(&self, _db: &DatabaseConnection) -> Result<()> {
        Ok(())
    }

    fn build_dump_command(&self, _db: &DatabaseConnection, workdir: &Path) -> Result<DumpPlan> {
        let out = workdir.join("dump");
        Ok(DumpPlan {
            command: sh(
                "mkdir -p \"$1/catalog\" && echo '{\"sku\":1}' > \"$1/catalog/items.bson\" && echo meta > \"$1/catalog/items.metadata.json\"",
                &[&out.display().to_string()],
            ),
            output: DumpOutput::Directory(out),
            base_extension: "tar".into(),
        })
    }

    fn build_restore_command(
        &self,
        _db: &DatabaseConnection,
        _base_extension: &str,
        workdir: &Path,
    ) -> Result<RestorePlan> {
        let unpacked = workdir.join("restore");
        Ok(RestorePlan {
            command: sh(
                "cp -R \"$1\" \"$2\"",
                &[&unpacked.display().to_string(), &self.restored.display().to_string()],
            ),
            input: RestoreInput::Directory(unpacked),
        })
    }

    fn build_test_command(&self, _db: &DatabaseConnection, _workdir: &Path) -> Result<ToolCommand> {
        Ok(sh("exit 0", &[]))
    }

    fn parse_progress(&self, _line: &str) -> Option<ProgressSignal> {
        None
    }
}

/// Server-side engine stand-in: the dump tool writes a file the pipeline picks up
/// afterwards, and the restore tool reads a file the pipeline wrote beforehand.
pub struct FileAdapter {
    pub script: String,
    pub restored: PathBuf,
}

impl ProviderAdapter for FileAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlserver
    }

    fn validate(&self, _db: &DatabaseConnection) -> Result<()> {
        Ok(())
    }

    fn build_dump_command(&self, _db: &DatabaseConnection, workdir: &Path) -> Result<DumpPlan> {
        let file = workdir.join("ledger.bak");
        Ok(DumpPlan {
            command: sh(
                &format!("echo '50 percent processed.'; ( {} ) > \"$1\"", self.script),
                &[&file.display().to_string()],
            ),
            output: DumpOutput::File(file),
            base_extension: "bak".into(),
        })
    }

    fn build_restore_command(
        &self,
        _db: &DatabaseConnection,
        _base_extension: &str,
        workdir: &Path,
    ) -> Result<RestorePlan> {
        let file = workdir.join("ledger-restore.bak");
        Ok(RestorePlan {
            command: sh(
                "cp \"$1\" \"$2\"",
                &[&file.display().to_string(), &self.restored.display().to_string()],
            ),
            input: RestoreInput::File(file),
        })
    }

    fn build_test_command(&self, _db: &DatabaseConnection, _workdir: &Path) -> Result<ToolCommand> {
        Ok(sh("exit 0", &[]))
    }

    fn parse_progress(&self, line: &str) -> Option<ProgressSignal> {
        line.strip_suffix(" percent processed.")
            .and_then(|p| p.trim().parse::<u8>().ok())
            .map(ProgressSignal::percent)
    }
}

pub fn database(id: &str, engine: EngineKind) -> DatabaseConnection {
    DatabaseConnection {
        id: id.into(),
        name: id.into(),
        engine,
        connection: ConnectionParams {
            host: Some("db.internal".into()),
            username: Some("backup".into()),
            password: Some("s3cret".into()),
            ..Default::default()
        },
        retention_local: 0,
        retention_remote: 0,
        retention_days: 0,
        storage_target_ids: Vec::new(),
    }
}

/// A service rooted in a temp directory, with one `orders` postgres database
/// backed by [`StreamingAdapter`], one `catalog` mongodb database backed by
/// [`TreeAdapter`] and one `ledger` sqlserver database backed by [`FileAdapter`].
pub struct Harness {
    pub dir: TempDir,
    pub service: BackupService,
    /// Where the fake restore tools write what they received.
    pub restored: PathBuf,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_dump_script(DUMP_SCRIPT).await
    }

    pub async fn with_dump_script(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        let restored = dir.path().join("restored");

        let store = ConfigStore::open(
            config.config_path(),
            config.backup_dir(),
            CredentialEncryption::new(&MASTER_KEY).unwrap(),
        )
        .await
        .unwrap();
        store
            .update(|doc| {
                doc.databases.push(database("orders", EngineKind::Postgres));
                doc.databases.push(database("catalog", EngineKind::Mongodb));
                doc.databases.push(database("ledger", EngineKind::Sqlserver));
                Ok(())
            })
            .await
            .unwrap();

        let mut providers = ProviderRegistry::default();
        providers.register(Arc::new(StreamingAdapter {
            engine: EngineKind::Postgres,
            script: script.to_string(),
            restored: restored.clone(),
        }));
        providers.register(Arc::new(TreeAdapter {
            restored: restored.clone(),
        }));
        providers.register(Arc::new(FileAdapter {
            script: script.to_string(),
            restored: restored.clone(),
        }));

        let service = BackupService::new(config, Arc::new(store), providers);
        Self {
            dir,
            service,
            restored,
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.service.config().backup_dir()
    }

    pub async fn set_settings(&self, change: impl FnOnce(&mut GlobalSettings)) {
        let mut settings = self.service.store().settings().await;
        change(&mut settings);
        self.service.update_settings(settings).await.unwrap();
    }

    /// Add a local target at `path` and attach it (with `local`) to `database`.
    pub async fn add_local_target(&self, id: &str, path: &Path, database: &str) {
        let target = StorageTarget::local(id, path);
        let database = database.to_string();
        let id = id.to_string();
        self.service
            .store()
            .update(move |doc| {
                doc.storage_targets.push(target);
                let db = doc
                    .databases
                    .iter_mut()
                    .find(|d| d.id == database)
                    .ok_or_else(|| AppError::NotFound(database.clone()))?;
                db.storage_target_ids = vec!["local".to_string(), id];
                Ok(())
            })
            .await
            .unwrap();
    }

    /// Files under the local target for `scope`, sorted.
    pub fn local_files(&self, scope: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.backup_dir().join(scope))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Output of [`DUMP_SCRIPT`].
pub fn expected_dump() -> Vec<u8> {
    (0..3000)
        .map(|i| format!("INSERT INTO orders VALUES ({}, 'widget');\n", i))
        .collect::<String>()
        .into_bytes()
}

/// In-memory storage that can be told to refuse writes to chosen keys.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Bytes>>,
    refused: Mutex<HashSet<String>>,
}

impl MemoryStorage {
    pub fn refuse(&self, key: &str) {
        self.refused.lock().unwrap().insert(key.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn insert(&self, key: &str, content: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::copy_from_slice(content));
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn put(&self, key: &str, mut content: ByteStream) -> Result<String> {
        if self.refused.lock().unwrap().contains(key) {
            return Err(AppError::storage(format!("write to {} refused", key)));
        }
        let mut buf = Vec::new();
        content.read_to_end(&mut buf).await?;
        self.objects.lock().unwrap().insert(key.to_string(), Bytes::from(buf));
        Ok(format!("memory://{}", key))
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::NotFound(key.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn list(&self, scope: &str) -> Result<Vec<ObjectMeta>> {
        let prefix = format!("{}/", scope);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix) && !k[prefix.len()..].contains('/'))
            .map(|(k, v)| ObjectMeta {
                key: k.clone(),
                size: v.len() as u64,
                last_modified: Utc::now(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .map(drop)
            .ok_or_else(|| AppError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn stat(&self, key: &str) -> Result<ObjectMeta> {
        let size = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|v| v.len() as u64)
            .ok_or_else(|| AppError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            last_modified: Utc::now(),
        })
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}
