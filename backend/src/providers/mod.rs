//! Database engine adapters.
//!
//! An adapter knows how to drive one engine's native tools: which command dumps a
//! database, which command restores it, how to check connectivity and how to read
//! progress out of the tool's log lines. Adapters only build commands; spawning,
//! streaming and timeouts live in [`process`].

pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod process;
pub mod sqlserver;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{DatabaseConnection, EngineKind};

/// An external program invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // env values carry passwords; only the names are printed
        let env_names: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ToolCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_names)
            .finish()
    }
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program name for messages, without its directory.
    pub fn tool_name(&self) -> &str {
        self.program.rsplit('/').next().unwrap_or(&self.program)
    }
}

/// Where a dump tool leaves its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpOutput {
    /// Streamed on standard output.
    Stdout,
    /// A directory tree, archived into a single tar stream after the tool exits.
    Directory(PathBuf),
    /// A single file, streamed and removed after the tool exits.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DumpPlan {
    pub command: ToolCommand,
    pub output: DumpOutput,
    /// Native artifact extension before any transform suffixes.
    pub base_extension: String,
}

/// Where a restore tool expects the decoded dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreInput {
    Stdin,
    /// Unpack the tar artifact into this directory before running the tool.
    Directory(PathBuf),
    /// Write the artifact to this file before running the tool.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub command: ToolCommand,
    pub input: RestoreInput,
}

/// Normalized progress read from one line of tool output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSignal {
    pub percentage: Option<u8>,
    pub step: Option<String>,
}

impl ProgressSignal {
    pub fn step(step: impl Into<String>) -> Self {
        Self {
            percentage: None,
            step: Some(step.into()),
        }
    }

    pub fn percent(percentage: u8) -> Self {
        Self {
            percentage: Some(percentage.min(100)),
            step: None,
        }
    }
}

/// Engine adapter trait.
///
/// Implementations are pure command builders and line parsers; they never spawn
/// processes themselves.
pub trait ProviderAdapter: Send + Sync {
    fn engine(&self) -> EngineKind;

    /// Reject incomplete connection parameters before any process is spawned.
    fn validate(&self, db: &DatabaseConnection) -> Result<()>;

    /// Command that dumps `db`. `workdir` is private scratch space removed after the run.
    fn build_dump_command(&self, db: &DatabaseConnection, workdir: &Path) -> Result<DumpPlan>;

    /// Command that restores an artifact whose native extension is `base_extension`.
    fn build_restore_command(
        &self,
        db: &DatabaseConnection,
        base_extension: &str,
        workdir: &Path,
    ) -> Result<RestorePlan>;

    /// Cheap query proving the server is reachable with the configured credentials.
    fn build_test_command(&self, db: &DatabaseConnection, workdir: &Path) -> Result<ToolCommand>;

    fn parse_progress(&self, line: &str) -> Option<ProgressSignal>;

    /// Whether a non-zero restore exit is only a warning for this engine.
    fn restore_failure_tolerated(&self, _exit_code: Option<i32>, _stderr: &str) -> bool {
        false
    }
}

/// Built-in adapter for an engine.
pub fn get_core_adapter(engine: EngineKind) -> Arc<dyn ProviderAdapter> {
    match engine {
        EngineKind::Postgres => Arc::new(postgres::PostgresAdapter::new()),
        EngineKind::Mysql => Arc::new(mysql::MysqlAdapter::mysql()),
        EngineKind::Mariadb => Arc::new(mysql::MysqlAdapter::mariadb()),
        EngineKind::Sqlserver => Arc::new(sqlserver::SqlServerAdapter::new()),
        EngineKind::Mongodb => Arc::new(mongodb::MongoAdapter::new()),
    }
}

/// Adapters keyed by engine. Starts with the built-in set; registering an adapter
/// for an engine replaces the previous one.
#[derive(Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<EngineKind, Arc<dyn ProviderAdapter>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        for engine in EngineKind::ALL {
            registry.register(get_core_adapter(engine));
        }
        registry
    }
}

impl ProviderRegistry {
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.engine(), adapter);
    }

    pub fn get(&self, engine: EngineKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&engine)
            .cloned()
            .ok_or_else(|| AppError::Config(format!("No adapter registered for engine '{}'", engine)))
    }
}

/// Shared validation: a host, and a username/password pair unless trusted auth is on.
pub(crate) fn require_host_and_credentials(db: &DatabaseConnection) -> Result<()> {
    let params = &db.connection;
    if params.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
        return Err(AppError::Config(format!("Database '{}' has no host configured", db.name)));
    }
    if params.trusted_auth {
        return Ok(());
    }
    if params.username.as_deref().map_or(true, str::is_empty) {
        return Err(AppError::Config(format!("Database '{}' has no username configured", db.name)));
    }
    if params.password.is_none() {
        return Err(AppError::Config(format!("Database '{}' has no password configured", db.name)));
    }
    Ok(())
}

pub(crate) fn host(db: &DatabaseConnection) -> &str {
    db.connection.host.as_deref().unwrap_or("localhost")
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::{ConnectionParams, DatabaseConnection, EngineKind};

    pub fn database(engine: EngineKind) -> DatabaseConnection {
        DatabaseConnection {
            id: "db-1".into(),
            name: "orders".into(),
            engine,
            connection: ConnectionParams {
                host: Some("db.internal".into()),
                port: None,
                username: Some("backup".into()),
                password: Some("s3cret".into()),
                database: Some("orders_prod".into()),
                ..Default::default()
            },
            retention_local: 0,
            retention_remote: 0,
            retention_days: 0,
            storage_target_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::database;
    use super::*;

    #[test]
    fn test_registry_has_every_engine() {
        let registry = ProviderRegistry::default();
        for engine in EngineKind::ALL {
            assert_eq!(registry.get(engine).unwrap().engine(), engine);
        }
    }

    #[test]
    fn test_tool_command_debug_hides_env_values() {
        let cmd = ToolCommand::new("/usr/bin/pg_dump")
            .arg("-Fc")
            .env("PGPASSWORD", "hunter2");
        let debug = format!("{:?}", cmd);
        assert!(debug.contains("PGPASSWORD"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(cmd.tool_name(), "pg_dump");
    }

    #[test]
    fn test_missing_host_or_password_fails_fast() {
        let mut db = database(EngineKind::Postgres);
        db.connection.host = None;
        assert!(matches!(require_host_and_credentials(&db), Err(AppError::Config(_))));

        let mut db = database(EngineKind::Postgres);
        db.connection.password = None;
        assert!(matches!(require_host_and_credentials(&db), Err(AppError::Config(_))));

        db.connection.trusted_auth = true;
        db.connection.username = None;
        assert!(require_host_and_credentials(&db).is_ok());
    }
}
