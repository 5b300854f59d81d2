//! Database connection records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    Mysql,
    Mariadb,
    Sqlserver,
    Mongodb,
}

impl EngineKind {
    pub const ALL: [EngineKind; 5] = [
        EngineKind::Postgres,
        EngineKind::Mysql,
        EngineKind::Mariadb,
        EngineKind::Sqlserver,
        EngineKind::Mongodb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Postgres => "postgres",
            EngineKind::Mysql => "mysql",
            EngineKind::Mariadb => "mariadb",
            EngineKind::Sqlserver => "sqlserver",
            EngineKind::Mongodb => "mongodb",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            EngineKind::Postgres => 5432,
            EngineKind::Mysql | EngineKind::Mariadb => 3306,
            EngineKind::Sqlserver => 1433,
            EngineKind::Mongodb => 27017,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(EngineKind::Postgres),
            "mysql" => Ok(EngineKind::Mysql),
            "mariadb" => Ok(EngineKind::Mariadb),
            "sqlserver" | "mssql" => Ok(EngineKind::Sqlserver),
            "mongodb" | "mongo" => Ok(EngineKind::Mongodb),
            other => Err(AppError::Config(format!("Unknown engine '{}'", other))),
        }
    }
}

/// Address and credentials for reaching a database server.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Database to dump/restore; defaults to the connection name.
    #[serde(default)]
    pub database: Option<String>,
    /// Full connection string (document engine).
    #[serde(default)]
    pub uri: Option<String>,
    /// Authentication database for the document engine.
    #[serde(default)]
    pub auth_database: Option<String>,
    /// Integrated/trusted authentication, no password required.
    #[serde(default)]
    pub trusted_auth: bool,
    /// Directory the database server itself writes native backups to (sqlserver).
    #[serde(default)]
    pub server_backup_dir: Option<String>,
}

redacted_debug!(ConnectionParams {
    show host,
    show port,
    show username,
    redact_option password,
    show database,
    redact_option uri,
    show auth_database,
    show trusted_auth,
    show server_backup_dir,
});

/// A configured database. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConnection {
    pub id: String,
    pub name: String,
    pub engine: EngineKind,
    pub connection: ConnectionParams,
    /// Artifacts kept on local targets (0 = unbounded)
    #[serde(default)]
    pub retention_local: u32,
    /// Artifacts kept on remote targets (0 = unbounded)
    #[serde(default)]
    pub retention_remote: u32,
    /// Maximum artifact age in days (0 = unbounded)
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default)]
    pub storage_target_ids: Vec<String>,
}

impl DatabaseConnection {
    /// Directory/prefix under which this database's artifacts live on every target.
    pub fn scope(&self) -> String {
        sanitize_name(&self.name)
    }

    /// Name of the database inside the server.
    pub fn target_database(&self) -> &str {
        self.connection.database.as_deref().unwrap_or(&self.name)
    }

    pub fn port(&self) -> u16 {
        self.connection.port.unwrap_or_else(|| self.engine.default_port())
    }
}

/// Restrict a name to characters safe in file names and object keys.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "database".to_string()
    } else {
        cleaned
    }
}
