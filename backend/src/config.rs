//! Process configuration loaded from environment variables.

use crate::error::{AppError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Process configuration
#[derive(Clone)]
pub struct Config {
    /// Root for the configuration document, local backups, staging space and key file
    pub data_dir: PathBuf,

    /// Master key material from `DBKEEPER_MASTER_KEY` (takes precedence over the key file)
    pub master_key: Option<String>,

    /// Key file consulted when no master key is set in the environment
    pub key_file: PathBuf,

    /// Upper bound for a dump tool run
    pub dump_timeout_secs: u64,

    /// Upper bound for a restore tool run
    pub restore_timeout_secs: u64,

    /// Upper bound for a connection test
    pub connection_timeout_secs: u64,

    /// Scheduler evaluation interval
    pub scheduler_tick_secs: u64,

    /// Terminal tasks older than this are pruned from the tracker
    pub task_retention_hours: u64,

    /// Log level
    pub log_level: String,

    /// OTLP collector endpoint (optional)
    pub otel_endpoint: Option<String>,

    /// Service name reported to the OTLP collector
    pub otel_service_name: String,
}

redacted_debug!(Config {
    show data_dir,
    redact_option master_key,
    show key_file,
    show dump_timeout_secs,
    show restore_timeout_secs,
    show connection_timeout_secs,
    show scheduler_tick_secs,
    show task_retention_hours,
    show log_level,
    show otel_endpoint,
    show otel_service_name,
});

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(
            env::var("DBKEEPER_DATA_DIR").unwrap_or_else(|_| "/var/lib/db-keeper".into()),
        );
        if data_dir.as_os_str().is_empty() {
            return Err(AppError::Config("DBKEEPER_DATA_DIR is empty".into()));
        }
        let key_file = env::var("DBKEEPER_KEY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join(".secret.key"));

        Ok(Self {
            master_key: env::var("DBKEEPER_MASTER_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            key_file,
            dump_timeout_secs: parse_secs("DBKEEPER_DUMP_TIMEOUT_SECS", 3600)?,
            restore_timeout_secs: parse_secs("DBKEEPER_RESTORE_TIMEOUT_SECS", 3600)?,
            connection_timeout_secs: parse_secs("DBKEEPER_CONNECTION_TIMEOUT_SECS", 30)?,
            scheduler_tick_secs: parse_secs("DBKEEPER_SCHEDULER_TICK_SECS", 30)?,
            task_retention_hours: parse_secs("DBKEEPER_TASK_RETENTION_HOURS", 24)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            otel_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            otel_service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "db-keeper".into()),
            data_dir,
        })
    }

    /// Configuration rooted at `data_dir` with default timeouts. Used by embedders and tests.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            master_key: None,
            key_file: data_dir.join(".secret.key"),
            dump_timeout_secs: 3600,
            restore_timeout_secs: 3600,
            connection_timeout_secs: 30,
            scheduler_tick_secs: 30,
            task_retention_hours: 24,
            log_level: "info".into(),
            otel_endpoint: None,
            otel_service_name: "db-keeper".into(),
            data_dir,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_hours * 3600)
    }
}

fn parse_secs(var: &str, default: u64) -> Result<u64> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} must be a positive integer, got '{}'", var, raw))),
        Err(_) => Ok(default),
    }
}
