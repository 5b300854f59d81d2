//! SQL Server via `sqlcmd` running native `BACKUP DATABASE` / `RESTORE DATABASE`.
//!
//! The server process writes and reads the `.bak` file itself, so the file must live
//! in a directory both the server and this process can reach (`server_backup_dir`).
//! Without one the adapter falls back to the local scratch directory, which only
//! works when the server runs on the same host.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::{
    host, require_host_and_credentials, DumpOutput, DumpPlan, ProgressSignal, ProviderAdapter,
    RestoreInput, RestorePlan, ToolCommand,
};
use crate::error::Result;
use crate::models::{DatabaseConnection, EngineKind};

pub struct SqlServerAdapter;

fn percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,3}) percent processed\.?$").expect("valid regex"))
}

/// Quote an identifier for T-SQL (`[name]`).
fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Quote a string literal for T-SQL (`N'...'`).
fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

impl SqlServerAdapter {
    pub fn new() -> Self {
        Self
    }

    fn base_command(db: &DatabaseConnection) -> ToolCommand {
        let params = &db.connection;
        let mut cmd = ToolCommand::new("sqlcmd")
            .args(["-S".to_string(), format!("{},{}", host(db), db.port())])
            // -b: non-zero exit on SQL errors, -C: trust the server certificate
            .args(["-b", "-C", "-d", "master"]);
        if params.trusted_auth {
            cmd = cmd.arg("-E");
        } else {
            if let Some(user) = &params.username {
                cmd = cmd.args(["-U", user.as_str()]);
            }
            if let Some(password) = &params.password {
                cmd = cmd.env("SQLCMDPASSWORD", password.as_str());
            }
        }
        cmd
    }

    fn backup_file(db: &DatabaseConnection, workdir: &Path) -> PathBuf {
        let dir = db
            .connection
            .server_backup_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| workdir.to_path_buf());
        dir.join(format!("{}-{}.bak", db.scope(), uuid::Uuid::new_v4().simple()))
    }
}

impl Default for SqlServerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for SqlServerAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlserver
    }

    fn validate(&self, db: &DatabaseConnection) -> Result<()> {
        require_host_and_credentials(db)
    }

    fn build_dump_command(&self, db: &DatabaseConnection, workdir: &Path) -> Result<DumpPlan> {
        self.validate(db)?;
        let file = Self::backup_file(db, workdir);
        let query = format!(
            "BACKUP DATABASE {} TO DISK = {} WITH INIT, COPY_ONLY, STATS = 10",
            quote_ident(db.target_database()),
            quote_literal(&file.to_string_lossy())
        );
        Ok(DumpPlan {
            command: Self::base_command(db).args(["-Q".to_string(), query]),
            output: DumpOutput::File(file),
            base_extension: "bak".to_string(),
        })
    }

    fn build_restore_command(
        &self,
        db: &DatabaseConnection,
        _base_extension: &str,
        workdir: &Path,
    ) -> Result<RestorePlan> {
        self.validate(db)?;
        let file = Self::backup_file(db, workdir);
        let query = format!(
            "RESTORE DATABASE {} FROM DISK = {} WITH REPLACE, STATS = 10",
            quote_ident(db.target_database()),
            quote_literal(&file.to_string_lossy())
        );
        Ok(RestorePlan {
            command: Self::base_command(db).args(["-Q".to_string(), query]),
            input: RestoreInput::File(file),
        })
    }

    fn build_test_command(&self, db: &DatabaseConnection, _workdir: &Path) -> Result<ToolCommand> {
        self.validate(db)?;
        Ok(Self::base_command(db).args(["-Q", "SELECT 1"]))
    }

    fn parse_progress(&self, line: &str) -> Option<ProgressSignal> {
        let line = line.trim();
        if let Some(caps) = percent_regex().captures(line) {
            let pct: u8 = caps[1].parse().ok()?;
            return Some(ProgressSignal::percent(pct));
        }
        if line.starts_with("BACKUP DATABASE successfully processed") {
            return Some(ProgressSignal::step("Backup written by server"));
        }
        if line.starts_with("RESTORE DATABASE successfully processed") {
            return Some(ProgressSignal::step("Restore applied by server"));
        }
        None
    }
}
