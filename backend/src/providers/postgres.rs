//! PostgreSQL via `pg_dump` / `pg_restore` / `psql`.

use std::path::Path;

use super::{
    host, require_host_and_credentials, DumpOutput, DumpPlan, ProgressSignal, ProviderAdapter,
    RestoreInput, RestorePlan, ToolCommand,
};
use crate::error::Result;
use crate::models::{DatabaseConnection, EngineKind};

/// Custom-format archives; plain SQL artifacts go through `psql` instead.
const CUSTOM_FORMAT_EXTENSION: &str = "dump";

pub struct PostgresAdapter;

impl PostgresAdapter {
    pub fn new() -> Self {
        Self
    }

    fn base_command(program: &str, db: &DatabaseConnection) -> ToolCommand {
        let params = &db.connection;
        let mut cmd = ToolCommand::new(program)
            .args(["-h", host(db)])
            .args(["-p".to_string(), db.port().to_string()]);
        if let Some(user) = &params.username {
            cmd = cmd.args(["-U", user.as_str()]);
        }
        // never prompt; a missing password must fail instead of hanging
        cmd = cmd.arg("--no-password");
        if let Some(password) = &params.password {
            cmd = cmd.env("PGPASSWORD", password.as_str());
        }
        cmd
    }
}

impl Default for PostgresAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for PostgresAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Postgres
    }

    fn validate(&self, db: &DatabaseConnection) -> Result<()> {
        require_host_and_credentials(db)
    }

    fn build_dump_command(&self, db: &DatabaseConnection, _workdir: &Path) -> Result<DumpPlan> {
        self.validate(db)?;
        let command = Self::base_command("pg_dump", db)
            .args(["-Fc", "--verbose"])
            .arg(db.target_database());
        Ok(DumpPlan {
            command,
            output: DumpOutput::Stdout,
            base_extension: CUSTOM_FORMAT_EXTENSION.to_string(),
        })
    }

    fn build_restore_command(
        &self,
        db: &DatabaseConnection,
        base_extension: &str,
        _workdir: &Path,
    ) -> Result<RestorePlan> {
        self.validate(db)?;
        let command = if base_extension == CUSTOM_FORMAT_EXTENSION {
            Self::base_command("pg_restore", db)
                .args(["--clean", "--if-exists", "--no-owner", "--verbose"])
                .args(["-d", db.target_database()])
        } else {
            Self::base_command("psql", db)
                .args(["-v", "ON_ERROR_STOP=1", "-q"])
                .args(["-d", db.target_database()])
        };
        Ok(RestorePlan {
            command,
            input: RestoreInput::Stdin,
        })
    }

    fn build_test_command(&self, db: &DatabaseConnection, _workdir: &Path) -> Result<ToolCommand> {
        self.validate(db)?;
        Ok(Self::base_command("psql", db)
            .args(["-d", db.target_database()])
            .args(["-tA", "-c", "SELECT 1"]))
    }

    fn parse_progress(&self, line: &str) -> Option<ProgressSignal> {
        let line = line.trim();
        let rest = line
            .strip_prefix("pg_dump: ")
            .or_else(|| line.strip_prefix("pg_restore: "))?;

        if let Some(table) = rest.strip_prefix("dumping contents of table ") {
            return Some(ProgressSignal::step(format!("Dumping table {}", table.trim_matches('"'))));
        }
        if let Some(table) = rest.strip_prefix("processing data for table ") {
            return Some(ProgressSignal::step(format!("Restoring table {}", table.trim_matches('"'))));
        }
        if rest.starts_with("reading schemas") || rest.starts_with("reading user-defined tables") {
            return Some(ProgressSignal::step("Reading catalog"));
        }
        if rest.starts_with("creating INDEX") || rest.starts_with("creating CONSTRAINT") {
            return Some(ProgressSignal::step("Rebuilding indexes and constraints"));
        }
        None
    }

    fn restore_failure_tolerated(&self, exit_code: Option<i32>, stderr: &str) -> bool {
        // pg_restore exits 1 when --clean drops objects that were never there
        exit_code == Some(1) && stderr.contains("errors ignored on restore")
    }
}
