//! MySQL and MariaDB via `mysqldump` / `mysql`.
//!
//! Both engines share client tooling and wire options; they differ only in the
//! engine tag recorded in artifact names.

use std::path::Path;

use super::{
    host, require_host_and_credentials, DumpOutput, DumpPlan, ProgressSignal, ProviderAdapter,
    RestoreInput, RestorePlan, ToolCommand,
};
use crate::error::Result;
use crate::models::{DatabaseConnection, EngineKind};

pub struct MysqlAdapter {
    engine: EngineKind,
}

impl MysqlAdapter {
    pub fn mysql() -> Self {
        Self {
            engine: EngineKind::Mysql,
        }
    }

    pub fn mariadb() -> Self {
        Self {
            engine: EngineKind::Mariadb,
        }
    }

    fn base_command(program: &str, db: &DatabaseConnection) -> ToolCommand {
        let params = &db.connection;
        let mut cmd = ToolCommand::new(program)
            .args(["-h", host(db)])
            .args(["-P".to_string(), db.port().to_string()])
            .arg("--protocol=TCP");
        if let Some(user) = &params.username {
            cmd = cmd.args(["-u", user.as_str()]);
        }
        // MYSQL_PWD keeps the password out of the process table
        if let Some(password) = &params.password {
            cmd = cmd.env("MYSQL_PWD", password.as_str());
        }
        cmd
    }
}

impl ProviderAdapter for MysqlAdapter {
    fn engine(&self) -> EngineKind {
        self.engine
    }

    fn validate(&self, db: &DatabaseConnection) -> Result<()> {
        require_host_and_credentials(db)
    }

    fn build_dump_command(&self, db: &DatabaseConnection, _workdir: &Path) -> Result<DumpPlan> {
        self.validate(db)?;
        let command = Self::base_command("mysqldump", db)
            .args(["--single-transaction", "--routines", "--triggers", "--verbose"])
            .args(["--databases", db.target_database()]);
        Ok(DumpPlan {
            command,
            output: DumpOutput::Stdout,
            base_extension: "sql".to_string(),
        })
    }

    fn build_restore_command(
        &self,
        db: &DatabaseConnection,
        _base_extension: &str,
        _workdir: &Path,
    ) -> Result<RestorePlan> {
        self.validate(db)?;
        Ok(RestorePlan {
            command: Self::base_command("mysql", db).arg(db.target_database()),
            input: RestoreInput::Stdin,
        })
    }

    fn build_test_command(&self, db: &DatabaseConnection, _workdir: &Path) -> Result<ToolCommand> {
        self.validate(db)?;
        Ok(Self::base_command("mysql", db)
            .args(["-N", "-e", "SELECT 1"])
            .arg(db.target_database()))
    }

    fn parse_progress(&self, line: &str) -> Option<ProgressSignal> {
        let line = line.trim().strip_prefix("-- ")?;
        if let Some(rest) = line.strip_prefix("Retrieving table structure for table ") {
            return Some(ProgressSignal::step(format!("Dumping table {}", table_name(rest))));
        }
        if line.starts_with("Sending SELECT query") {
            return Some(ProgressSignal::step("Reading rows"));
        }
        if line.starts_with("Dumping routines") {
            return Some(ProgressSignal::step("Dumping routines"));
        }
        if line.starts_with("Disconnecting from") {
            return Some(ProgressSignal::step("Finishing dump"));
        }
        None
    }
}

fn table_name(rest: &str) -> &str {
    rest.trim_end_matches("...").trim_matches('`')
}
