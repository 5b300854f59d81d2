//! Command-line definitions for db-keeper.

use clap::{Parser, Subcommand};

/// Backup and restore orchestration for relational and document databases
#[derive(Parser, Debug)]
#[command(name = "db-keeper", version)]
#[command(about = "Back up, restore and migrate database dumps", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format (text, json)
    #[arg(long, default_value = "text", global = true)]
    pub format: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the backup scheduler until interrupted
    Run,

    /// Back up a database to its storage targets
    Backup {
        /// Database id
        database: String,
    },

    /// Restore a database from an artifact
    Restore {
        /// Database id
        database: String,

        /// Artifact location as <target>:<key>
        location: String,

        /// Do not back up the current database first
        #[arg(long)]
        skip_safety_snapshot: bool,
    },

    /// List a database's artifacts, newest first
    List {
        /// Database id
        database: String,

        /// Only this storage target
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Check an artifact against its checksum sidecar
    Verify {
        /// Artifact location as <target>:<key>
        location: String,
    },

    /// Delete an artifact and its sidecar
    Delete {
        /// Artifact location as <target>:<key>
        location: String,
    },

    /// Check that the database is reachable with its configured credentials
    TestConnection {
        /// Database id
        database: String,
    },

    /// Move a database's artifacts between storage targets
    Migrate {
        /// Database id
        database: String,

        /// Source target id
        #[arg(long)]
        from: String,

        /// Destination target id
        #[arg(long)]
        to: String,

        /// Keep the artifacts on the source target
        #[arg(long)]
        keep_source: bool,

        /// Only report how much would be moved
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply retention now
    Cleanup {
        /// Database id
        database: String,

        /// Only this storage target
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Push the configuration to the sync target
    ConfigPush {
        /// Storage target id (defaults to the configured sync target)
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Pull the configuration from the sync target
    ConfigPull {
        /// Storage target id (defaults to the configured sync target)
        #[arg(short, long)]
        target: Option<String>,

        /// Apply even when the local configuration is newer
        #[arg(long)]
        force: bool,
    },
}

/// Print a result: the message as text, or the value as JSON.
pub fn output(format: &str, message: &str, json_value: Option<serde_json::Value>) {
    match format {
        "json" => {
            let value = json_value.unwrap_or_else(|| serde_json::json!({ "message": message }));
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        }
        _ => println!("{}", message),
    }
}

/// Print error message
pub fn error(format: &str, message: &str) {
    match format {
        "json" => eprintln!("{}", serde_json::json!({ "error": message })),
        _ => eprintln!("Error: {}", message),
    }
}

/// Print table row
pub fn table_row(cells: &[&str]) {
    println!("{}", cells.join("\t"));
}
