//! SMB/CIFS storage backend driven through the `smbclient` command-line client.
//!
//! Each operation is an independent `smbclient` invocation that authenticates from a
//! short-lived credentials file (mode 0600), so no session or mount outlives a call.
//! Keys use `/`; they are mapped to `\`-separated share paths below `remote_path`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;

use super::retry::RetryConfig;
use super::{spool, spool_target, validate_key, ByteStream, ObjectMeta, SpooledFile, StorageBackend};
use crate::error::{AppError, Result};
use crate::models::storage_target::SmbTargetConfig;

const PARTIAL_SUFFIX: &str = ".partial";

const NOT_FOUND_STATUSES: &[&str] = &[
    "NT_STATUS_NO_SUCH_FILE",
    "NT_STATUS_OBJECT_NAME_NOT_FOUND",
    "NT_STATUS_OBJECT_PATH_NOT_FOUND",
];

const TRANSIENT_STATUSES: &[&str] = &[
    "NT_STATUS_IO_TIMEOUT",
    "NT_STATUS_CONNECTION_REFUSED",
    "NT_STATUS_CONNECTION_RESET",
    "NT_STATUS_CONNECTION_DISCONNECTED",
    "NT_STATUS_HOST_UNREACHABLE",
    "NT_STATUS_NETWORK_UNREACHABLE",
    "NT_STATUS_INSUFF_SERVER_RESOURCES",
];

/// SMB share storage backend
pub struct SmbBackend {
    config: SmbTargetConfig,
    spool_dir: PathBuf,
    retry: RetryConfig,
}

impl SmbBackend {
    pub fn new(config: SmbTargetConfig, spool_dir: PathBuf, retry: RetryConfig) -> Self {
        Self {
            config,
            spool_dir,
            retry,
        }
    }

    fn service(&self) -> String {
        format!("//{}/{}", self.config.server, self.config.share)
    }

    /// Share path for a key, `\`-separated and rooted at `remote_path`.
    fn remote_path(&self, key: &str) -> String {
        share_path(&self.config.remote_path, key)
    }

    /// Write the credentials file consumed by `smbclient -A`.
    fn auth_file(&self) -> Result<Option<tempfile::NamedTempFile>> {
        let Some(username) = &self.config.username else {
            return Ok(None);
        };
        let mut file = tempfile::Builder::new()
            .prefix("smb-auth-")
            .tempfile_in(&self.spool_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        writeln!(file, "username = {}", username)?;
        writeln!(file, "password = {}", self.config.password.as_deref().unwrap_or(""))?;
        if let Some(domain) = &self.config.domain {
            writeln!(file, "domain = {}", domain)?;
        }
        file.flush()?;
        Ok(Some(file))
    }

    /// Run one `smbclient` session executing `commands`; returns its stdout.
    async fn run(&self, commands: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.spool_dir).await?;
        let auth = self.auth_file()?;

        let mut cmd = Command::new("smbclient");
        cmd.arg(self.service());
        match &auth {
            Some(file) => {
                cmd.arg("-A").arg(file.path());
            }
            None => {
                cmd.arg("-N");
            }
        }
        if let Some(port) = self.config.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg("-c").arg(commands);
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::Config("smbclient is not installed or not on PATH".into())
            } else {
                AppError::transient(format!("Failed to run smbclient: {}", e))
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}\n{}", stdout, stderr);
        if !output.status.success() || combined.contains("NT_STATUS_") {
            return Err(classify_output(&self.service(), &combined));
        }
        Ok(stdout)
    }

    async fn run_with_retry(&self, operation: &str, commands: &str) -> Result<String> {
        self.retry.run(operation, || self.run(commands)).await
    }

    /// Create every directory leading to `key`; existing directories are fine.
    async fn ensure_parent_dirs(&self, key: &str) -> Result<()> {
        let mut dirs = Vec::new();
        let mut current = String::new();
        let base = self.config.remote_path.trim_matches(|c| c == '/' || c == '\\');
        let mut parts: Vec<&str> = base.split(['/', '\\']).filter(|p| !p.is_empty()).collect();
        let key_parts: Vec<&str> = key.split('/').collect();
        parts.extend(&key_parts[..key_parts.len().saturating_sub(1)]);
        for part in parts {
            current.push('\\');
            current.push_str(part);
            dirs.push(current.clone());
        }
        for dir in dirs {
            match self.run(&format!("mkdir \"{}\"", dir)).await {
                Ok(_) => {}
                Err(AppError::Storage { message, .. })
                    if message.contains("NT_STATUS_OBJECT_NAME_COLLISION") => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn stat_entry(&self, key: &str) -> Result<ObjectMeta> {
        let remote = self.remote_path(key);
        let stdout = self
            .run_with_retry("SMB stat", &format!("ls \"{}\"", remote))
            .await?;
        let name = crate::models::artifact::file_name_of(key);
        parse_listing(&stdout)
            .into_iter()
            .find(|entry| entry.name == name && !entry.is_dir)
            .map(|entry| ObjectMeta {
                key: key.to_string(),
                size: entry.size,
                last_modified: entry.modified,
            })
            .ok_or_else(|| AppError::NotFound(format!("Storage key not found: {}", key)))
    }
}

/// Only keys that survive `smbclient` command quoting are accepted.
fn validate_share_key(key: &str) -> Result<()> {
    validate_key(key)?;
    if key.contains(['"', ';', '\n']) {
        return Err(AppError::Config(format!("Invalid storage key for SMB '{}'", key)));
    }
    Ok(())
}

fn share_path(base: &str, key: &str) -> String {
    let base = base.trim_matches(|c| c == '/' || c == '\\').replace('/', "\\");
    let key = key.replace('/', "\\");
    if base.is_empty() {
        format!("\\{}", key)
    } else {
        format!("\\{}\\{}", base, key)
    }
}

fn classify_output(service: &str, output: &str) -> AppError {
    let status = output
        .split_whitespace()
        .find(|w| w.starts_with("NT_STATUS_"))
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_'))
        .unwrap_or("");
    let summary = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("smbclient failed");

    if NOT_FOUND_STATUSES.contains(&status) {
        AppError::NotFound(format!("{}: {}", service, status))
    } else if TRANSIENT_STATUSES.contains(&status)
        || (status.is_empty() && output.contains("Connection to"))
    {
        AppError::transient(format!("{}: {}", service, summary))
    } else if status.is_empty() {
        AppError::storage(format!("{}: {}", service, summary))
    } else {
        AppError::storage(format!("{}: {}", service, status))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ListingEntry {
    name: String,
    is_dir: bool,
    size: u64,
    modified: DateTime<Utc>,
}

fn listing_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s+(?P<name>.+?)\s+(?P<attr>[A-Za-z]*)\s+(?P<size>\d+)\s+(?P<date>[A-Z][a-z]{2}\s+[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}\s+\d{4})\s*$",
        )
        .expect("static listing pattern is valid")
    })
}

/// Parse `smbclient ls` output. Times are taken as UTC.
fn parse_listing(output: &str) -> Vec<ListingEntry> {
    output
        .lines()
        .filter_map(|line| {
            let caps = listing_regex().captures(line)?;
            let name = caps["name"].to_string();
            if name == "." || name == ".." {
                return None;
            }
            let date = caps["date"].split_whitespace().collect::<Vec<_>>().join(" ");
            let modified = NaiveDateTime::parse_from_str(&date, "%a %b %d %H:%M:%S %Y")
                .map(|dt| dt.and_utc())
                .unwrap_or_else(|_| Utc::now());
            Some(ListingEntry {
                name,
                is_dir: caps["attr"].contains('D'),
                size: caps["size"].parse().unwrap_or(0),
                modified,
            })
        })
        .collect()
}

#[async_trait]
impl StorageBackend for SmbBackend {
    async fn put(&self, key: &str, content: ByteStream) -> Result<String> {
        validate_share_key(key)?;
        let (spooled, size) = spool(content, &self.spool_dir).await?;
        self.ensure_parent_dirs(key).await?;

        let remote = self.remote_path(key);
        let partial = format!("{}{}", remote, PARTIAL_SUFFIX);
        let local: &Path = &spooled;
        let commands = format!(
            "put \"{}\" \"{}\"; rename \"{}\" \"{}\" -f",
            local.display(),
            partial,
            partial,
            remote
        );
        if let Err(e) = self.run_with_retry("SMB upload", &commands).await {
            // best effort; the partial name is never listed
            let _ = self.run(&format!("del \"{}\"", partial)).await;
            return Err(e);
        }

        tracing::debug!(key = %key, size, "SMB put successful");
        Ok(format!("smb:{}{}", self.service(), remote.replace('\\', "/")))
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        validate_share_key(key)?;
        let target = spool_target(&self.spool_dir).await?;
        let commands = format!("get \"{}\" \"{}\"", self.remote_path(key), target.display());
        self.run_with_retry("SMB download", &commands).await?;
        Ok(Box::new(SpooledFile::open(target).await?))
    }

    async fn list(&self, scope: &str) -> Result<Vec<ObjectMeta>> {
        validate_share_key(scope)?;
        let pattern = format!("{}\\*", self.remote_path(scope));
        let stdout = match self
            .run_with_retry("SMB list", &format!("ls \"{}\"", pattern))
            .await
        {
            Ok(stdout) => stdout,
            Err(AppError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut objects: Vec<ObjectMeta> = parse_listing(&stdout)
            .into_iter()
            .filter(|entry| !entry.is_dir && !entry.name.ends_with(PARTIAL_SUFFIX))
            .map(|entry| ObjectMeta {
                key: format!("{}/{}", scope, entry.name),
                size: entry.size,
                last_modified: entry.modified,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_share_key(key)?;
        self.stat_entry(key).await?;
        self.run_with_retry("SMB delete", &format!("del \"{}\"", self.remote_path(key)))
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_share_key(key)?;
        match self.stat_entry(key).await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn stat(&self, key: &str) -> Result<ObjectMeta> {
        validate_share_key(key)?;
        self.stat_entry(key).await
    }

    fn describe(&self) -> String {
        let base = self.config.remote_path.trim_matches(|c| c == '/' || c == '\\');
        if base.is_empty() {
            format!("smb:{}", self.service())
        } else {
            format!("smb:{}/{}", self.service(), base.replace('\\', "/"))
        }
    }
}
