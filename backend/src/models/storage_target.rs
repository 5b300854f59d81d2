//! Storage target records.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Id of the built-in local target rooted at the data directory.
pub const DEFAULT_LOCAL_TARGET: &str = "local";

/// A configured artifact destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageTarget {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub backend: StorageBackendConfig,
}

/// Kind-specific address and credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackendConfig {
    Local(LocalTargetConfig),
    ObjectStore(S3TargetConfig),
    FileShare(SmbTargetConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Local,
    ObjectStore,
    FileShare,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTargetConfig {
    pub path: PathBuf,
}

/// S3-compatible bucket.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct S3TargetConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, Wasabi, ...). Enables path-style addressing.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Static credentials; the default provider chain is used when absent.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

redacted_debug!(S3TargetConfig {
    show bucket,
    show region,
    show endpoint,
    show prefix,
    redact_option access_key_id,
    redact_option secret_access_key,
});

fn default_region() -> String {
    "us-east-1".to_string()
}

/// SMB/CIFS share.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SmbTargetConfig {
    pub server: String,
    pub share: String,
    /// Directory inside the share; `/` or `\` separated.
    #[serde(default)]
    pub remote_path: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

redacted_debug!(SmbTargetConfig {
    show server,
    show share,
    show remote_path,
    show port,
    show domain,
    show username,
    redact_option password,
});

impl StorageTarget {
    pub fn local(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            backend: StorageBackendConfig::Local(LocalTargetConfig { path: path.into() }),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self.backend {
            StorageBackendConfig::Local(_) => TargetKind::Local,
            StorageBackendConfig::ObjectStore(_) => TargetKind::ObjectStore,
            StorageBackendConfig::FileShare(_) => TargetKind::FileShare,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.kind() != TargetKind::Local
    }
}
