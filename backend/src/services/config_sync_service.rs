//! Pushing and pulling the configuration document through a storage target.
//!
//! The bundle is the sealed document (secrets still field-encrypted) plus export
//! metadata, encrypted as a whole under the master key. Instances sharing a master
//! key can adopt each other's configuration. Newer `updated_at` wins unless forced.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config_store::{ConfigDocument, ConfigStore};
use crate::error::{AppError, Result};
use crate::storage::StorageBackend;

/// Storage key of the configuration bundle.
pub const BUNDLE_KEY: &str = "db-keeper-config/bundle.enc";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub exported_at: DateTime<Utc>,
    pub hostname: String,
    pub version: String,
    pub document: ConfigDocument,
}

/// Metadata of a pushed or fetched bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub exported_at: DateTime<Utc>,
    pub hostname: String,
    pub version: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullOutcome {
    pub applied: bool,
    pub remote: BundleInfo,
    pub local_updated_at: Option<DateTime<Utc>>,
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

impl ConfigBundle {
    fn info(&self) -> BundleInfo {
        BundleInfo {
            exported_at: self.exported_at,
            hostname: self.hostname.clone(),
            version: self.version.clone(),
            updated_at: self.document.updated_at,
        }
    }
}

/// Encrypt the current configuration and store it on `backend`.
pub async fn push(store: &ConfigStore, backend: &dyn StorageBackend) -> Result<BundleInfo> {
    let bundle = ConfigBundle {
        exported_at: Utc::now(),
        hostname: hostname(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        document: store.snapshot().await.sealed(store.cipher())?,
    };
    let plaintext = serde_json::to_vec(&bundle)?;
    let sealed = store.cipher().encrypt(&plaintext)?;
    backend.put_bytes(BUNDLE_KEY, Bytes::from(sealed)).await?;
    tracing::info!(
        backend = %backend.describe(),
        databases = bundle.document.databases.len(),
        "Configuration pushed"
    );
    Ok(bundle.info())
}

/// Fetch and decrypt the bundle on `backend`.
pub async fn fetch(store: &ConfigStore, backend: &dyn StorageBackend) -> Result<ConfigBundle> {
    let sealed = match backend.get_bytes(BUNDLE_KEY).await {
        Ok(sealed) => sealed,
        Err(AppError::NotFound(_)) => {
            return Err(AppError::NotFound(format!(
                "No configuration bundle on {}",
                backend.describe()
            )))
        }
        Err(e) => return Err(e),
    };
    let plaintext = store.cipher().decrypt(&sealed).map_err(|_| {
        AppError::Integrity("Configuration bundle could not be decrypted; master keys differ or it is corrupt".into())
    })?;
    let mut bundle: ConfigBundle = serde_json::from_slice(&plaintext)?;
    bundle.document = bundle.document.unsealed(store.cipher())?;
    Ok(bundle)
}

/// Adopt the remote configuration when it is newer than the local one, or always
/// when `force` is set. The replaced local file is kept as `.bak`.
pub async fn pull(store: &ConfigStore, backend: &dyn StorageBackend, force: bool) -> Result<PullOutcome> {
    let bundle = fetch(store, backend).await?;
    let local_updated_at = store.snapshot().await.updated_at;
    let remote_updated_at = bundle.document.updated_at;

    let newer = match (remote_updated_at, local_updated_at) {
        (Some(remote), Some(local)) => remote > local,
        (Some(_), None) => true,
        (None, _) => false,
    };
    let info = bundle.info();
    if !(force || newer) {
        tracing::info!(
            remote = ?remote_updated_at,
            local = ?local_updated_at,
            "Local configuration is as new as the remote bundle; not applied"
        );
        return Ok(PullOutcome {
            applied: false,
            remote: info,
            local_updated_at,
        });
    }

    store.replace(bundle.document).await?;
    tracing::info!(
        from_host = %info.hostname,
        exported_at = %info.exported_at,
        forced = force,
        "Configuration pulled"
    );
    Ok(PullOutcome {
        applied: true,
        remote: info,
        local_updated_at,
    })
}
