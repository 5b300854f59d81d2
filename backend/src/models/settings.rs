//! Process-wide settings captured by every pipeline run.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gz",
            CompressionAlgorithm::Zstd => "zst",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "gz" => Some(CompressionAlgorithm::Gzip),
            "zst" => Some(CompressionAlgorithm::Zstd),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::Gzip => write!(f, "gzip"),
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionAlgorithm {
    #[serde(alias = "aes256", alias = "aes-256")]
    Aes256Gcm,
    #[serde(alias = "chacha20")]
    ChaCha20Poly1305,
}

/// Where artifact keys are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    #[default]
    MasterKey,
    /// A passphrase kept in settings, so another instance can restore with it alone.
    Passphrase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    pub level: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    pub enabled: bool,
    pub algorithm: EncryptionAlgorithm,
    #[serde(default)]
    pub key_source: KeySource,
    #[serde(default)]
    pub passphrase: Option<String>,
}

redacted_debug!(EncryptionSettings {
    show enabled,
    show algorithm,
    show key_source,
    redact_option passphrase,
});

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            key_source: KeySource::MasterKey,
            passphrase: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Slack,
    Discord,
    Teams,
    Generic,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookChannel {
    pub name: String,
    pub kind: WebhookKind,
    pub webhook_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

redacted_debug!(WebhookChannel {
    show name,
    show kind,
    redact webhook_url,
    show enabled,
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
    #[serde(default)]
    pub channels: Vec<WebhookChannel>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            on_success: false,
            on_failure: true,
            channels: Vec::new(),
        }
    }
}

/// Where the encrypted configuration bundle is pushed to and pulled from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSyncSettings {
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub pull_on_startup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default)]
    pub encryption: EncryptionSettings,
    #[serde(default = "default_true")]
    pub checksum_enabled: bool,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub config_sync: ConfigSyncSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            compression: CompressionSettings::default(),
            encryption: EncryptionSettings::default(),
            checksum_enabled: true,
            notifications: NotificationSettings::default(),
            config_sync: ConfigSyncSettings::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl GlobalSettings {
    pub fn validate(&self) -> Result<()> {
        if !(1..=9).contains(&self.compression.level) {
            return Err(AppError::Config(format!(
                "Compression level must be between 1 and 9, got {}",
                self.compression.level
            )));
        }
        if self.encryption.enabled
            && self.encryption.key_source == KeySource::Passphrase
            && self
                .encryption
                .passphrase
                .as_deref()
                .map_or(true, |p| p.is_empty())
        {
            return Err(AppError::Config(
                "Encryption key source is 'passphrase' but no passphrase is set".into(),
            ));
        }
        for channel in &self.notifications.channels {
            if !channel.webhook_url.starts_with("http://")
                && !channel.webhook_url.starts_with("https://")
            {
                return Err(AppError::Config(format!(
                    "Webhook '{}' must use an http(s) URL",
                    channel.name
                )));
            }
        }
        Ok(())
    }
}
