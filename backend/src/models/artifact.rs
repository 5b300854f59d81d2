//! Backup artifact naming and metadata.
//!
//! An artifact file name is `<database>_<engine>_<UTC timestamp>[_<tag>].<ext>` where
//! `<ext>` is the engine's native extension followed by `.gz`/`.zst` when compressed and
//! `.enc` when encrypted. The name is the recorded transform chain: restore reverses exactly
//! what the name says, whatever the current settings are.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::connection::{sanitize_name, EngineKind};
use super::settings::CompressionAlgorithm;
use crate::error::AppError;

pub const CHECKSUM_EXTENSION: &str = "sha256";
const ENCRYPTED_EXTENSION: &str = "enc";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Transforms applied on top of the raw dump, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransformChain {
    pub compression: Option<CompressionAlgorithm>,
    pub encrypted: bool,
}

/// Parsed artifact file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub database: String,
    pub engine: EngineKind,
    pub timestamp: DateTime<Utc>,
    pub tag: Option<String>,
    /// Native dump extension (`dump`, `sql`, `bak`, `tar`).
    pub base_extension: String,
    pub chain: TransformChain,
}

impl ArtifactName {
    pub fn new(
        database: &str,
        engine: EngineKind,
        timestamp: DateTime<Utc>,
        base_extension: &str,
        chain: TransformChain,
    ) -> Self {
        Self {
            database: sanitize_name(database),
            engine,
            // sub-second precision is not representable in the name
            timestamp: DateTime::from_timestamp(timestamp.timestamp(), 0).unwrap_or(timestamp),
            tag: None,
            base_extension: base_extension.to_string(),
            chain,
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(sanitize_name(tag));
        self
    }

    pub fn extension(&self) -> String {
        let mut ext = self.base_extension.clone();
        if let Some(compression) = self.chain.compression {
            ext.push('.');
            ext.push_str(compression.extension());
        }
        if self.chain.encrypted {
            ext.push('.');
            ext.push_str(ENCRYPTED_EXTENSION);
        }
        ext
    }

    pub fn filename(&self) -> String {
        let mut stem = format!(
            "{}_{}_{}",
            self.database,
            self.engine,
            self.timestamp.format(TIMESTAMP_FORMAT)
        );
        if let Some(tag) = &self.tag {
            stem.push('_');
            stem.push_str(tag);
        }
        format!("{}.{}", stem, self.extension())
    }

    /// Parse a file name produced by [`ArtifactName::filename`]. Returns `None` for
    /// anything else, including checksum sidecars.
    pub fn parse(filename: &str) -> Option<Self> {
        let (stem, ext) = filename.split_once('.')?;
        let mut parts: Vec<&str> = ext.split('.').collect();
        if parts.last() == Some(&CHECKSUM_EXTENSION) {
            return None;
        }

        let mut chain = TransformChain::default();
        if parts.last() == Some(&ENCRYPTED_EXTENSION) {
            chain.encrypted = true;
            parts.pop();
        }
        if let Some(compression) = parts.last().and_then(|p| CompressionAlgorithm::from_extension(p)) {
            chain.compression = Some(compression);
            parts.pop();
        }
        if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        let base_extension = parts.join(".");

        let segments: Vec<&str> = stem.split('_').collect();
        for i in 2..segments.len() {
            let Ok(engine) = segments[i - 1].parse::<EngineKind>() else {
                continue;
            };
            if segments[i - 1] != engine.as_str() {
                continue;
            }
            let Ok(naive) = NaiveDateTime::parse_from_str(segments[i], TIMESTAMP_FORMAT) else {
                continue;
            };
            let database = segments[..i - 1].join("_");
            if database.is_empty() {
                return None;
            }
            let tag = if i + 1 < segments.len() {
                Some(segments[i + 1..].join("_"))
            } else {
                None
            };
            return Some(Self {
                database,
                engine,
                timestamp: naive.and_utc(),
                tag,
                base_extension,
                chain,
            });
        }
        None
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename())
    }
}

/// Name of the checksum sidecar stored next to an artifact.
pub fn sidecar_key(artifact_key: &str) -> String {
    format!("{}.{}", artifact_key, CHECKSUM_EXTENSION)
}

pub fn is_sidecar_key(key: &str) -> bool {
    key.ends_with(&format!(".{}", CHECKSUM_EXTENSION))
}

/// Last path component of a storage key.
pub fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Where an artifact lives: `<target id>:<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub target_id: String,
    pub key: String,
}

impl ArtifactLocation {
    pub fn new(target_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            key: key.into(),
        }
    }

    pub fn filename(&self) -> &str {
        file_name_of(&self.key)
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_id, self.key)
    }
}

impl FromStr for ArtifactLocation {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((target, key)) if !target.is_empty() && !key.is_empty() => {
                Ok(ArtifactLocation::new(target, key))
            }
            _ => Err(AppError::Config(format!(
                "Artifact location must look like '<target>:<key>', got '{}'",
                s
            ))),
        }
    }
}

/// Listing entry for one stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub filename: String,
    pub location: ArtifactLocation,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub engine: Option<EngineKind>,
    pub tag: Option<String>,
    pub compression: Option<CompressionAlgorithm>,
    pub encrypted: bool,
    pub has_checksum: bool,
}

/// `sha256sum`-compatible checksum sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub algorithm: &'static str,
    pub digest: String,
    pub filename: String,
}

impl ChecksumRecord {
    pub fn sha256(digest: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            algorithm: "sha256",
            digest: digest.into(),
            filename: filename.into(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}  {}\n", self.digest, self.filename)
    }

    pub fn parse(content: &str) -> Option<Self> {
        let line = content.lines().find(|l| !l.trim().is_empty())?;
        let mut fields = line.split_whitespace();
        let digest = fields.next()?.to_ascii_lowercase();
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let filename = fields.next().unwrap_or_default().trim_start_matches('*');
        Some(Self::sha256(digest, filename))
    }
}

/// Outcome of `verify_artifact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub location: ArtifactLocation,
    pub valid: bool,
    pub size: u64,
    pub checksum_present: bool,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub errors: Vec<String>,
}
