//! Master key handling and at-rest encryption of configuration secrets.
//!
//! Sensitive configuration fields are stored as `enc:v1:<base64(nonce || ciphertext)>`
//! using AES-256-GCM under the master key. The master key comes from
//! `DBKEEPER_MASTER_KEY` or from a key file that only its owner may read.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::path::Path;
use thiserror::Error;

use crate::config::Config;
use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix marking an encrypted configuration value.
pub const ENCRYPTED_PREFIX: &str = "enc:v1:";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors that can occur during encryption operations
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("Invalid ciphertext encoding")]
    InvalidEncoding,

    #[error("Decryption failed: wrong master key or corrupted data")]
    DecryptionFailed,
}

impl From<EncryptionError> for AppError {
    fn from(err: EncryptionError) -> Self {
        match err {
            EncryptionError::InvalidKeyLength(_) => AppError::Config(err.to_string()),
            _ => AppError::Integrity(err.to_string()),
        }
    }
}

/// Derive a 32-byte key from a passphrase using HMAC-SHA256 with a fixed
/// application context as the message.
fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(passphrase.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(b"db-keeper/master-key/v1");
    mac.finalize().into_bytes().into()
}

/// Interpret master key material: base64 of exactly 32 bytes is used as-is,
/// anything else is treated as a passphrase.
pub fn master_key_from_material(material: &str) -> [u8; 32] {
    let trimmed = material.trim();
    if let Ok(decoded) = STANDARD.decode(trimmed) {
        if let Ok(key) = <[u8; 32]>::try_from(decoded.as_slice()) {
            return key;
        }
    }
    derive_key(trimmed)
}

/// Load the master key: environment first, then the key file, generating the
/// file on first use.
pub fn load_master_key(config: &Config) -> Result<[u8; 32]> {
    if let Some(material) = &config.master_key {
        tracing::debug!("Using master key from environment");
        return Ok(master_key_from_material(material));
    }
    read_or_create_key_file(&config.key_file)
}

fn read_or_create_key_file(path: &Path) -> Result<[u8; 32]> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            check_key_file_permissions(path)?;
            Ok(master_key_from_material(&content))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(path)?;
            std::io::Write::write_all(&mut file, STANDARD.encode(key).as_bytes())?;
            file.sync_all()?;
            tracing::info!(path = %path.display(), "Generated new master key file");
            Ok(key)
        }
        Err(e) => Err(AppError::Config(format!(
            "Cannot read key file {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(unix)]
fn check_key_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(AppError::Config(format!(
            "Key file {} is accessible by group or others (mode {:o}); run chmod 600",
            path.display(),
            mode & 0o777
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// AES-256-GCM authenticated encryption for configuration secrets.
///
/// Ciphertext format: nonce (12 bytes) || AES-GCM ciphertext+tag
#[derive(Clone)]
pub struct CredentialEncryption {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEncryption")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl CredentialEncryption {
    /// Key must be exactly 32 bytes.
    pub fn new(key: &[u8]) -> std::result::Result<Self, EncryptionError> {
        let key: [u8; 32] = key
            .try_into()
            .map_err(|_| EncryptionError::InvalidKeyLength(key.len()))?;
        Ok(Self { key })
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            key: derive_key(passphrase),
        }
    }

    pub fn key(&self) -> [u8; 32] {
        self.key
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.key.into())
    }

    /// Returns: nonce (12 bytes) || ciphertext+tag
    pub fn encrypt(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, EncryptionError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| EncryptionError::DecryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> std::result::Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::DecryptionFailed)
    }

    /// Encrypt a configuration value into its `enc:v1:` form. Already encrypted
    /// values are returned unchanged.
    pub fn encrypt_field(&self, value: &str) -> std::result::Result<String, EncryptionError> {
        if is_encrypted(value) {
            return Ok(value.to_string());
        }
        let sealed = self.encrypt(value.as_bytes())?;
        Ok(format!("{}{}", ENCRYPTED_PREFIX, STANDARD.encode(sealed)))
    }

    /// Decrypt an `enc:v1:` value. Plain values pass through, so hand-edited
    /// configuration can hold cleartext until the next save.
    pub fn decrypt_field(&self, value: &str) -> std::result::Result<String, EncryptionError> {
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(value.to_string());
        };
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|_| EncryptionError::InvalidEncoding)?;
        let plaintext = self.decrypt(&sealed)?;
        String::from_utf8(plaintext).map_err(|_| EncryptionError::DecryptionFailed)
    }
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}
