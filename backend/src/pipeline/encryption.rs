//! Chunked authenticated encryption for artifacts.
//!
//! Layout: a 30 byte header followed by sealed records.
//!
//! ```text
//! "DBKE" | version (1) | algorithm (1) | key source (1) | salt (16) | nonce prefix (7)
//! ```
//!
//! The plaintext is split into 64 KiB chunks. Chunk `i` is sealed with the nonce
//! `prefix || i (u32 BE) || last` and the header as associated data, so reordered,
//! dropped or truncated records fail to open. The cipher and key source are read back
//! from the header; the current settings play no part in decryption.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::io::{self, Read, Write};

use super::pipe::CHUNK_SIZE;
use super::StageFault;
use crate::models::{EncryptionAlgorithm, KeySource};

type HmacSha256 = Hmac<Sha256>;

const MAGIC: &[u8; 4] = b"DBKE";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = 4 + 1 + 1 + 1 + SALT_LEN + NONCE_PREFIX_LEN;
const RECORD_LEN: usize = CHUNK_SIZE + TAG_LEN;
const KDF_CONTEXT: &[u8] = b"db-keeper/artifact-encryption/v1";

/// Key material available to the pipeline.
#[derive(Clone)]
pub struct KeyRing {
    master: [u8; 32],
    passphrase: Option<String>,
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("master", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl KeyRing {
    pub fn new(master: [u8; 32]) -> Self {
        Self {
            master,
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: Option<String>) -> Self {
        self.passphrase = passphrase.filter(|p| !p.is_empty());
        self
    }

    fn derive(&self, source: KeySource, salt: &[u8]) -> io::Result<[u8; 32]> {
        let material: &[u8] = match source {
            KeySource::MasterKey => &self.master,
            KeySource::Passphrase => self
                .passphrase
                .as_deref()
                .map(str::as_bytes)
                .ok_or_else(|| {
                    StageFault::integrity("artifact is passphrase-encrypted but no passphrase is configured")
                })?,
        };
        let mut mac = <HmacSha256 as Mac>::new_from_slice(material)
            .map_err(|_| io::Error::other("invalid key material"))?;
        mac.update(KDF_CONTEXT);
        mac.update(salt);
        Ok(mac.finalize().into_bytes().into())
    }
}

fn algorithm_id(algorithm: EncryptionAlgorithm) -> u8 {
    match algorithm {
        EncryptionAlgorithm::Aes256Gcm => 1,
        EncryptionAlgorithm::ChaCha20Poly1305 => 2,
    }
}

fn key_source_id(source: KeySource) -> u8 {
    match source {
        KeySource::MasterKey => 0,
        KeySource::Passphrase => 1,
    }
}

fn invalid_key() -> io::Error {
    io::Error::other("invalid cipher key length")
}

enum AeadCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    fn new(algorithm: EncryptionAlgorithm, key: &[u8; 32]) -> io::Result<Self> {
        Ok(match algorithm {
            EncryptionAlgorithm::Aes256Gcm => {
                AeadCipher::Aes(Box::new(Aes256Gcm::new_from_slice(key).map_err(|_| invalid_key())?))
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => AeadCipher::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| invalid_key())?,
            )),
        })
    }

    fn seal(&self, nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self {
            AeadCipher::Aes(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            AeadCipher::ChaCha(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        }
        .map_err(|_| io::Error::other("artifact encryption failed"))
    }

    fn open(&self, nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self {
            AeadCipher::Aes(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            AeadCipher::ChaCha(c) => c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        }
        .map_err(|_| StageFault::integrity("decryption failed: wrong key or corrupted artifact"))
    }
}

fn record_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Encrypting writer. Call [`EncryptWriter::finish`] to seal the final record;
/// dropping it without finishing leaves an artifact that will not decrypt.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: AeadCipher,
    header: [u8; HEADER_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    buf: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(
        mut inner: W,
        algorithm: EncryptionAlgorithm,
        source: KeySource,
        keys: &KeyRing,
    ) -> io::Result<Self> {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        rng.fill_bytes(&mut nonce_prefix);

        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(MAGIC);
        header[4] = FORMAT_VERSION;
        header[5] = algorithm_id(algorithm);
        header[6] = key_source_id(source);
        header[7..7 + SALT_LEN].copy_from_slice(&salt);
        header[7 + SALT_LEN..].copy_from_slice(&nonce_prefix);

        let key = keys.derive(source, &salt)?;
        let cipher = AeadCipher::new(algorithm, &key)?;
        inner.write_all(&header)?;

        Ok(Self {
            inner,
            cipher,
            header,
            nonce_prefix,
            counter: 0,
            buf: Vec::with_capacity(CHUNK_SIZE * 2),
        })
    }

    fn seal_chunk(&mut self, len: usize, last: bool) -> io::Result<()> {
        let nonce = record_nonce(&self.nonce_prefix, self.counter, last);
        let sealed = self.cipher.seal(&nonce, &self.buf[..len], &self.header)?;
        self.inner.write_all(&sealed)?;
        self.buf.drain(..len);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("artifact too large for one encryption stream"))?;
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        let len = self.buf.len();
        self.seal_chunk(len, true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        // A full chunk stays buffered until more data arrives; finish() seals the last one.
        while self.buf.len() > CHUNK_SIZE {
            self.seal_chunk(CHUNK_SIZE, false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypting reader over an artifact produced by [`EncryptWriter`].
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: AeadCipher,
    header: [u8; HEADER_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    raw: Vec<u8>,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, keys: &KeyRing) -> io::Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        inner.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StageFault::integrity("encrypted artifact is truncated")
            } else {
                e
            }
        })?;
        if &header[..4] != MAGIC {
            return Err(StageFault::integrity("not an encrypted artifact"));
        }
        if header[4] != FORMAT_VERSION {
            return Err(StageFault::integrity(format!(
                "unsupported encryption format version {}",
                header[4]
            )));
        }
        let algorithm = match header[5] {
            1 => EncryptionAlgorithm::Aes256Gcm,
            2 => EncryptionAlgorithm::ChaCha20Poly1305,
            other => return Err(StageFault::integrity(format!("unknown cipher id {}", other))),
        };
        let source = match header[6] {
            0 => KeySource::MasterKey,
            1 => KeySource::Passphrase,
            other => return Err(StageFault::integrity(format!("unknown key source {}", other))),
        };
        let key = keys.derive(source, &header[7..7 + SALT_LEN])?;
        let cipher = AeadCipher::new(algorithm, &key)?;
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&header[7 + SALT_LEN..]);

        Ok(Self {
            inner,
            cipher,
            header,
            nonce_prefix,
            counter: 0,
            raw: Vec::with_capacity(RECORD_LEN + 1),
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    /// Decrypt the next record into `plain`. A record is the last one exactly when
    /// nothing follows it, so one byte of lookahead is kept between calls.
    fn next_record(&mut self) -> io::Result<()> {
        let want = (RECORD_LEN + 1 - self.raw.len()) as u64;
        (&mut self.inner).take(want).read_to_end(&mut self.raw)?;

        let last = self.raw.len() <= RECORD_LEN;
        let record_len = if last { self.raw.len() } else { RECORD_LEN };
        if record_len < TAG_LEN {
            return Err(StageFault::integrity("encrypted artifact is truncated"));
        }
        let nonce = record_nonce(&self.nonce_prefix, self.counter, last);
        self.plain = self.cipher.open(&nonce, &self.raw[..record_len], &self.header)?;
        self.pos = 0;
        self.raw.drain(..record_len);
        self.counter = self.counter.wrapping_add(1);
        self.done = last;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.plain.len() {
                let n = buf.len().min(self.plain.len() - self.pos);
                buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            self.next_record()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> KeyRing {
        KeyRing::new([7u8; 32])
    }

    fn encrypt(data: &[u8], algorithm: EncryptionAlgorithm, source: KeySource, keys: &KeyRing) -> Vec<u8> {
        let mut writer = EncryptWriter::new(Vec::new(), algorithm, source, keys).unwrap();
        // uneven writes exercise chunk buffering
        for piece in data.chunks(10_007) {
            writer.write_all(piece).unwrap();
        }
        writer.finish().unwrap()
    }

    fn decrypt(data: &[u8], keys: &KeyRing) -> io::Result<Vec<u8>> {
        let mut reader = DecryptReader::new(data, keys)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_round_trip_at_chunk_boundaries() {
        for algorithm in [EncryptionAlgorithm::Aes256Gcm, EncryptionAlgorithm::ChaCha20Poly1305] {
            for len in [0, 1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 3 * CHUNK_SIZE + 5] {
                let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let sealed = encrypt(&data, algorithm, KeySource::MasterKey, &keys());
                assert_eq!(decrypt(&sealed, &keys()).unwrap(), data, "{:?} len {}", algorithm, len);
            }
        }
    }

    #[test]
    fn test_header_records_algorithm() {
        let sealed = encrypt(b"abc", EncryptionAlgorithm::ChaCha20Poly1305, KeySource::MasterKey, &keys());
        assert_eq!(&sealed[..4], MAGIC);
        assert_eq!(sealed[5], 2);
        assert_eq!(sealed.len(), HEADER_LEN + 3 + TAG_LEN);
    }

    #[test]
    fn test_wrong_key_is_integrity_failure() {
        let sealed = encrypt(b"secret rows", EncryptionAlgorithm::Aes256Gcm, KeySource::MasterKey, &keys());
        let err = decrypt(&sealed, &KeyRing::new([8u8; 32])).unwrap_err();
        assert!(StageFault::is_integrity(&err));
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let data = vec![1u8; CHUNK_SIZE * 2];
        let mut sealed = encrypt(&data, EncryptionAlgorithm::Aes256Gcm, KeySource::MasterKey, &keys());
        let idx = sealed.len() / 2;
        sealed[idx] ^= 0x01;
        assert!(StageFault::is_integrity(&decrypt(&sealed, &keys()).unwrap_err()));
    }

    #[test]
    fn test_truncation_at_record_boundary_is_detected() {
        let data = vec![9u8; CHUNK_SIZE * 3];
        let sealed = encrypt(&data, EncryptionAlgorithm::ChaCha20Poly1305, KeySource::MasterKey, &keys());
        let cut = &sealed[..HEADER_LEN + RECORD_LEN];
        assert!(StageFault::is_integrity(&decrypt(cut, &keys()).unwrap_err()));
        assert!(StageFault::is_integrity(&decrypt(&sealed[..10], &keys()).unwrap_err()));
    }

    #[test]
    fn test_passphrase_artifacts_open_on_another_instance() {
        let writer_keys = KeyRing::new([1u8; 32]).with_passphrase(Some("shared secret".into()));
        let sealed = encrypt(b"portable", EncryptionAlgorithm::Aes256Gcm, KeySource::Passphrase, &writer_keys);

        let other = KeyRing::new([2u8; 32]).with_passphrase(Some("shared secret".into()));
        assert_eq!(decrypt(&sealed, &other).unwrap(), b"portable");

        let missing = KeyRing::new([1u8; 32]);
        assert!(StageFault::is_integrity(&decrypt(&sealed, &missing).unwrap_err()));
    }

    #[test]
    fn test_plain_input_rejected() {
        let err = decrypt(&[0u8; 64], &keys()).unwrap_err();
        assert!(StageFault::is_integrity(&err));
    }

    #[test]
    fn test_keyring_debug_redacts() {
        let keys = keys().with_passphrase(Some("hunter2".into()));
        let debug = format!("{:?}", keys);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("7, 7"));
    }
}
