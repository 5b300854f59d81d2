//! Streaming transform pipeline.
//!
//! Backup: raw dump -> [compress] -> [encrypt] -> SHA-256 + fan-out to storage sinks.
//! Restore: staged artifact (checksum verified) -> [decrypt] -> [decompress] -> restore tool.
//!
//! Stages are synchronous `Read`/`Write` adapters run on blocking threads and joined to
//! the async side through bounded [`pipe`]s, so a slow sink throttles the dump tool.

pub mod archive;
pub mod checksum;
pub mod compression;
pub mod encryption;
pub mod pipe;

use std::io::{self, Read, Write};
use thiserror::Error;

use crate::error::AppError;
use crate::models::{
    CompressionAlgorithm, EncryptionAlgorithm, GlobalSettings, KeySource, TransformChain,
};

pub use checksum::{Checksummed, FanOut, StagedFile};
pub use encryption::{DecryptReader, EncryptWriter, KeyRing};
pub use pipe::{pipe, PipeReader, PipeWriter, CHUNK_SIZE, DEFAULT_CAPACITY};

/// Error payload carried inside `io::Error` between stages.
#[derive(Debug, Error)]
pub enum StageFault {
    /// Authentication, checksum or format failure on artifact bytes.
    #[error("{0}")]
    Integrity(String),
    /// An earlier stage failed; this error only relays it.
    #[error("upstream stage failed: {0}")]
    Upstream(String),
}

impl StageFault {
    pub fn integrity(message: impl Into<String>) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, StageFault::Integrity(message.into()))
    }

    pub fn upstream(cause: &io::Error) -> io::Error {
        let message = match Self::of(cause) {
            Some(StageFault::Upstream(inner)) => inner.clone(),
            _ => cause.to_string(),
        };
        io::Error::other(StageFault::Upstream(message))
    }

    fn of(err: &io::Error) -> Option<&StageFault> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<StageFault>())
    }

    pub fn is_upstream(err: &io::Error) -> bool {
        matches!(Self::of(err), Some(StageFault::Upstream(_)))
    }

    pub fn is_integrity(err: &io::Error) -> bool {
        matches!(Self::of(err), Some(StageFault::Integrity(_)))
    }
}

/// Convert a stage error into the crate taxonomy.
pub fn stage_error(err: io::Error) -> AppError {
    match StageFault::of(&err) {
        Some(StageFault::Integrity(message)) => AppError::Integrity(message.clone()),
        _ => AppError::Io(err),
    }
}

/// Whether `err` merely reflects another stage's failure.
pub fn is_secondary(err: &AppError) -> bool {
    match err {
        AppError::Io(e) => StageFault::is_upstream(e) || e.kind() == io::ErrorKind::BrokenPipe,
        _ => false,
    }
}

/// Pick the error that explains a failed run. `errors` must be in pipeline order
/// (source first); relayed and broken-pipe errors lose to the failure that caused them.
pub fn root_cause(errors: impl IntoIterator<Item = AppError>) -> Option<AppError> {
    let mut fallback = None;
    for err in errors {
        if !is_secondary(&err) {
            return Some(err);
        }
        fallback.get_or_insert(err);
    }
    fallback
}

/// Run a blocking stage, surfacing a panic as an error.
pub async fn run_blocking<T, F>(stage: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(stage).await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(format!("pipeline stage aborted: {}", e))),
    }
}

/// Transforms captured from settings when a backup starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePlan {
    pub compression: Option<(CompressionAlgorithm, u32)>,
    pub encryption: Option<(EncryptionAlgorithm, KeySource)>,
}

impl EncodePlan {
    pub fn from_settings(settings: &GlobalSettings) -> Self {
        Self {
            compression: settings
                .compression
                .enabled
                .then_some((settings.compression.algorithm, settings.compression.level)),
            encryption: settings
                .encryption
                .enabled
                .then_some((settings.encryption.algorithm, settings.encryption.key_source)),
        }
    }

    pub fn chain(&self) -> TransformChain {
        TransformChain {
            compression: self.compression.map(|(algorithm, _)| algorithm),
            encrypted: self.encryption.is_some(),
        }
    }
}

/// Encode `source` into every sink. On failure each sink receives the error instead
/// of a clean end of stream, so no backend finalizes a partial artifact.
pub fn encode<R: Read>(
    plan: &EncodePlan,
    keys: &KeyRing,
    source: &mut R,
    sinks: Vec<PipeWriter>,
) -> io::Result<Checksummed> {
    let guards = sinks.clone();
    let result = encode_into(plan, keys, source, FanOut::new(sinks));
    if let Err(e) = &result {
        for sink in &guards {
            sink.fail(e);
        }
    }
    result
}

fn encode_into<R: Read>(
    plan: &EncodePlan,
    keys: &KeyRing,
    source: &mut R,
    fanout: FanOut,
) -> io::Result<Checksummed> {
    let fanout = match (plan.compression, plan.encryption) {
        (Some((algorithm, level)), Some((cipher, key_source))) => {
            let sealed = EncryptWriter::new(fanout, cipher, key_source, keys)?;
            compression::compress(algorithm, level, source, sealed)?.finish()?
        }
        (None, Some((cipher, key_source))) => {
            let mut sealed = EncryptWriter::new(fanout, cipher, key_source, keys)?;
            io::copy(source, &mut sealed)?;
            sealed.finish()?
        }
        (Some((algorithm, level)), None) => compression::compress(algorithm, level, source, fanout)?,
        (None, None) => {
            let mut fanout = fanout;
            io::copy(source, &mut fanout)?;
            fanout
        }
    };
    Ok(fanout.finish())
}

/// Writer that remembers whether it was the side that failed.
struct TrackedWriter<'a, W: Write> {
    inner: &'a mut W,
    failed: bool,
}

impl<W: Write> Write for TrackedWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).inspect_err(|_| self.failed = true)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().inspect_err(|_| self.failed = true)
    }
}

/// Reverse the transforms named by `chain`. Undecodable input is an integrity
/// failure; errors writing to `output` are returned unchanged.
pub fn decode<R: Read, W: Write>(
    chain: TransformChain,
    keys: &KeyRing,
    input: R,
    output: &mut W,
) -> io::Result<u64> {
    let mut tracked = TrackedWriter {
        inner: output,
        failed: false,
    };
    let result = match (chain.encrypted, chain.compression) {
        (true, Some(algorithm)) => DecryptReader::new(input, keys)
            .and_then(|reader| compression::decompress(algorithm, reader, &mut tracked)),
        (true, None) => {
            DecryptReader::new(input, keys).and_then(|mut reader| io::copy(&mut reader, &mut tracked))
        }
        (false, Some(algorithm)) => compression::decompress(algorithm, input, &mut tracked),
        (false, None) => {
            let mut input = input;
            io::copy(&mut input, &mut tracked)
        }
    };
    let written_failed = tracked.failed;
    let written = result.map_err(|e| {
        if written_failed || StageFault::is_upstream(&e) || StageFault::is_integrity(&e) {
            e
        } else {
            StageFault::integrity(format!("artifact could not be decoded: {}", e))
        }
    })?;
    tracked.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::CompressionSettings;

    fn keys() -> KeyRing {
        KeyRing::new([3u8; 32])
    }

    fn dump() -> Vec<u8> {
        (0..50_000u32)
            .flat_map(|i| format!("COPY public.orders {};\n", i).into_bytes())
            .collect()
    }

    async fn encode_to_vec(plan: EncodePlan, data: Vec<u8>) -> (Vec<u8>, Checksummed) {
        let (tx, mut rx) = pipe(DEFAULT_CAPACITY);
        let encoder = run_blocking(move || encode(&plan, &keys(), &mut data.as_slice(), vec![tx]));
        let collector = run_blocking(move || {
            let mut out = Vec::new();
            rx.read_to_end(&mut out)?;
            Ok(out)
        });
        let (encoded, stored) = tokio::join!(encoder, collector);
        (stored.unwrap(), encoded.unwrap())
    }

    #[tokio::test]
    async fn test_every_chain_round_trips() {
        let plans = [
            EncodePlan { compression: None, encryption: None },
            EncodePlan { compression: Some((CompressionAlgorithm::Gzip, 6)), encryption: None },
            EncodePlan {
                compression: None,
                encryption: Some((EncryptionAlgorithm::ChaCha20Poly1305, KeySource::MasterKey)),
            },
            EncodePlan {
                compression: Some((CompressionAlgorithm::Zstd, 3)),
                encryption: Some((EncryptionAlgorithm::Aes256Gcm, KeySource::MasterKey)),
            },
        ];
        let data = dump();
        for plan in plans {
            let (stored, summary) = encode_to_vec(plan, data.clone()).await;
            assert_eq!(summary.size, stored.len() as u64);

            let mut restored = Vec::new();
            decode(plan.chain(), &keys(), stored.as_slice(), &mut restored).unwrap();
            assert_eq!(restored, data, "{:?}", plan);
        }
    }

    #[tokio::test]
    async fn test_checksum_covers_stored_bytes() {
        let plan = EncodePlan { compression: Some((CompressionAlgorithm::Gzip, 1)), encryption: None };
        let (stored, summary) = encode_to_vec(plan, dump()).await;
        let stream: crate::storage::ByteStream = Box::new(std::io::Cursor::new(stored));
        assert_eq!(checksum::hash_stream(stream).await.unwrap(), summary);
    }

    #[tokio::test]
    async fn test_source_failure_reaches_sinks_as_error() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("dump tool crashed"))
            }
        }
        let (tx, mut rx) = pipe(4);
        let plan = EncodePlan { compression: None, encryption: None };
        let encoder = run_blocking(move || encode(&plan, &keys(), &mut Broken, vec![tx]));
        let collector = run_blocking(move || {
            let mut out = Vec::new();
            rx.read_to_end(&mut out)
        });
        let (encoded, stored) = tokio::join!(encoder, collector);
        assert!(encoded.is_err());
        assert!(StageFault::is_upstream(&stored.unwrap_err()));
    }

    #[test]
    fn test_corrupt_compressed_input_is_integrity() {
        let mut out = Vec::new();
        let chain = TransformChain { compression: Some(CompressionAlgorithm::Gzip), encrypted: false };
        let err = decode(chain, &keys(), &b"definitely not gzip"[..], &mut out).unwrap_err();
        assert!(matches!(stage_error(err), AppError::Integrity(_)));
    }

    #[test]
    fn test_output_failure_is_not_integrity() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "restore tool exited"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let err = decode(TransformChain::default(), &keys(), &b"rows"[..], &mut Closed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(is_secondary(&stage_error(err)));
    }

    #[test]
    fn test_root_cause_prefers_primary_failure() {
        let relayed = AppError::Io(StageFault::upstream(&io::Error::other("boom")));
        let broken = AppError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        let tool = AppError::ToolExecution {
            tool: "pg_dump".into(),
            exit_code: Some(1),
            stderr: "no such database".into(),
        };
        let cause = root_cause(vec![broken, relayed, tool]).unwrap();
        assert!(matches!(cause, AppError::ToolExecution { .. }));

        let only_relayed = root_cause(vec![AppError::Io(StageFault::upstream(&io::Error::other("x")))]);
        assert!(only_relayed.is_some());
        assert!(root_cause(Vec::new()).is_none());
    }

    #[test]
    fn test_plan_from_settings() {
        let mut settings = GlobalSettings::default();
        settings.compression = CompressionSettings {
            enabled: true,
            algorithm: CompressionAlgorithm::Zstd,
            level: 9,
        };
        settings.encryption.enabled = true;
        let plan = EncodePlan::from_settings(&settings);
        assert_eq!(plan.compression, Some((CompressionAlgorithm::Zstd, 9)));
        assert_eq!(
            plan.chain(),
            TransformChain { compression: Some(CompressionAlgorithm::Zstd), encrypted: true }
        );

        settings.compression.enabled = false;
        settings.encryption.enabled = false;
        assert_eq!(EncodePlan::from_settings(&settings).chain(), TransformChain::default());
    }
}
