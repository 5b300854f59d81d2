//! SHA-256 accumulation over the exact bytes handed to storage.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::pipe::{PipeWriter, CHUNK_SIZE};
use crate::error::Result;
use crate::storage::ByteStream;

/// Final stage of the backup pipeline: hashes every byte and copies it to each
/// storage sink. A sink whose consumer failed is dropped; the others keep going.
pub struct FanOut {
    sinks: Vec<Option<PipeWriter>>,
    hasher: Sha256,
    size: u64,
}

/// Digest and size of the bytes that passed through a [`FanOut`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksummed {
    pub digest: String,
    pub size: u64,
}

impl FanOut {
    pub fn new(sinks: Vec<PipeWriter>) -> Self {
        Self {
            sinks: sinks.into_iter().map(Some).collect(),
            hasher: Sha256::new(),
            size: 0,
        }
    }

    pub fn finish(self) -> Checksummed {
        Checksummed {
            digest: format!("{:x}", self.hasher.finalize()),
            size: self.size,
        }
    }
}

impl Write for FanOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.hasher.update(buf);
        self.size += buf.len() as u64;

        let chunk = Bytes::copy_from_slice(buf);
        for slot in self.sinks.iter_mut() {
            if let Some(sink) = slot {
                if sink.blocking_send(chunk.clone()).is_err() {
                    tracing::debug!("Storage sink closed early, continuing with the remaining sinks");
                    *slot = None;
                }
            }
        }
        if !self.sinks.is_empty() && self.sinks.iter().all(Option::is_none) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "every storage sink closed",
            ));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hash a whole stream without keeping it.
pub async fn hash_stream(mut stream: ByteStream) -> Result<Checksummed> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(Checksummed {
        digest: format!("{:x}", hasher.finalize()),
        size,
    })
}

/// A downloaded artifact sitting in local staging space.
pub struct StagedFile {
    pub path: tempfile::TempPath,
    pub checksum: Checksummed,
}

/// Copy a stream into a staging file under `dir`, hashing as it goes.
pub async fn stage_to_file(mut stream: ByteStream, dir: &Path) -> Result<StagedFile> {
    tokio::fs::create_dir_all(dir).await?;
    let (file, path) = tempfile::Builder::new()
        .prefix("staged-")
        .tempfile_in(dir)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    file.flush().await?;

    Ok(StagedFile {
        path,
        checksum: Checksummed {
            digest: format!("{:x}", hasher.finalize()),
            size,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pipe::pipe;
    use std::io::Read;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn test_fanout_hashes_and_copies() {
        let (tx_a, mut rx_a) = pipe(8);
        let (tx_b, mut rx_b) = pipe(8);
        let summary = tokio::task::spawn_blocking(move || {
            let mut fanout = FanOut::new(vec![tx_a, tx_b]);
            fanout.write_all(b"hel").unwrap();
            fanout.write_all(b"lo").unwrap();
            fanout.finish()
        })
        .await
        .unwrap();
        assert_eq!(summary.digest, HELLO_SHA256);
        assert_eq!(summary.size, 5);

        let (a, b) = tokio::task::spawn_blocking(move || {
            let mut a = Vec::new();
            let mut b = Vec::new();
            std::io::Read::read_to_end(&mut rx_a, &mut a).unwrap();
            std::io::Read::read_to_end(&mut rx_b, &mut b).unwrap();
            (a, b)
        })
        .await
        .unwrap();
        assert_eq!(a, b"hello");
        assert_eq!(b, b"hello");
    }

    #[tokio::test]
    async fn test_fanout_survives_one_dead_sink() {
        let (tx_a, rx_a) = pipe(8);
        let (tx_b, mut rx_b) = pipe(8);
        drop(rx_a);
        let result = tokio::task::spawn_blocking(move || {
            let mut fanout = FanOut::new(vec![tx_a, tx_b]);
            fanout.write_all(b"hello").map(|_| fanout.finish())
        })
        .await
        .unwrap();
        assert_eq!(result.unwrap().digest, HELLO_SHA256);

        let out = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            std::io::Read::read_to_end(&mut rx_b, &mut out).unwrap();
            out
        })
        .await
        .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_fanout_fails_when_every_sink_is_gone() {
        let (tx, rx) = pipe(1);
        drop(rx);
        let err = tokio::task::spawn_blocking(move || FanOut::new(vec![tx]).write_all(b"x"))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_hash_and_stage() {
        let stream: ByteStream = Box::new(std::io::Cursor::new(b"hello".to_vec()));
        assert_eq!(hash_stream(stream).await.unwrap().digest, HELLO_SHA256);

        let dir = tempfile::tempdir().unwrap();
        let stream: ByteStream = Box::new(std::io::Cursor::new(b"hello".to_vec()));
        let staged = stage_to_file(stream, dir.path()).await.unwrap();
        assert_eq!(staged.checksum.size, 5);
        assert_eq!(staged.checksum.digest, HELLO_SHA256);
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"hello");
    }
}
