//! Bounded in-memory byte pipes connecting pipeline stages.
//!
//! A pipe carries `Bytes` chunks over a bounded channel, so a slow consumer makes the
//! producer wait instead of letting memory grow. Both ends work from async tasks and
//! from blocking threads. A producer can push an error instead of closing cleanly;
//! the consumer then sees a read error rather than a premature end-of-stream, which
//! keeps storage backends from finalizing a truncated artifact.

use bytes::Bytes;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use super::StageFault;

/// Chunk size used by pipeline stages.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default number of chunks in flight per pipe.
pub const DEFAULT_CAPACITY: usize = 32;

pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Bytes::new(),
        },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipeline consumer went away")
}

/// Producing end. Dropping every clone ends the stream cleanly.
#[derive(Clone)]
pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Send a chunk from async code, waiting for room.
    pub async fn send(&self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.send(Ok(chunk)).await.map_err(|_| broken_pipe())
    }

    /// Send a chunk from a blocking thread, waiting for room.
    pub fn blocking_send(&self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.blocking_send(Ok(chunk)).map_err(|_| broken_pipe())
    }

    /// Abort the stream from a blocking thread; the consumer reads an upstream error.
    pub fn fail(&self, cause: &io::Error) {
        let _ = self.tx.blocking_send(Err(StageFault::upstream(cause)));
    }

    /// Abort the stream from async code.
    pub async fn fail_async(&self, cause: &io::Error) {
        let _ = self.tx.send(Err(StageFault::upstream(cause))).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.blocking_send(Bytes::copy_from_slice(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Consuming end.
pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl PipeReader {
    /// Next chunk from a blocking thread; `None` at end of stream.
    pub fn blocking_next(&mut self) -> io::Result<Option<Bytes>> {
        if !self.current.is_empty() {
            return Ok(Some(std::mem::take(&mut self.current)));
        }
        match self.rx.blocking_recv() {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if this.current.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => this.current = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = buf.remaining().min(this.current.len());
        buf.put_slice(&this.current.split_to(n));
        Poll::Ready(Ok(()))
    }
}
