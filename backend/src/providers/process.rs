//! Spawning and supervising external dump/restore tools.
//!
//! Every child is spawned with `kill_on_drop`, so dropping a run (cancellation) or
//! hitting its deadline terminates the tool. Tool output that is not the dump stream
//! is read line by line: each line goes through the adapter's progress parser and a
//! bounded tail is kept for the failure message. Some tools (sqlcmd) report both
//! progress and errors on standard output, so it is read as well whenever it does
//! not carry data.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ProgressSignal, ProviderAdapter, ToolCommand};
use crate::error::{AppError, Result};
use crate::pipeline::{stage_error, PipeReader, PipeWriter, CHUNK_SIZE};

/// Lines of tool output kept for error reports.
const OUTPUT_TAIL_LINES: usize = 40;

/// Progress signals parsed from tool output.
pub type ProgressTx = mpsc::UnboundedSender<ProgressSignal>;

/// One supervised tool run.
pub struct ToolRun<'a> {
    pub command: &'a ToolCommand,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub progress: Option<ProgressTx>,
    pub timeout: Duration,
}

fn spawn(command: &ToolCommand, stdin: Stdio, stdout: Stdio) -> Result<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(tool = %command.tool_name(), args = ?command.args, "Spawning tool");
    cmd.spawn().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            AppError::Config(format!("'{}' was not found on PATH", command.program))
        } else {
            AppError::Io(e)
        }
    })
}

fn collect_lines<R>(
    output: Option<R>,
    adapter: Arc<dyn ProviderAdapter>,
    progress: Option<ProgressTx>,
    tool: String,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(output) = output else {
            return String::new();
        };
        let mut tail: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!(tool = %tool, "{}", line);
            if let (Some(tx), Some(signal)) = (&progress, adapter.parse_progress(&line)) {
                let _ = tx.send(signal);
            }
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    })
}

/// Output collectors for a tool whose stdout is not a data stream.
struct Diagnostics {
    stderr: JoinHandle<String>,
    stdout: JoinHandle<String>,
}

impl Diagnostics {
    /// Stderr tail, or the stdout tail when the tool wrote nothing to stderr.
    async fn finish(self) -> String {
        let stderr = self.stderr.await.unwrap_or_default();
        let stdout = self.stdout.await.unwrap_or_default();
        if stderr.trim().is_empty() {
            stdout
        } else {
            stderr
        }
    }
}

impl ToolRun<'_> {
    fn tool(&self) -> String {
        self.command.tool_name().to_string()
    }

    fn timed_out(&self) -> AppError {
        AppError::Timeout(format!(
            "{} did not finish within {}s and was killed",
            self.command.tool_name(),
            self.timeout.as_secs()
        ))
    }

    fn check_status(&self, status: ExitStatus, output: String, tolerate: bool) -> Result<String> {
        if status.success() {
            return Ok(output);
        }
        if tolerate && self.adapter.restore_failure_tolerated(status.code(), &output) {
            tracing::warn!(tool = %self.tool(), "Tool reported ignorable errors: {}", last_line(&output));
            return Ok(output);
        }
        Err(AppError::ToolExecution {
            tool: self.tool(),
            exit_code: status.code(),
            stderr: output,
        })
    }

    fn diagnostics(&self, child: &mut Child) -> Diagnostics {
        Diagnostics {
            stderr: collect_lines(child.stderr.take(), self.adapter.clone(), self.progress.clone(), self.tool()),
            stdout: collect_lines(child.stdout.take(), self.adapter.clone(), self.progress.clone(), self.tool()),
        }
    }

    /// Run to completion with no standard input; returns the output tail.
    pub async fn run(&self, restore: bool) -> Result<String> {
        let mut child = spawn(self.command, Stdio::null(), Stdio::piped())?;
        let output = self.diagnostics(&mut child);

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(self.timed_out());
            }
        };
        let output = output.finish().await;
        self.check_status(status, output, restore)
    }

    /// Stream the tool's standard output into `sink`. The sink sees a clean end of
    /// stream only after the tool exited successfully; otherwise it receives the error.
    pub async fn dump_to(&self, sink: PipeWriter) -> Result<()> {
        let result = self.dump_inner(&sink).await;
        if let Err(e) = &result {
            sink.fail_async(&io::Error::other(e.to_string())).await;
        }
        result
    }

    async fn dump_inner(&self, sink: &PipeWriter) -> Result<()> {
        let mut child = spawn(self.command, Stdio::null(), Stdio::piped())?;
        let stderr = collect_lines(child.stderr.take(), self.adapter.clone(), self.progress.clone(), self.tool());
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("tool stdout was not captured".into()))?;

        let pumped = tokio::time::timeout(self.timeout, async {
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut total = 0u64;
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.send(Bytes::copy_from_slice(&buf[..n])).await?;
                total += n as u64;
            }
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, total))
        })
        .await;

        let (status, total) = match pumped {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                // storage went away or the pipe broke; the tool is pointless now
                let _ = child.kill().await;
                let _ = stderr.await;
                return Err(AppError::Io(e));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(self.timed_out());
            }
        };
        let stderr = stderr.await.unwrap_or_default();
        self.check_status(status, stderr, false)?;
        tracing::debug!(tool = %self.tool(), bytes = total, "Dump stream complete");
        Ok(())
    }

    /// Feed `source` to the tool's standard input.
    pub async fn restore_from(&self, mut source: PipeReader) -> Result<()> {
        let mut child = spawn(self.command, Stdio::piped(), Stdio::piped())?;
        let output = self.diagnostics(&mut child);
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Internal("tool stdin was not captured".into()))?;

        let fed = tokio::time::timeout(self.timeout, async {
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut write_error = None;
            loop {
                let n = match source.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => return Err(e),
                };
                if let Err(e) = stdin.write_all(&buf[..n]).await {
                    // the tool stopped reading; its exit status explains why
                    write_error = Some(e);
                    break;
                }
            }
            if write_error.is_none() {
                if let Err(e) = stdin.shutdown().await {
                    write_error = Some(e);
                }
            }
            drop(stdin);
            let status = child.wait().await?;
            Ok((status, write_error))
        })
        .await;

        let (status, write_error) = match fed {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                let _ = output.finish().await;
                return Err(stage_error(e));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(self.timed_out());
            }
        };
        let output = output.finish().await;
        self.check_status(status, output, true)?;
        if let Some(e) = write_error {
            return Err(AppError::Io(e));
        }
        Ok(())
    }
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseConnection, EngineKind};
    use crate::pipeline::{pipe, StageFault};
    use crate::providers::{DumpPlan, RestorePlan};
    use std::path::Path;

    /// Parses "progress N" lines; tolerates exit 3.
    struct ShellAdapter;

    impl ProviderAdapter for ShellAdapter {
        fn engine(&self) -> EngineKind {
            EngineKind::Postgres
        }
        fn validate(&self, _db: &DatabaseConnection) -> Result<()> {
            Ok(())
        }
        fn build_dump_command(&self, _db: &DatabaseConnection, _w: &Path) -> Result<DumpPlan> {
            unreachable!()
        }
        fn build_restore_command(&self, _db: &DatabaseConnection, _e: &str, _w: &Path) -> Result<RestorePlan> {
            unreachable!()
        }
        fn build_test_command(&self, _db: &DatabaseConnection, _w: &Path) -> Result<ToolCommand> {
            unreachable!()
        }
        fn parse_progress(&self, line: &str) -> Option<ProgressSignal> {
            line.strip_prefix("progress ")?.parse().ok().map(ProgressSignal::percent)
        }
        fn restore_failure_tolerated(&self, exit_code: Option<i32>, _stderr: &str) -> bool {
            exit_code == Some(3)
        }
    }

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh").args(["-c", script])
    }

    fn run<'a>(command: &'a ToolCommand, progress: Option<ProgressTx>, timeout: Duration) -> ToolRun<'a> {
        ToolRun {
            command,
            adapter: Arc::new(ShellAdapter),
            progress,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_dump_streams_stdout_and_reports_progress() {
        let cmd = sh("echo 'progress 40' >&2; printf 'row1\\nrow2\\n'; echo 'progress 90' >&2");
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = pipe(4);
        let runner = run(&cmd, Some(progress_tx), Duration::from_secs(10));
        let (result, out) = tokio::join!(runner.dump_to(tx), async {
            let mut out = Vec::new();
            rx.read_to_end(&mut out).await.map(|_| out)
        });
        result.unwrap();
        assert_eq!(out.unwrap(), b"row1\nrow2\n");
        assert_eq!(progress_rx.recv().await, Some(ProgressSignal::percent(40)));
        assert_eq!(progress_rx.recv().await, Some(ProgressSignal::percent(90)));
    }

    #[tokio::test]
    async fn test_failed_dump_never_ends_cleanly() {
        let cmd = sh("printf 'partial'; echo 'FATAL: database \"nope\" does not exist' >&2; exit 1");
        let (tx, mut rx) = pipe(4);
        let runner = run(&cmd, None, Duration::from_secs(10));
        let (result, out) = tokio::join!(runner.dump_to(tx), async {
            let mut out = Vec::new();
            rx.read_to_end(&mut out).await
        });
        match result.unwrap_err() {
            AppError::ToolExecution { tool, exit_code, stderr } => {
                assert_eq!(tool, "sh");
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("does not exist"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(StageFault::is_upstream(&out.unwrap_err()));
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let cmd = sh("sleep 30");
        let started = std::time::Instant::now();
        let err = run(&cmd, None, Duration::from_millis(200)).run(false).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let cmd = ToolCommand::new("definitely-not-a-real-dump-tool");
        let err = run(&cmd, None, Duration::from_secs(1)).run(false).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_restore_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("restored.sql");
        let cmd = sh(&format!("cat > '{}'", target.display()));
        let (tx, rx) = pipe(4);
        let runner = run(&cmd, None, Duration::from_secs(10));
        let (result, _) = tokio::join!(runner.restore_from(rx), async move {
            tx.send(Bytes::from_static(b"CREATE TABLE t;\n")).await.unwrap();
            tx.send(Bytes::from_static(b"INSERT INTO t;\n")).await.unwrap();
        });
        result.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"CREATE TABLE t;\nINSERT INTO t;\n");
    }

    #[tokio::test]
    async fn test_restore_source_failure_is_reported() {
        let cmd = sh("cat > /dev/null");
        let (tx, rx) = pipe(4);
        let runner = run(&cmd, None, Duration::from_secs(10));
        let (result, _) = tokio::join!(runner.restore_from(rx), async move {
            tx.fail_async(&StageFault::integrity("checksum mismatch")).await;
        });
        // relayed failures stay secondary; the decoder reports the real cause
        assert!(crate::pipeline::is_secondary(&result.unwrap_err()));
    }

    #[tokio::test]
    async fn test_stdout_only_tool_reports_progress_and_errors() {
        let cmd = sh("echo '10 percent processed.'; echo '20 percent processed.'; \
             echo 'Msg 3201, Level 16, State 1: Cannot open backup device'; exit 1");
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let runner = ToolRun {
            command: &cmd,
            adapter: Arc::new(crate::providers::sqlserver::SqlServerAdapter::new()),
            progress: Some(progress_tx),
            timeout: Duration::from_secs(10),
        };
        match runner.run(false).await.unwrap_err() {
            AppError::ToolExecution { exit_code, stderr, .. } => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("Cannot open backup device"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        drop(runner);
        assert_eq!(progress_rx.recv().await, Some(ProgressSignal::percent(10)));
        assert_eq!(progress_rx.recv().await, Some(ProgressSignal::percent(20)));
    }

    #[tokio::test]
    async fn test_stderr_preferred_over_stdout_noise() {
        let cmd = sh("echo 'SET'; echo 'ERROR: relation exists' >&2; exit 2");
        let err = run(&cmd, None, Duration::from_secs(10)).run(false).await.unwrap_err();
        match err {
            AppError::ToolExecution { stderr, .. } => assert_eq!(stderr, "ERROR: relation exists"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tolerated_restore_exit() {
        let cmd = sh("echo 'warning: errors ignored' >&2; exit 3");
        assert!(run(&cmd, None, Duration::from_secs(10)).run(true).await.is_ok());
        assert!(run(&cmd, None, Duration::from_secs(10)).run(false).await.is_err());
    }
}
