// postgres-s3-backup/src/backup/db_dump.rs
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tracing::debug;
use which::which;

use super::archive::ParallelGzipWriter;
use super::counter::ByteCounter;
use crate::errors::{BackupError, Result};

/// pg_dump prefixes its fatal messages with this; anything before it is advisory.
pub const PG_DUMP_ERROR_MARKER: &str = "pg_dump: error:";

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Something that can start a dump. Implemented by the real `pg_dump`
/// launcher and by test doubles.
#[async_trait]
pub trait DumpCommand: Send + Sync {
    async fn spawn(&self) -> Result<Box<dyn DumpProcess>>;
}

/// A running dump: a byte source plus a way to wait for its exit and diagnostics.
#[async_trait]
pub trait DumpProcess: Send {
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>>;
    async fn wait(&mut self) -> Result<DumpExit>;
}

#[derive(Debug, Clone)]
pub struct DumpExit {
    pub success: bool,
    /// Human-readable exit status, e.g. `exit status: 1`.
    pub status: String,
    pub stderr: String,
}

impl DumpExit {
    fn from_status(status: ExitStatus, stderr: String) -> Self {
        DumpExit {
            success: status.success(),
            status: status.to_string(),
            stderr,
        }
    }
}

/// What the dump stage observed once the process has exited.
#[derive(Debug, Clone)]
pub struct DumpOutcome {
    pub exit: DumpExit,
    pub bytes_read: u64,
}

impl DumpOutcome {
    /// Classifies the run. A failed exit or zero bytes of output are both
    /// dump failures; on success the diagnostic text is returned trimmed.
    pub fn into_result(self) -> Result<String> {
        if !self.exit.success {
            return Err(classify_failure(
                &self.exit.stderr,
                BackupError::Dump(format!("pg_dump failed with {}", self.exit.status)),
            ));
        }
        if self.bytes_read == 0 {
            return Err(classify_failure(&self.exit.stderr, BackupError::EmptyDump));
        }
        Ok(self.exit.stderr.trim().to_string())
    }
}

/// Returns the diagnostic text from the error marker onward, dropping any
/// prefixed warnings. Without a marker the whole text is returned.
pub fn extract_dump_error(stderr: &str) -> &str {
    match stderr.find(PG_DUMP_ERROR_MARKER) {
        Some(index) => &stderr[index..],
        None => stderr,
    }
}

fn classify_failure(stderr: &str, fallback: BackupError) -> BackupError {
    if stderr.is_empty() {
        fallback
    } else {
        BackupError::Dump(extract_dump_error(stderr).to_string())
    }
}

/// Launches an external dump program with stdout piped back to us and stderr captured.
#[derive(Debug, Clone)]
pub struct ExternalDump {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExternalDump {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        ExternalDump {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `pg_dump` in custom archive format with its own compression disabled.
    pub fn pg_dump(database_url: &str) -> Result<Self> {
        if database_url.trim().is_empty() {
            return Err(BackupError::Launch(
                "database connection string is empty".to_string(),
            ));
        }
        let program = which("pg_dump").map_err(|e| {
            BackupError::Launch(format!(
                "pg_dump executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed",
                e
            ))
        })?;
        Ok(Self::new(program, pg_dump_args(database_url)))
    }
}

fn pg_dump_args(database_url: &str) -> Vec<String> {
    vec![
        "-d".to_string(),
        database_url.to_string(),
        "-F".to_string(),
        "custom".to_string(),
        "-Z".to_string(),
        "0".to_string(),
    ]
}

#[async_trait]
impl DumpCommand for ExternalDump {
    async fn spawn(&self) -> Result<Box<dyn DumpProcess>> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackupError::Launch(format!("{}: {}", self.program.display(), e)))?;

        let stdout = child.stdout.take();
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut captured = Vec::new();
                stderr.read_to_end(&mut captured).await?;
                Ok::<_, std::io::Error>(captured)
            })
        });

        debug!(program = %self.program.display(), pid = ?child.id(), "dump process started");
        Ok(Box::new(ChildDump {
            child,
            stdout,
            stderr_task,
        }))
    }
}

struct ChildDump {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
}

#[async_trait]
impl DumpProcess for ChildDump {
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>> {
        self.stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>)
    }

    async fn wait(&mut self) -> Result<DumpExit> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| BackupError::io("failed to wait for dump process", e))?;

        let stderr = match self.stderr_task.take() {
            Some(task) => task
                .await
                .map_err(|e| BackupError::io("stderr reader panicked", std::io::Error::other(e)))?
                .map_err(|e| BackupError::io("failed to read dump stderr", e))?,
            None => Vec::new(),
        };

        Ok(DumpExit::from_status(
            status,
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }
}

/// Runs one dump to completion, streaming its stdout into `writer` as it is
/// produced. The writer is left unfinished so the caller decides how to close it.
pub async fn stream_dump<W>(
    command: &dyn DumpCommand,
    writer: &mut ParallelGzipWriter<W>,
) -> Result<DumpOutcome>
where
    W: AsyncWrite + Unpin,
{
    let mut process = command.spawn().await?;
    let stdout = process
        .take_stdout()
        .ok_or_else(|| BackupError::Launch("dump process has no stdout".to_string()))?;

    let mut source = ByteCounter::new(stdout);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| BackupError::io("failed to read dump output", e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(BackupError::Compression)?;
    }

    let exit = process.wait().await?;
    Ok(DumpOutcome {
        exit,
        bytes_read: source.count(),
    })
}
