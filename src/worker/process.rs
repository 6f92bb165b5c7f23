//! Worker subprocess handle.
//!
//! Spawns the image-generation worker with:
//! - piped stdin/stdout for the line protocol,
//! - piped stderr forwarded to `DEBUG` logs,
//! - `kill_on_drop(true)` so a dropped handle never leaks a process.
//!
//! Termination is cooperative first (close stdin, then `SIGTERM` on unix)
//! and forced after a grace period.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::protocol::codec::MAX_LINE_BYTES;
use crate::protocol::lines::{BoxedReader, WorkerLines};
use crate::{AppError, Result};

/// Boxed byte sink used for worker input.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A running worker and its stdio streams.
///
/// All methods take `&self`, so one handle can be shared between the
/// coordinator (start commands, termination) and the active session
/// (cancel commands).
pub struct WorkerProcess {
    label: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<BoxedWriter>>,
    stdout: Mutex<Option<BoxedReader>>,
    max_line_bytes: usize,
    output_closed: AtomicBool,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("label", &self.label)
            .field("max_line_bytes", &self.max_line_bytes)
            .field("output_closed", &self.output_closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WorkerProcess {
    /// Start the worker described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the executable cannot be started or its
    /// stdio pipes cannot be captured.
    pub fn spawn(config: &WorkerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Launch(format!("failed to start {}: {err}", config.executable))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Launch("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Launch("failed to capture worker stdout".into()))?;

        let label = child
            .id()
            .map_or_else(|| config.executable.clone(), |pid| format!("pid {pid}"));

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(label.clone(), stderr));
        }

        info!(worker = %label, executable = %config.executable, "worker process started");

        Ok(Self {
            label,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(Box::new(stdin))),
            stdout: Mutex::new(Some(Box::new(stdout))),
            max_line_bytes: config.max_line_bytes,
            output_closed: AtomicBool::new(false),
        })
    }

    /// Wrap existing pipes that are not backed by an OS process.
    ///
    /// Terminating such a worker only closes its input.
    #[must_use]
    pub fn from_pipes(label: impl Into<String>, stdin: BoxedWriter, stdout: BoxedReader) -> Self {
        Self {
            label: label.into(),
            child: Mutex::new(None),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(stdout)),
            max_line_bytes: MAX_LINE_BYTES,
            output_closed: AtomicBool::new(false),
        }
    }

    /// Human-readable identity used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write one protocol line, appending `\n` if it is missing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Write` if the input pipe is closed or the write fails.
    pub async fn send(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| AppError::Write(format!("worker {} input is closed", self.label)))?;

        let mut bytes = line.as_bytes().to_vec();
        if !line.ends_with('\n') {
            bytes.push(b'\n');
        }

        let written = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;

        if let Err(err) = written {
            warn!(worker = %self.label, %err, "write to worker stdin failed");
            // A broken pipe stays broken; later sends fail fast.
            guard.take();
            return Err(AppError::Write(format!(
                "failed to write to worker {}: {err}",
                self.label
            )));
        }

        debug!(worker = %self.label, line = line.trim_end(), "sent worker command");
        Ok(())
    }

    /// Hand out the decoded output stream. Available once per worker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the stream was already taken.
    pub async fn lines(&self) -> Result<WorkerLines> {
        let reader = self
            .stdout
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::Io(format!("worker {} output already taken", self.label)))?;
        Ok(WorkerLines::new(reader, self.max_line_bytes))
    }

    /// Record that the worker's output stream has ended.
    pub fn mark_output_closed(&self) {
        self.output_closed.store(true, Ordering::SeqCst);
    }

    /// Whether the worker can still accept work.
    ///
    /// False once its output has closed, its input is broken, or its process
    /// has exited.
    pub async fn is_running(&self) -> bool {
        if self.output_closed.load(Ordering::SeqCst) || self.stdin.lock().await.is_none() {
            return false;
        }

        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Shut the worker down, forcing it after `grace` if needed.
    ///
    /// Closes stdin first (workers treat EOF as a request to exit), then sends
    /// `SIGTERM` on unix, waits up to `grace`, and finally kills and reaps the
    /// process. The process is gone when this returns, even on error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the forced kill fails.
    #[tracing::instrument(name = "terminate_worker", skip_all, fields(worker = %self.label))]
    pub async fn terminate(&self, grace: Duration) -> Result<()> {
        self.stdin.lock().await.take();
        self.mark_output_closed();

        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            info!(?status, "worker already exited");
            return Ok(());
        }

        #[cfg(unix)]
        request_shutdown(&child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "worker exited gracefully");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(%err, "error waiting for worker, forcing kill");
                force_kill(&mut child).await
            }
            Err(_elapsed) => {
                warn!(?grace, "worker did not exit within grace period, forcing kill");
                force_kill(&mut child).await
            }
        }
    }
}

async fn force_kill(child: &mut Child) -> Result<()> {
    child
        .kill()
        .await
        .map_err(|err| AppError::Io(format!("failed to kill worker: {err}")))
}

#[cfg(unix)]
fn request_shutdown(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };

    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, %err, "SIGTERM delivery failed");
    }
}

async fn forward_stderr(label: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(worker = %label, stderr = %line, "worker stderr"),
            Ok(None) => break,
            Err(err) => {
                debug!(worker = %label, %err, "worker stderr closed with error");
                break;
            }
        }
    }
}
