//! Shared test helpers for coordinator-level integration tests.
//!
//! Provides in-memory workers built on `tokio::io::duplex` and a launcher
//! that hands them out in order, so individual test modules can script
//! worker behaviour line by line.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

use diffusion_bridge::config::SessionConfig;
use diffusion_bridge::models::session::SessionView;
use diffusion_bridge::orchestrator::coordinator::Coordinator;
use diffusion_bridge::orchestrator::session::GenerationSession;
use diffusion_bridge::worker::launcher::WorkerLauncher;
use diffusion_bridge::worker::process::WorkerProcess;
use diffusion_bridge::{AppError, Result};

/// Generous upper bound for any single await in these tests.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// The test's side of an in-memory worker.
pub struct FakeWorker {
    commands: Lines<BufReader<DuplexStream>>,
    output: DuplexStream,
}

impl FakeWorker {
    /// Next command line the coordinator wrote, without its newline.
    pub async fn next_command(&mut self) -> String {
        tokio::time::timeout(STEP_TIMEOUT, self.commands.next_line())
            .await
            .expect("command before timeout")
            .expect("read command")
            .expect("worker input still open")
    }

    /// Wait for the coordinator to close the worker's input.
    pub async fn expect_input_closed(&mut self) {
        let next = tokio::time::timeout(STEP_TIMEOUT, self.commands.next_line())
            .await
            .expect("input closes before timeout")
            .expect("read command");
        assert!(next.is_none(), "expected EOF on worker input, got {next:?}");
    }

    /// Write one line to the worker's stdout.
    pub async fn emit(&mut self, line: &str) {
        self.try_emit(line).await.expect("emit line");
    }

    /// Write one line, reporting failure once nobody reads the output.
    pub async fn try_emit(&mut self, line: &str) -> std::io::Result<()> {
        self.output.write_all(format!("{line}\n").as_bytes()).await
    }

    /// Emit a `dnpr` progress line.
    pub async fn progress(&mut self, step: u32, total: u32) {
        self.emit(&format!(
            r#"sdbk dnpr {{"current_step": {step}, "total_steps": {total}}}"#
        ))
        .await;
    }

    /// Emit a `nwim` result line.
    pub async fn new_image(&mut self, path: &str) {
        self.emit(&format!(r#"sdbk nwim {{"generated_img_path": "{path}"}}"#))
            .await;
    }

    /// Close stdout, as a crashed worker would.
    pub fn exit(self) {
        drop(self);
    }

    /// Close stdin only, so the next write from the coordinator fails.
    pub fn close_input(self) -> DuplexStream {
        self.output
    }
}

/// Build a connected pair: the coordinator's `WorkerProcess` and the
/// test's [`FakeWorker`].
pub fn fake_worker(label: &str) -> (WorkerProcess, FakeWorker) {
    let (our_stdin, their_stdin) = tokio::io::duplex(64 * 1024);
    let (their_stdout, our_stdout) = tokio::io::duplex(64 * 1024);

    let process = WorkerProcess::from_pipes(label, Box::new(our_stdin), Box::new(our_stdout));
    let fake = FakeWorker {
        commands: BufReader::new(their_stdin).lines(),
        output: their_stdout,
    };
    (process, fake)
}

/// Launcher that hands out pre-built workers in order and fails once they
/// run out.
pub struct ScriptedLauncher {
    workers: Mutex<VecDeque<WorkerProcess>>,
    launches: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new(workers: Vec<WorkerProcess>) -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(workers.into()),
            launches: AtomicUsize::new(0),
        })
    }

    /// Queue another worker for a later launch.
    pub fn push(&self, worker: WorkerProcess) {
        self.workers.lock().expect("launcher lock").push_back(worker);
    }

    /// How many times the coordinator asked for a worker.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self) -> Pin<Box<dyn Future<Output = Result<WorkerProcess>> + Send + '_>> {
        Box::pin(async move {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.workers
                .lock()
                .expect("launcher lock")
                .pop_front()
                .ok_or_else(|| AppError::Launch("no scripted worker left".into()))
        })
    }
}

/// Session tuning with a short poll interval.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        decode_failure_threshold: 3,
        poll_interval_ms: 10,
    }
}

/// Coordinator over `launcher` with test-friendly timings.
pub fn coordinator(launcher: Arc<ScriptedLauncher>) -> Coordinator {
    Coordinator::new(launcher, fast_session_config(), Duration::from_millis(100))
}

/// Wait for the session to finish.
pub async fn wait_terminal(session: &GenerationSession) -> SessionView {
    tokio::time::timeout(STEP_TIMEOUT, session.wait_terminal())
        .await
        .expect("session finishes before timeout")
}

/// Wait until `predicate` holds for the session's view.
pub async fn wait_for_view(
    session: &GenerationSession,
    predicate: impl FnMut(&SessionView) -> bool,
) -> SessionView {
    let mut rx = session.subscribe();
    let view = tokio::time::timeout(STEP_TIMEOUT, rx.wait_for(predicate))
        .await
        .expect("view condition before timeout")
        .expect("session alive")
        .clone();
    view
}
