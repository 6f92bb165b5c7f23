//! Generation session state machine.
//!
//! ```text
//! Initializing ──progress──▶ Running ──progress──▶ Running
//!      │                        │
//!      ├──all images──▶ Completed
//!      ├──error / decode storm / stream end / I/O failure──▶ Failed
//!      └──cancel──▶ Cancelled
//! ```
//!
//! [`SessionMachine`] holds the pure transition logic. [`GenerationSession`]
//! wraps it with a `watch` channel so observers always read a consistent
//! [`SessionView`], and with the worker handle used to send commands.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::progress::ProgressSnapshot;
use crate::models::request::GenerationRequest;
use crate::models::session::{Outcome, SessionPhase, SessionReport, SessionView};
use crate::protocol::message::{Command, Response};
use crate::worker::process::WorkerProcess;
use crate::worker::reader::WorkerEvent;
use crate::{AppError, Result};

/// Inputs that drive a session's state.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A decoded worker response.
    Response(Response),
    /// A worker line that failed to decode.
    DecodeFailure(String),
    /// The worker's output ended.
    StreamClosed(String),
    /// Launching or writing to the worker failed.
    IoFailure(AppError),
    /// The operator asked to stop.
    Cancel,
}

impl From<WorkerEvent> for SessionEvent {
    fn from(event: WorkerEvent) -> Self {
        match event {
            WorkerEvent::Response(response) => Self::Response(response),
            WorkerEvent::Malformed(msg) => Self::DecodeFailure(msg),
            WorkerEvent::Closed { reason } => Self::StreamClosed(reason),
        }
    }
}

/// Transition logic for one generation.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    view: SessionView,
    image_count: u32,
    paths: Vec<PathBuf>,
    decode_failures: u32,
    decode_failure_threshold: u32,
}

impl SessionMachine {
    /// Machine for `request`, failing after `decode_failure_threshold`
    /// consecutive undecodable lines.
    #[must_use]
    pub fn new(request: &GenerationRequest, decode_failure_threshold: u32) -> Self {
        Self {
            view: SessionView::initializing(request.inference_steps),
            image_count: request.image_count.max(1),
            paths: Vec::new(),
            decode_failures: 0,
            decode_failure_threshold: decode_failure_threshold.max(1),
        }
    }

    /// Current view.
    #[must_use]
    pub fn view(&self) -> &SessionView {
        &self.view
    }

    /// Apply `event`, returning whether the view changed.
    ///
    /// Events arriving after a terminal phase are ignored, so the first
    /// terminal transition is the only one observers ever see.
    pub fn apply(&mut self, event: SessionEvent) -> bool {
        if self.view.is_terminal() {
            debug!(phase = ?self.view.phase, ?event, "ignoring event for finished session");
            return false;
        }

        match event {
            SessionEvent::Response(response) => {
                self.decode_failures = 0;
                self.apply_response(response)
            }
            SessionEvent::DecodeFailure(msg) => {
                self.decode_failures += 1;
                warn!(
                    consecutive = self.decode_failures,
                    threshold = self.decode_failure_threshold,
                    error = %msg,
                    "undecodable worker line"
                );
                if self.decode_failures >= self.decode_failure_threshold {
                    self.fail(format!(
                        "{} consecutive undecodable lines from worker; last error: {msg}",
                        self.decode_failures
                    ));
                    true
                } else {
                    false
                }
            }
            SessionEvent::StreamClosed(reason) => {
                self.fail(format!("worker exited before finishing: {reason}"));
                true
            }
            SessionEvent::IoFailure(err) => {
                self.fail(err.to_string());
                true
            }
            SessionEvent::Cancel => {
                self.view.phase = SessionPhase::Cancelled;
                self.view.snapshot.is_cancelled = true;
                self.view.snapshot.status = "Cancelled".into();
                self.view.outcome = Some(Outcome::Cancelled);
                true
            }
        }
    }

    fn apply_response(&mut self, response: Response) -> bool {
        match response {
            Response::Progress(progress) => {
                let snapshot = &mut self.view.snapshot;
                let mut step = progress.current_step;

                if step > snapshot.total_steps {
                    warn!(step, total = snapshot.total_steps, "worker step exceeds total, clamping");
                    step = snapshot.total_steps;
                }
                if step < snapshot.current_step {
                    warn!(step, current = snapshot.current_step, "worker step regressed, keeping current");
                    step = snapshot.current_step;
                }
                if let Some(total) = progress.total_steps.filter(|t| *t != snapshot.total_steps) {
                    debug!(reported = total, expected = snapshot.total_steps, "worker total differs from request");
                }

                snapshot.current_step = step;
                if let Some(status) = progress.status {
                    snapshot.status = status;
                }
                self.view.phase = SessionPhase::Running;
                true
            }
            Response::Status(status) => {
                if self.view.snapshot.status == status {
                    return false;
                }
                self.view.snapshot.status = status;
                true
            }
            Response::NewImage(image) => {
                info!(path = %image.generated_img_path.display(), "worker produced image");
                self.paths.push(image.generated_img_path);
                let received = u32::try_from(self.paths.len()).unwrap_or(u32::MAX);

                if received >= self.image_count {
                    let snapshot = &mut self.view.snapshot;
                    snapshot.current_step = snapshot.total_steps;
                    snapshot.status = "Complete".into();
                    snapshot.is_complete = true;
                    self.view.phase = SessionPhase::Completed;
                    self.view.outcome = Some(Outcome::Completed {
                        paths: std::mem::take(&mut self.paths),
                    });
                } else {
                    self.view.snapshot.status =
                        format!("Generated {received} of {} images", self.image_count);
                    self.view.phase = SessionPhase::Running;
                }
                true
            }
            Response::Error(message) => {
                self.fail(format!("worker reported an error: {message}"));
                true
            }
            Response::Unrecognized { code, .. } => {
                debug!(code, "ignoring unrecognized worker response");
                false
            }
        }
    }

    fn fail(&mut self, error: String) {
        warn!(error = %error, "generation failed");
        self.view.phase = SessionPhase::Failed;
        self.view.snapshot.status = format!("Failed: {error}");
        self.view.outcome = Some(Outcome::Failed { error });
    }
}

/// One in-flight generation owned by the coordinator.
#[derive(Debug)]
pub struct GenerationSession {
    id: String,
    request: GenerationRequest,
    started_at: DateTime<Utc>,
    started: Instant,
    machine: Mutex<SessionMachine>,
    view_tx: watch::Sender<SessionView>,
    worker: Option<Arc<WorkerProcess>>,
}

impl GenerationSession {
    /// Create a session in `Initializing`; `worker` is `None` when no worker
    /// could be launched.
    #[must_use]
    pub fn new(
        request: GenerationRequest,
        decode_failure_threshold: u32,
        worker: Option<Arc<WorkerProcess>>,
    ) -> Self {
        let machine = SessionMachine::new(&request, decode_failure_threshold);
        let (view_tx, _) = watch::channel(machine.view().clone());
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            started_at: Utc::now(),
            started: Instant::now(),
            machine: Mutex::new(machine),
            view_tx,
            worker,
        }
    }

    /// Opaque session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The request this session runs.
    #[must_use]
    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    /// Wall-clock time since the session was admitted.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Consistent copy of the current view.
    #[must_use]
    pub fn view(&self) -> SessionView {
        self.view_tx.borrow().clone()
    }

    /// Current progress snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.view_tx.borrow().snapshot.clone()
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.view_tx.borrow().phase
    }

    /// Whether the session has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Receiver notified on every view change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }

    /// Wait until the session reaches a terminal phase.
    pub async fn wait_terminal(&self) -> SessionView {
        let mut rx = self.subscribe();
        let view = match rx.wait_for(SessionView::is_terminal).await {
            Ok(view) => view.clone(),
            // The sender lives in `self`, so it cannot be dropped while we wait.
            Err(_) => self.view(),
        };
        view
    }

    /// Feed one event through the state machine and publish the result.
    pub fn apply(&self, event: SessionEvent) -> bool {
        let mut machine = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = machine.apply(event);
        if changed {
            // Published under the machine lock so views are never reordered.
            self.view_tx.send_replace(machine.view().clone());
        }
        changed
    }

    /// Send the start command to the worker.
    ///
    /// Failures are recorded in the session outcome rather than returned.
    pub async fn dispatch_start(&self) {
        let Some(worker) = &self.worker else {
            return;
        };
        if self.is_terminal() {
            debug!(session_id = %self.id, "session finished before start, not dispatching");
            return;
        }

        let sent = match Command::generate(&self.request).encode() {
            Ok(line) => worker.send(&line).await,
            Err(err) => Err(err),
        };

        match sent {
            Ok(()) => info!(session_id = %self.id, worker = worker.label(), "start command sent"),
            Err(err) => {
                self.apply(SessionEvent::IoFailure(err));
            }
        }
    }

    /// Cancel the generation.
    ///
    /// The session flips to `Cancelled` immediately; the stop command to the
    /// worker is best-effort.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotActive` if the session already finished.
    pub async fn cancel(&self) -> Result<()> {
        if !self.apply(SessionEvent::Cancel) {
            return Err(AppError::NotActive(format!(
                "session {} already finished",
                self.id
            )));
        }
        info!(session_id = %self.id, "session cancelled");
        self.send_stop().await;
        Ok(())
    }

    /// Apply an event read from the worker's output.
    ///
    /// When undecodable output fails the session, the worker may still be
    /// running the abandoned generation, so it is asked to stop.
    pub async fn ingest(&self, event: SessionEvent) {
        let decode_failure = matches!(event, SessionEvent::DecodeFailure(_));
        if self.apply(event) && decode_failure && self.phase() == SessionPhase::Failed {
            self.send_stop().await;
        }
    }

    async fn send_stop(&self) {
        let Some(worker) = &self.worker else {
            return;
        };
        let sent = match Command::Stop.encode() {
            Ok(line) => worker.send(&line).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            warn!(session_id = %self.id, %err, "failed to deliver stop command to worker");
        }
    }

    /// Summary of a finished session, or `None` while it is still running.
    #[must_use]
    pub fn report(&self) -> Option<SessionReport> {
        let view = self.view();
        let outcome = view.outcome?;
        Some(SessionReport {
            session_id: self.id.clone(),
            request: self.request.clone(),
            started_at: self.started_at,
            snapshot: view.snapshot,
            outcome,
        })
    }
}
