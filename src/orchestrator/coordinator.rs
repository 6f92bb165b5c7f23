//! Single-slot session coordinator.
//!
//! The [`Coordinator`] owns at most one [`GenerationSession`] and at most one
//! live worker. Admission is explicit: a session occupies the slot from
//! [`start_generation`](Coordinator::start_generation) until a caller
//! consumes its outcome with [`clear_finished`](Coordinator::clear_finished).
//!
//! Each worker gets two background tasks: the reader (decodes stdout) and a
//! dispatcher that routes the reader's events to whichever session currently
//! holds the slot. The dispatcher checks worker identity on every event, so
//! a retired worker can never feed a newer session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{GlobalConfig, SessionConfig};
use crate::models::progress::ProgressSnapshot;
use crate::models::request::GenerationRequest;
use crate::models::session::{Outcome, SessionReport};
use crate::orchestrator::progress_sync::{ProgressSync, ProgressUpdate};
use crate::orchestrator::session::{GenerationSession, SessionEvent};
use crate::worker::launcher::{ProcessLauncher, WorkerLauncher};
use crate::worker::process::WorkerProcess;
use crate::worker::reader::{run_reader, WorkerEvent};
use crate::{AppError, Result};

/// Buffered reader events per worker.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Buffered progress updates per subscriber.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

struct WorkerLink {
    process: Arc<WorkerProcess>,
    tasks: CancellationToken,
}

impl WorkerLink {
    /// Stop the link's background tasks, then terminate the process.
    async fn retire(self, grace: Duration) {
        self.tasks.cancel();
        if let Err(err) = self.process.terminate(grace).await {
            warn!(worker = self.process.label(), %err, "worker termination failed");
        }
    }
}

#[derive(Default)]
struct Slot {
    worker: Option<WorkerLink>,
    session: Option<Arc<GenerationSession>>,
    sync_task: Option<JoinHandle<()>>,
}

/// Admission control and routing for generation sessions.
pub struct Coordinator {
    launcher: Arc<dyn WorkerLauncher>,
    session_config: SessionConfig,
    terminate_grace: Duration,
    slot: Arc<Mutex<Slot>>,
    updates: broadcast::Sender<ProgressUpdate>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("session_config", &self.session_config)
            .field("terminate_grace", &self.terminate_grace)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Coordinator that obtains workers from `launcher`.
    #[must_use]
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        session_config: SessionConfig,
        terminate_grace: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            launcher,
            session_config,
            terminate_grace,
            slot: Arc::new(Mutex::new(Slot::default())),
            updates,
            cancel: CancellationToken::new(),
        }
    }

    /// Coordinator that spawns the worker executable named in `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            Arc::new(ProcessLauncher::new(config.worker.clone())),
            config.session.clone(),
            config.worker.terminate_grace(),
        )
    }

    /// Admit `request` and start generating.
    ///
    /// Returns as soon as the start command has been written; the session
    /// runs in the background. Launch and write failures do not surface
    /// here: the returned session is already `Failed` with the cause.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyActive` if the slot holds a session that has not
    ///   been cleared, whatever its phase.
    /// - `AppError::Validation` if a request field is out of range.
    #[tracing::instrument(
        name = "start_generation",
        skip_all,
        fields(steps = request.inference_steps, images = request.image_count)
    )]
    pub async fn start_generation(
        &self,
        request: GenerationRequest,
    ) -> Result<Arc<GenerationSession>> {
        let (session, stale) = {
            let mut slot = self.slot.lock().await;

            if let Some(existing) = &slot.session {
                return Err(AppError::AlreadyActive(format!(
                    "session {} ({:?}) has not been cleared",
                    existing.id(),
                    existing.phase()
                )));
            }

            request.validate()?;

            let stale = take_stale_worker(&mut slot).await;
            let (worker, launch_error) = match self.ensure_worker(&mut slot).await {
                Ok(worker) => (Some(worker), None),
                Err(err) => (None, Some(err)),
            };

            let session = Arc::new(GenerationSession::new(
                request,
                self.session_config.decode_failure_threshold,
                worker,
            ));
            if let Some(err) = launch_error {
                session.apply(SessionEvent::IoFailure(err));
            }

            slot.session = Some(Arc::clone(&session));
            slot.sync_task = Some(
                ProgressSync::new(
                    Arc::clone(&session),
                    self.session_config.poll_interval(),
                    self.updates.clone(),
                    self.cancel.child_token(),
                )
                .spawn(),
            );
            (session, stale)
        };

        if let Some(link) = stale {
            tokio::spawn(link.retire(self.terminate_grace));
        }

        info!(session_id = %session.id(), "generation session admitted");
        session.dispatch_start().await;
        Ok(session)
    }

    /// Cancel the active session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotActive` if the slot is empty or its session has
    /// already finished.
    #[tracing::instrument(name = "cancel_active", skip_all)]
    pub async fn cancel_active(&self) -> Result<()> {
        let session = self.slot.lock().await.session.clone();
        match session {
            Some(session) => session.cancel().await,
            None => Err(AppError::NotActive("no generation in progress".into())),
        }
    }

    /// Progress of the session in the slot, or `None` when idle.
    pub async fn query_progress(&self) -> Option<ProgressSnapshot> {
        let slot = self.slot.lock().await;
        Some(slot.session.as_ref()?.snapshot())
    }

    /// The session currently holding the slot.
    pub async fn active_session(&self) -> Option<Arc<GenerationSession>> {
        self.slot.lock().await.session.clone()
    }

    /// Consume the finished session and free the slot.
    ///
    /// Clearing a session that did not complete also retires its worker,
    /// which may still be producing output for the abandoned generation.
    ///
    /// # Errors
    ///
    /// - `AppError::NotActive` if the slot is empty.
    /// - `AppError::AlreadyActive` if the session is still running.
    pub async fn clear_finished(&self) -> Result<SessionReport> {
        let mut slot = self.slot.lock().await;

        let Some(session) = slot.session.as_ref() else {
            return Err(AppError::NotActive("no session to clear".into()));
        };
        let Some(report) = session.report() else {
            return Err(AppError::AlreadyActive(format!(
                "session {} is still running",
                session.id()
            )));
        };

        slot.session = None;
        let abandoned = if matches!(report.outcome, Outcome::Completed { .. }) {
            None
        } else {
            slot.worker.take()
        };
        drop(slot);

        if let Some(link) = abandoned {
            link.retire(self.terminate_grace).await;
        }

        info!(session_id = %report.session_id, outcome = ?report.outcome, "session cleared");
        Ok(report)
    }

    /// Receiver of progress updates published from now on, including those of
    /// a session already in flight.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.updates.subscribe()
    }

    /// Cancel any running session, stop background tasks, and terminate the
    /// worker.
    #[tracing::instrument(name = "coordinator_shutdown", skip_all)]
    pub async fn shutdown(&self) {
        let (session, sync_task, worker) = {
            let mut slot = self.slot.lock().await;
            (
                slot.session.clone(),
                slot.sync_task.take(),
                slot.worker.take(),
            )
        };

        if let Some(session) = session.filter(|s| !s.is_terminal()) {
            if let Err(err) = session.cancel().await {
                debug!(%err, "session finished before shutdown cancel");
            }
        }

        self.cancel.cancel();
        if let Some(task) = sync_task {
            task.abort();
        }
        if let Some(link) = worker {
            link.retire(self.terminate_grace).await;
        }
        info!("coordinator shut down");
    }

    /// Reuse the slot's worker or launch a new one.
    async fn ensure_worker(&self, slot: &mut Slot) -> Result<Arc<WorkerProcess>> {
        if let Some(link) = &slot.worker {
            return Ok(Arc::clone(&link.process));
        }

        let process = Arc::new(self.launcher.launch().await?);
        let lines = process.lines().await?;
        let tasks = self.cancel.child_token();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let label = process.label().to_owned();
        tokio::spawn(
            run_reader(label.clone(), lines, event_tx, tasks.clone())
                .instrument(info_span!("worker_reader", worker = %label)),
        );
        tokio::spawn(
            dispatch_events(
                Arc::clone(&self.slot),
                Arc::clone(&process),
                event_rx,
                tasks.clone(),
            )
            .instrument(info_span!("worker_dispatch", worker = %label)),
        );

        slot.worker = Some(WorkerLink {
            process: Arc::clone(&process),
            tasks,
        });
        Ok(process)
    }
}

/// Detach the slot's worker if it can no longer accept work.
///
/// Its tasks stop at once; terminating the process is left to the caller
/// so it can happen outside the slot lock.
async fn take_stale_worker(slot: &mut Slot) -> Option<WorkerLink> {
    let link = slot.worker.as_ref()?;
    if link.process.is_running().await {
        return None;
    }
    let stale = slot.worker.take()?;
    info!(worker = stale.process.label(), "replacing stopped worker");
    stale.tasks.cancel();
    Some(stale)
}

/// Route one worker's events to the session in the slot while that worker
/// is still the slot's worker.
async fn dispatch_events(
    slot: Arc<Mutex<Slot>>,
    worker: Arc<WorkerProcess>,
    mut event_rx: mpsc::Receiver<WorkerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            () = cancel.cancelled() => return,

            event = event_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let closed = matches!(event, WorkerEvent::Closed { .. });
        if closed {
            worker.mark_output_closed();
        }

        let session = {
            let guard = slot.lock().await;
            let current = guard
                .worker
                .as_ref()
                .is_some_and(|link| Arc::ptr_eq(&link.process, &worker));
            if !current {
                debug!("worker no longer attached, dropping its events");
                return;
            }
            guard.session.clone()
        };

        match session {
            Some(session) => session.ingest(SessionEvent::from(event)).await,
            None => debug!(?event, "no session in slot, dropping worker event"),
        }

        if closed {
            return;
        }
    }
}
