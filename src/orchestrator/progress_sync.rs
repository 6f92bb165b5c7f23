//! Periodic progress publication.
//!
//! A [`ProgressSync`] polls one [`GenerationSession`] on a fixed cadence and
//! publishes a [`ProgressUpdate`] to a `broadcast` channel whenever the view
//! changed since the last publish. It emits exactly one terminal update and
//! then stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::models::progress::{estimate_remaining, ProgressSnapshot};
use crate::models::session::{Outcome, SessionPhase, SessionView};
use crate::orchestrator::session::GenerationSession;

/// Snapshot published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Session the update belongs to.
    pub session_id: String,
    /// Lifecycle phase at publish time.
    pub phase: SessionPhase,
    /// Progress at publish time.
    pub snapshot: ProgressSnapshot,
    /// Set on the terminal update.
    pub outcome: Option<Outcome>,
    /// Estimated time remaining; `None` before the first step or once the
    /// session finished.
    pub eta: Option<Duration>,
}

impl ProgressUpdate {
    /// Whether this is the session's final update.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Builder for the polling task. Call [`spawn`](Self::spawn) to start it.
pub struct ProgressSync {
    session: Arc<GenerationSession>,
    interval: Duration,
    updates: broadcast::Sender<ProgressUpdate>,
    cancel: CancellationToken,
}

impl ProgressSync {
    /// Construct a synchronizer (does not start polling yet).
    #[must_use]
    pub fn new(
        session: Arc<GenerationSession>,
        interval: Duration,
        updates: broadcast::Sender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            interval,
            updates,
            cancel,
        }
    }

    /// Spawn the polling loop.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        let span = info_span!("progress_sync", session_id = %self.session.id());
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last: Option<SessionView> = None;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    debug!("progress sync cancelled");
                    return;
                }

                _ = ticker.tick() => {}
            }

            let view = self.session.view();
            if last.as_ref() == Some(&view) {
                continue;
            }

            let update = self.build_update(&view);
            let terminal = update.is_terminal();
            // Updates sent while nobody is subscribed are dropped.
            let _ = self.updates.send(update);
            last = Some(view);

            if terminal {
                debug!("terminal update published, stopping");
                return;
            }
        }
    }

    fn build_update(&self, view: &SessionView) -> ProgressUpdate {
        let eta = if view.is_terminal() {
            None
        } else {
            estimate_remaining(
                self.session.elapsed(),
                view.snapshot.current_step,
                view.snapshot.total_steps,
            )
        };

        ProgressUpdate {
            session_id: self.session.id().to_owned(),
            phase: view.phase,
            snapshot: view.snapshot.clone(),
            outcome: view.outcome.clone(),
            eta,
        }
    }
}
