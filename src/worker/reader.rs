//! Worker reader task.
//!
//! Drains a [`WorkerLines`] stream and forwards each decoded item as a
//! [`WorkerEvent`] through a tokio [`mpsc`] channel. Exactly one reader runs
//! per worker process.
//!
//! Malformed lines are forwarded as [`WorkerEvent::Malformed`] rather than
//! ending the task; whoever consumes the events decides how many it
//! tolerates. The task always finishes with [`WorkerEvent::Closed`] unless it
//! is cancelled or the receiver goes away.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::lines::WorkerLines;
use crate::protocol::message::Response;
use crate::AppError;

/// Items produced by the reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A decoded protocol response.
    Response(Response),
    /// A marked line that failed to decode.
    Malformed(String),
    /// The worker's output ended.
    Closed {
        /// Why the stream ended.
        reason: String,
    },
}

/// Reader task: forwards decoded worker output until EOF or cancellation.
pub async fn run_reader(
    worker_label: String,
    mut lines: WorkerLines,
    event_tx: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(worker = %worker_label, "reader: cancellation received, stopping");
                return;
            }

            item = lines.next() => item,
        };

        let event = match item {
            None => {
                debug!(worker = %worker_label, "reader: EOF detected");
                send_event(&event_tx, WorkerEvent::Closed {
                    reason: "worker closed its output".into(),
                })
                .await;
                return;
            }
            Some(Ok(response)) => WorkerEvent::Response(response),
            Some(Err(AppError::Decode(msg))) => {
                warn!(worker = %worker_label, error = %msg, "reader: undecodable worker line");
                WorkerEvent::Malformed(msg)
            }
            Some(Err(err)) => {
                warn!(worker = %worker_label, error = %err, "reader: stream error, stopping");
                send_event(&event_tx, WorkerEvent::Closed {
                    reason: format!("stream error: {err}"),
                })
                .await;
                return;
            }
        };

        if !send_event(&event_tx, event).await {
            debug!(worker = %worker_label, "reader: event channel closed, stopping");
            return;
        }
    }
}

async fn send_event(event_tx: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) -> bool {
    event_tx.send(event).await.is_ok()
}
