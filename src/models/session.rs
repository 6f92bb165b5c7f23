//! Session lifecycle types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::progress::ProgressSnapshot;
use crate::models::request::GenerationRequest;

/// Lifecycle phase of a generation session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Start command sent, no progress reported yet.
    Initializing,
    /// Progress updates arriving.
    Running,
    /// Worker delivered every requested image.
    Completed,
    /// Cancelled by the operator.
    Cancelled,
    /// Ended by a worker, protocol, or I/O failure.
    Failed,
}

impl SessionPhase {
    /// Whether the phase is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Final result of a generation session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Outcome {
    /// Generated image paths, in arrival order.
    Completed {
        /// Paths reported by the worker.
        paths: Vec<PathBuf>,
    },
    /// Cancelled before the worker finished.
    Cancelled,
    /// Human-readable failure message.
    Failed {
        /// Error description.
        error: String,
    },
}

/// Read-consistent view of a session, cheap to clone for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    /// Current lifecycle phase.
    pub phase: SessionPhase,
    /// Latest progress snapshot.
    pub snapshot: ProgressSnapshot,
    /// Set once the phase is terminal.
    pub outcome: Option<Outcome>,
}

impl SessionView {
    /// View of a freshly started session.
    #[must_use]
    pub fn initializing(total_steps: u32) -> Self {
        Self {
            phase: SessionPhase::Initializing,
            snapshot: ProgressSnapshot::initial(total_steps),
            outcome: None,
        }
    }

    /// Whether the session reached a terminal phase.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Summary handed back when a finished session is cleared.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// Session identifier.
    pub session_id: String,
    /// The request the session ran.
    pub request: GenerationRequest,
    /// When the session was admitted.
    pub started_at: DateTime<Utc>,
    /// Final progress snapshot.
    pub snapshot: ProgressSnapshot,
    /// Terminal outcome.
    pub outcome: Outcome,
}
