//! Progress snapshot published to observers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Status label shown before the worker reports anything.
pub const INITIAL_STATUS: &str = "Initializing...";

/// Point-in-time view of a generation's progress.
///
/// `current_step` never exceeds `total_steps`; `total_steps` is copied from
/// the request when the session starts and is fixed for the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProgressSnapshot {
    /// Last step reported by the worker.
    pub current_step: u32,
    /// Step count requested for this session.
    pub total_steps: u32,
    /// Free-text phase description.
    pub status: String,
    /// The session finished with a result.
    pub is_complete: bool,
    /// The session was cancelled.
    pub is_cancelled: bool,
}

impl ProgressSnapshot {
    /// Snapshot at session start.
    #[must_use]
    pub fn initial(total_steps: u32) -> Self {
        Self {
            current_step: 0,
            total_steps,
            status: INITIAL_STATUS.to_owned(),
            is_complete: false,
            is_cancelled: false,
        }
    }

    /// Steps still outstanding.
    #[must_use]
    pub fn remaining_steps(&self) -> u32 {
        self.total_steps.saturating_sub(self.current_step)
    }

    /// Completed fraction in `0.0..=1.0`; zero when no steps are expected.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        f64::from(self.current_step) / f64::from(self.total_steps)
    }
}

/// Estimate time remaining as `elapsed / completed * remaining`.
///
/// Returns `None` when no step has completed yet.
#[must_use]
pub fn estimate_remaining(elapsed: Duration, current_step: u32, total_steps: u32) -> Option<Duration> {
    if current_step == 0 {
        return None;
    }
    let remaining = total_steps.saturating_sub(current_step);
    let per_step = elapsed.as_secs_f64() / f64::from(current_step);
    Some(Duration::from_secs_f64(per_step * f64::from(remaining)))
}
