//! Worker launch abstraction.
//!
//! The [`WorkerLauncher`] trait decouples the coordinator from how a worker
//! comes into existence. Production code uses [`ProcessLauncher`]; embedders
//! and tests can hand back a [`WorkerProcess`] built over in-memory pipes.

use std::future::Future;
use std::pin::Pin;

use crate::config::WorkerConfig;
use crate::worker::process::WorkerProcess;
use crate::Result;

/// Produces a fresh worker each time the coordinator needs one.
pub trait WorkerLauncher: Send + Sync {
    /// Start a new worker.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Launch`](crate::AppError::Launch) if the worker
    /// cannot be started.
    fn launch(&self) -> Pin<Box<dyn Future<Output = Result<WorkerProcess>> + Send + '_>>;
}

/// Launches the configured worker executable as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: WorkerConfig,
}

impl ProcessLauncher {
    /// Launcher for the executable described by `config`.
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self) -> Pin<Box<dyn Future<Output = Result<WorkerProcess>> + Send + '_>> {
        Box::pin(async move { WorkerProcess::spawn(&self.config) })
    }
}
