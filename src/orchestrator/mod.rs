//! Generation orchestration.
//!
//! - `session`: per-generation state machine.
//! - `coordinator`: single-slot admission control and event routing.
//! - `progress_sync`: periodic publication of session progress.

pub mod coordinator;
pub mod progress_sync;
pub mod session;
