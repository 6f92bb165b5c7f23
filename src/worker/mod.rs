//! Worker process management.
//!
//! - `process`: spawning, line I/O, and termination of the worker.
//! - `launcher`: the seam the coordinator uses to obtain workers.
//! - `reader`: the dedicated task that turns worker output into events.

pub mod launcher;
pub mod process;
pub mod reader;
