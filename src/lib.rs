#![forbid(unsafe_code)]

//! Orchestration layer between a front end and a long-running
//! image-generation worker process.

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod protocol;
pub mod settings;
pub mod worker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
