//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Settings load, validation, or save failure.
    Settings(String),
    /// A generation request field is out of range or missing.
    Validation(String),
    /// A generation session already occupies the coordinator slot.
    AlreadyActive(String),
    /// No generation session is active.
    NotActive(String),
    /// The worker process could not be started.
    Launch(String),
    /// Writing to the worker's input pipe failed.
    Write(String),
    /// A protocol line from the worker could not be decoded.
    Decode(String),
    /// The worker reported an explicit error.
    Worker(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Settings(msg) => write!(f, "settings: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::AlreadyActive(msg) => write!(f, "already active: {msg}"),
            Self::NotActive(msg) => write!(f, "not active: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Write(msg) => write!(f, "write: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Worker(msg) => write!(f, "worker: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Settings(format!("failed to serialize settings: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
