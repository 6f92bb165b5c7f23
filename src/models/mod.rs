//! Domain model module declarations.

pub mod progress;
pub mod request;
pub mod session;
