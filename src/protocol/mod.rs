//! Worker line protocol.
//!
//! - `codec`: newline framing with a per-line size limit.
//! - `message`: `<marker> <code> <json>` encoding and tagged decoding.
//! - `lines`: a decoded response stream over the worker's stdout.

pub mod codec;
pub mod lines;
pub mod message;
