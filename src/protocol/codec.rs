//! Line framing for the worker's stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! runaway worker cannot make us buffer unbounded output. Unlike a plain
//! `LinesCodec`, oversized and non-UTF-8 lines are surfaced as items rather
//! than errors: a `FramedRead` stops after its first decoder error, and a
//! single bad line must not end the stream.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length accepted from the worker: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One framed line from the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    /// A complete UTF-8 line without its terminator.
    Text(String),
    /// A line longer than the configured limit; its bytes were discarded.
    TooLong,
    /// A line that was not valid UTF-8.
    Invalid(String),
}

/// Newline-delimited codec for worker stdio.
#[derive(Debug)]
pub struct WorkerCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl WorkerCodec {
    /// Codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    /// Configured line limit in bytes.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for WorkerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WorkerCodec {
    type Item = RawLine;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        classify(self.inner.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        classify(self.inner.decode_eof(src))
    }
}

fn classify(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
) -> Result<Option<RawLine>> {
    match decoded {
        Ok(line) => Ok(line.map(RawLine::Text)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(RawLine::TooLong)),
        Err(LinesCodecError::Io(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
            Ok(Some(RawLine::Invalid(err.to_string())))
        }
        Err(LinesCodecError::Io(err)) => Err(err.into()),
    }
}
