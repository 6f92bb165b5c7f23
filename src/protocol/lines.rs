//! Decoded line stream over a worker's stdout.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::protocol::codec::{RawLine, WorkerCodec};
use crate::protocol::message::{decode_line, Response};
use crate::{AppError, Result};

/// Boxed byte source used for worker output.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Single-pass sequence of decoded worker responses.
///
/// Noise lines are skipped inside [`next`](Self::next). Malformed protocol
/// lines come back as `Some(Err(AppError::Decode(..)))` and the stream keeps
/// going; an I/O failure comes back as `Some(Err(AppError::Io(..)))` and
/// ends the stream.
pub struct WorkerLines {
    framed: FramedRead<BoxedReader, WorkerCodec>,
    finished: bool,
}

impl std::fmt::Debug for WorkerLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLines")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl WorkerLines {
    /// Wrap `reader` with a codec that rejects lines over `max_line_bytes`.
    #[must_use]
    pub fn new(reader: BoxedReader, max_line_bytes: usize) -> Self {
        Self {
            framed: FramedRead::new(reader, WorkerCodec::with_max_length(max_line_bytes)),
            finished: false,
        }
    }

    /// Next decoded response, or `None` once the worker closes its output.
    pub async fn next(&mut self) -> Option<Result<Response>> {
        if self.finished {
            return None;
        }

        loop {
            let Some(item) = self.framed.next().await else {
                self.finished = true;
                return None;
            };

            match item {
                Ok(RawLine::Text(line)) => match decode_line(&line) {
                    Ok(Some(response)) => return Some(Ok(response)),
                    Ok(None) => {
                        if !line.trim().is_empty() {
                            debug!(line = %line, "worker output: skipping non-protocol line");
                        }
                    }
                    Err(err) => return Some(Err(err)),
                },
                Ok(RawLine::TooLong) => {
                    return Some(Err(AppError::Decode(format!(
                        "line too long: exceeded {} bytes",
                        self.framed.decoder().max_length()
                    ))));
                }
                Ok(RawLine::Invalid(reason)) => {
                    return Some(Err(AppError::Decode(format!("invalid line: {reason}"))));
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
