//! Acquisition sources feeding the producer loop.
//!
//! Sources must be cancel safe: the producer polls them inside `select!`, so
//! dropping a pending `next_scan` future must not lose a scan.

use std::io;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Longest accepted scan line in bytes
pub const MAX_LINE_LENGTH: usize = 1024;

/// One poll of an acquisition source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePoll {
    /// A raw scan string, not yet validated
    Scan(String),
    /// Nothing available right now; poll again later
    Empty,
    /// The source is exhausted
    Closed,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Acquisition source I/O error: {message}")]
    Io { message: String },

    #[error("Scan line exceeds {max} bytes")]
    LineTooLong { max: usize },
}

impl SourceError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Whether the source can still be polled after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LineTooLong { .. })
    }
}

impl From<io::Error> for SourceError {
    fn from(err: io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Produces raw scan strings
#[async_trait]
pub trait AcquisitionSource: Send {
    async fn next_scan(&mut self) -> Result<SourcePoll, SourceError>;
}

/// Newline-delimited scans from any async reader (stdin, a file, a FIFO)
///
/// Blank lines poll as [`SourcePoll::Empty`]; end of input is
/// [`SourcePoll::Closed`]. A line longer than [`MAX_LINE_LENGTH`] is reported
/// as soon as the limit is crossed and the rest of it is discarded.
#[derive(Debug)]
pub struct LineSource<R> {
    lines: FramedRead<R, LinesCodec>,
    decode_failed: bool,
}

impl<R: AsyncRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            decode_failed: false,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> AcquisitionSource for LineSource<R> {
    async fn next_scan(&mut self) -> Result<SourcePoll, SourceError> {
        if self.decode_failed {
            // The stream yields one `None` after a decoder error, then resumes
            self.decode_failed = false;
            let _ = self.lines.next().await;
        }

        match self.lines.next().await {
            Some(Ok(line)) if line.trim().is_empty() => Ok(SourcePoll::Empty),
            Some(Ok(line)) => Ok(SourcePoll::Scan(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                self.decode_failed = true;
                Err(SourceError::LineTooLong {
                    max: MAX_LINE_LENGTH,
                })
            }
            Some(Err(LinesCodecError::Io(e))) => {
                self.decode_failed = true;
                Err(e.into())
            }
            None => Ok(SourcePoll::Closed),
        }
    }
}

type BlockingRead<F> = JoinHandle<(F, io::Result<Option<String>>)>;

/// Wraps a blocking reader such as a scanner driver call
///
/// The reader runs on the blocking thread pool. `Ok(None)` means no scan was
/// available; an `UnexpectedEof` error closes the source. A read interrupted by
/// cancellation keeps running and its result is returned by the next call.
pub struct BlockingSource<F> {
    reader: Option<F>,
    pending: Option<BlockingRead<F>>,
}

impl<F> std::fmt::Debug for BlockingSource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingSource")
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl<F> BlockingSource<F>
where
    F: FnMut() -> io::Result<Option<String>> + Send + 'static,
{
    pub fn new(reader: F) -> Self {
        Self {
            reader: Some(reader),
            pending: None,
        }
    }
}

#[async_trait]
impl<F> AcquisitionSource for BlockingSource<F>
where
    F: FnMut() -> io::Result<Option<String>> + Send + 'static,
{
    async fn next_scan(&mut self) -> Result<SourcePoll, SourceError> {
        if self.pending.is_none() {
            let Some(mut reader) = self.reader.take() else {
                return Ok(SourcePoll::Closed);
            };
            self.pending = Some(tokio::task::spawn_blocking(move || {
                let result = reader();
                (reader, result)
            }));
        }

        let Some(pending) = self.pending.as_mut() else {
            return Ok(SourcePoll::Closed);
        };
        let joined = pending.await;
        self.pending = None;

        let (reader, result) =
            joined.map_err(|e| SourceError::io(format!("blocking reader failed: {}", e)))?;
        match result {
            Ok(Some(scan)) => {
                self.reader = Some(reader);
                Ok(SourcePoll::Scan(scan))
            }
            Ok(None) => {
                self.reader = Some(reader);
                Ok(SourcePoll::Empty)
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(SourcePoll::Closed),
            Err(e) => {
                self.reader = Some(reader);
                Err(e.into())
            }
        }
    }
}
