//! Line readers for database slow logs.
//!
//! The slow-log parser consumes raw text lines through the [`Reader`] trait.
//! This crate provides three implementations of it:
//!
//! * [`Tailer`] follows a named file forever, across rename based rotation,
//!   in-place truncation and symlink retargeting, polling for new data on a
//!   fixed interval.
//! * [`SimpleReader`] reads a finite file once and then reports end of stream.
//! * [`MemoryReader`] serves lines from an in-memory byte sequence, mostly for
//!   tests.
//!
//! Every line returned by a reader includes its terminating `\n`. A trailing
//! fragment without a terminator is held back until it is completed. Lines are
//! decoded lossily, a [`Line`] also carries the raw byte length it occupies in
//! the input so byte offsets stay exact.
//!
//! ## Metrics
//!
//! `tail_bytes_read`: Total bytes read from the tailed file
//! `tail_rotations`: Times the tailed path resolved to a new file
//! `tail_truncations`: Times the tailed file shrank below the read position
//!

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]

use std::path::PathBuf;

use async_trait::async_trait;

mod buffer;
pub mod memory;
pub mod simple;
pub mod tail;

pub use memory::MemoryReader;
pub use simple::SimpleReader;
pub use tail::Tailer;

/// An enum to allow us to determine what operation caused an IO error as the
/// default error message lacks detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// Operation for `fs::File::open`
    Open,
    /// Operation for `fs::metadata` and `File::metadata`
    Metadata,
    /// Operation for `File::seek`
    Seek,
    /// Operation for `File::read`
    Read,
}

/// Errors produced by [`Reader`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No new data is available yet. Polling readers resolve this internally
    /// by sleeping, it never escapes `next_line`.
    #[error("no complete line available")]
    Empty,
    /// The reader is exhausted or has been closed. This is the end of the
    /// stream.
    #[error("reader closed")]
    Closed,
    /// Wrapper around [`std::io::Error`].
    #[error("IO error [{path}] during {operation:?}: {err}")]
    Io {
        /// The path being operated on
        path: PathBuf,
        /// The operation
        operation: IoOp,
        /// The error
        err: std::io::Error,
    },
}

impl Error {
    /// Whether this error signals the end of the stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}

/// A point-in-time view of a reader's progress through its input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderMetrics {
    /// Byte length of the current input.
    pub input_size: u64,
    /// Bytes consumed from the current input so far.
    pub input_pos: u64,
}

/// One line handed out by a [`Reader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// The line, terminator included. Invalid UTF-8 is replaced with U+FFFD.
    pub text: String,
    /// Raw bytes the line occupies in the current input. A fragment carried
    /// over from a previous input is not counted.
    pub len: u64,
}

impl From<&str> for Line {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
            len: text.len() as u64,
        }
    }
}

#[async_trait]
/// A source of raw text lines.
///
/// `next_line` may be called concurrently with `close` and `metrics` from
/// other tasks.
pub trait Reader: Send + Sync {
    /// Return the next complete line, including its `\n` terminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the stream is exhausted or the reader
    /// has been closed. I/O failures are returned as [`Error::Io`].
    async fn next_line(&self) -> Result<Line, Error>;

    /// Close the reader. Any blocked or future `next_line` call returns
    /// [`Error::Closed`] promptly, after delivering lines already buffered.
    ///
    /// # Errors
    ///
    /// Implementations may fail to release underlying resources.
    fn close(&self) -> Result<(), Error>;

    /// Snapshot of progress, `None` once the reader has been closed.
    fn metrics(&self) -> Option<ReaderMetrics>;

    /// Counter incremented every time the reader starts over at offset 0 of a
    /// new or truncated input.
    fn generation(&self) -> u64 {
        0
    }
}
