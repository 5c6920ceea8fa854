//! Parsing of the classic MySQL slow query log.
//!
//! A slow log is a loosely structured, line oriented text format. Each record
//! is a block of `# `-prefixed header lines carrying timing metrics and
//! connection details, followed by one or more lines of query text:
//!
//! ```text
//! # Time: 071015 21:43:52
//! # User@Host: root[root] @ localhost []
//! # Query_time: 2  Lock_time: 0  Rows_sent: 1  Rows_examined: 0
//! use test;
//! select sleep(2) from n;
//! ```
//!
//! [`Parser`] drives a two state machine (header, query body) over the lines of
//! a [`qan_tail::Reader`] and hands complete [`Event`]s to a consumer through a
//! single slot channel, so that a slow consumer stalls the parser rather than
//! letting events pile up.
//!
//! ## Metrics
//!
//! `slowlog_events_emitted`: Events handed to the consumer
//! `slowlog_records_discarded`: Records dropped for lacking `Query_time`
//! `slowlog_admin_filtered`: Admin commands dropped by the filter list
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
#![deny(missing_debug_implementations)]
#![allow(clippy::module_name_repetitions)]

pub mod classify;
pub mod event;
pub mod parser;
mod timestamp;

pub use event::Event;
pub use parser::{Options, Parser, StopHandle};

/// Errors produced by [`Parser`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The underlying reader failed.
    #[error("Reader error: {0}")]
    Reader(#[from] qan_tail::Error),
    /// A record completed without a `Query_time` although no header line was
    /// seen for it. The parser state is inconsistent and parsing stops.
    #[error("Record ending at byte {offset} has no header and no Query_time")]
    MissingQueryTime {
        /// Byte offset of the line that completed the record
        offset: u64,
    },
}
