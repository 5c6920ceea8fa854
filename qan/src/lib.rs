//! Query analytics over the MySQL slow query log.
//!
//! This crate ties the workspace together. A [`pipeline::Pipeline`] follows a
//! slow log with [`qan_tail::Tailer`], parses it with
//! [`qan_slowlog::Parser`] and groups the resulting events into classes of
//! structurally identical queries, see [`fingerprint`]. Each reporting window
//! produces an [`aggregator::Result`] holding per-class and global statistics.

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
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregator;
pub mod config;
pub mod fingerprint;
pub mod pipeline;
