//! The slow log parser.
//!
//! Parsing is split in two. [`Machine`] is the synchronous state machine: it
//! is fed one line at a time and answers with at most one completed
//! [`Event`]. [`Parser`] is the worker around it that pulls lines from a
//! [`Reader`], pushes completed events into a single slot channel and honours
//! stop requests while blocked on either side.
//!
//! A record completes when a new header begins after query text, when an
//! admin command that is not filtered out is seen, or when the stream ends
//! with query text pending. Records that complete without a `Query_time` are
//! dropped: they are the tail of a record whose head was never read, for
//! instance because parsing began mid-record.

use std::sync::Arc;

use metrics::counter;
use once_cell::sync::Lazy;
use qan_tail::{Line, Reader};
use regex::Regex;
use rustc_hash::FxHashSet;
use time::UtcOffset;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::{
    Error,
    classify::{Field, classify},
    event::Event,
    timestamp,
};

static TIME_LEGACY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Time: (\S+\s{1,2}\S+)").expect("Invalid regex pattern provided"));
static TIME_RFC3339: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Time:\s+(\d{4}-\d{2}-\d{2}\S+)").expect("Invalid regex pattern provided")
});
static USER_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"User@Host: ([^\[]+|\[[^\[]+\]).*?@ (\S*) \[(.*)\]")
        .expect("Invalid regex pattern provided")
});
static SCHEMA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Schema: +(.*?) +Last_errno:").expect("Invalid regex pattern provided")
});
static HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#\s+[A-Z]").expect("Invalid regex pattern provided"));
static METRIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w+): (\S+|\z)").expect("Invalid regex pattern provided"));
static ADMIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"command: (.+)").expect("Invalid regex pattern provided"));
static SET_SESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^SET (?:last_insert_id|insert_id|timestamp)")
        .expect("Invalid regex pattern provided")
});
static USE_DB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^use ").expect("Invalid regex pattern provided"));

/// Admin commands dropped unless configured otherwise. Replication threads
/// log these continuously.
pub const DEFAULT_FILTERED_ADMIN_COMMANDS: [&str; 2] = ["Binlog Dump", "Binlog Dump GTID"];

#[derive(Debug, Clone)]
/// Configuration of [`Parser`].
pub struct Options {
    /// Byte offset in the source file of the reader's first line. Event
    /// offsets are counted from here.
    pub start_offset: u64,
    /// Admin commands, without trailing `;`, that produce no event.
    pub filter_admin_commands: FxHashSet<String>,
    /// Log every line as it is parsed.
    pub debug: bool,
    /// Offset applied to timestamps that carry no zone of their own.
    pub default_offset: UtcOffset,
    /// Stamped into every event's `server`.
    pub server: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            start_offset: 0,
            filter_admin_commands: DEFAULT_FILTERED_ADMIN_COMMANDS
                .iter()
                .map(|cmd| (*cmd).to_string())
                .collect(),
            debug: false,
            default_offset: UtcOffset::UTC,
            server: String::new(),
        }
    }
}

/// Lines that belong to no record: the server's start banner, the column
/// header that follows it, empty comments and `MariaDB` explain output.
fn is_meta(line: &str) -> bool {
    if line.len() >= 20
        && ((line.starts_with('/') && line.ends_with("with:\n"))
            || line.starts_with("Time ")
            || line.starts_with("Tcp ")
            || line.starts_with("TCP "))
    {
        return true;
    }
    line == "#\n" || line.starts_with("# explain:")
}

#[derive(Debug)]
/// The line driven record state machine.
pub struct Machine {
    options: Options,
    event: Event,
    in_header: bool,
    in_query: bool,
    header_lines: u64,
    query_lines: u64,
    bytes_read: u64,
    line_offset: u64,
}

impl Machine {
    /// Create a machine positioned at `options.start_offset`.
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self {
            event: Event::new(&options.server),
            bytes_read: options.start_offset,
            line_offset: options.start_offset,
            in_header: false,
            in_query: false,
            header_lines: 0,
            query_lines: 0,
            options,
        }
    }

    /// Restart byte counting at 0, for when the reader moved on to a new or
    /// truncated file.
    pub fn rebase(&mut self) {
        debug!(
            "input restarted after {bytes} bytes, offsets rebased",
            bytes = self.bytes_read
        );
        self.bytes_read = 0;
        self.line_offset = 0;
    }

    /// Feed one line. Offsets advance by the line's raw byte length, not by
    /// the length of its decoded text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingQueryTime`] if the machine's state is
    /// inconsistent. The machine must not be fed further.
    pub fn feed(&mut self, line: &Line) -> Result<Option<Event>, Error> {
        let raw = line.text.as_str();
        self.line_offset = self.bytes_read;
        self.bytes_read += line.len;

        if self.options.debug {
            trace!(
                offset = self.line_offset,
                in_header = self.in_header,
                in_query = self.in_query,
                "line: {raw:?}"
            );
        }
        if is_meta(raw) {
            return Ok(None);
        }

        let line = raw.strip_suffix('\n').unwrap_or(raw);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if self.in_header {
            self.parse_header(line)
        } else if self.in_query {
            self.parse_query(line)
        } else if HEADER.is_match(line) {
            self.in_header = true;
            self.in_query = false;
            self.parse_header(line)
        } else {
            Ok(None)
        }
    }

    /// Signal end of stream, flushing a record with pending query text.
    ///
    /// # Errors
    ///
    /// See [`Machine::feed`].
    pub fn finish(&mut self) -> Result<Option<Event>, Error> {
        if self.query_lines == 0 {
            if self.header_lines > 0 {
                debug!(
                    "stream ended inside the header of the record at {offset}",
                    offset = self.event.offset
                );
            }
            return Ok(None);
        }
        self.complete(self.bytes_read, false, false)
    }

    fn parse_header(&mut self, line: &str) -> Result<Option<Event>, Error> {
        if !HEADER.is_match(line) {
            self.in_header = false;
            self.in_query = true;
            return self.parse_query(line);
        }

        if self.header_lines == 0 {
            self.event.offset = self.line_offset;
        }
        self.header_lines += 1;

        if line.starts_with("# Time") {
            let offset = self.options.default_offset;
            let ts = TIME_LEGACY
                .captures(line)
                .and_then(|caps| timestamp::parse_legacy(&caps[1], offset))
                .or_else(|| {
                    TIME_RFC3339
                        .captures(line)
                        .and_then(|caps| timestamp::parse_rfc3339(&caps[1], offset))
                });
            let Some(ts) = ts else {
                debug!("unparseable time line: {line:?}");
                return Ok(None);
            };
            self.event.ts = Some(ts);
            // Some dialects put the user on the time line.
            self.parse_user_host(line);
        } else if line.starts_with("# User") {
            self.parse_user_host(line);
        } else {
            self.parse_metrics(line);
        }
        Ok(None)
    }

    fn parse_user_host(&mut self, line: &str) {
        if let Some(caps) = USER_HOST.captures(line) {
            self.event.user = caps[1].to_string();
            self.event.host = caps[2].to_string();
        }
    }

    fn parse_metrics(&mut self, line: &str) {
        if let Some(caps) = SCHEMA.captures(line) {
            self.event.db = caps[1].to_string();
        }
        for caps in METRIC.captures_iter(line) {
            let (key, value) = (&caps[1], &caps[2]);
            match classify(key, value) {
                Some(Field::Time(v)) => {
                    self.event.time_metrics.insert(key.to_string(), v);
                }
                Some(Field::Bool(v)) => {
                    self.event.bool_metrics.insert(key.to_string(), v);
                }
                Some(Field::Schema(db)) => self.event.db = db.to_string(),
                Some(Field::RateType(kind)) => self.event.rate_type = kind.to_string(),
                Some(Field::RateLimit(limit)) => self.event.rate_limit = limit,
                Some(Field::Number(v)) => {
                    self.event.number_metrics.insert(key.to_string(), v);
                }
                None => {
                    if self.options.debug {
                        trace!("skipping malformed metric {key}: {value:?}");
                    }
                }
            }
        }
    }

    fn parse_query(&mut self, line: &str) -> Result<Option<Event>, Error> {
        if line.starts_with("# admin") {
            return self.parse_admin(line);
        }
        if HEADER.is_match(line) {
            let event = self.complete(self.line_offset, true, false)?;
            self.parse_header(line)?;
            return Ok(event);
        }

        if let Some(prefix) = USE_DB.find(line).filter(|_| self.query_lines == 0) {
            let db = line[prefix.end()..].trim_end_matches(';').trim_matches('`');
            self.event.db = db.to_string();
            // A bare `USE db` stands in as the query until real query text
            // replaces it.
            self.event.query = line.to_string();
        } else if SET_SESSION.is_match(line) {
            // Session boilerplate the server logs ahead of the query.
        } else {
            if self.query_lines > 0 {
                self.event.query.push('\n');
                self.event.query.push_str(line);
            } else {
                self.event.query = line.to_string();
            }
            self.query_lines += 1;
        }
        Ok(None)
    }

    fn parse_admin(&mut self, line: &str) -> Result<Option<Event>, Error> {
        let Some(caps) = ADMIN.captures(line) else {
            return Ok(None);
        };
        let command = &caps[1];
        let command = command.strip_suffix(';').unwrap_or(command);

        if self.options.filter_admin_commands.contains(command) {
            debug!("filtered admin command {command:?}");
            counter!("slowlog_admin_filtered").increment(1);
            self.reset(false, false);
            return Ok(None);
        }

        self.event.admin = true;
        self.event.query = command.to_string();
        self.complete(self.bytes_read, false, false)
    }

    fn reset(&mut self, in_header: bool, in_query: bool) {
        self.event = Event::new(&self.options.server);
        self.header_lines = 0;
        self.query_lines = 0;
        self.in_header = in_header;
        self.in_query = in_query;
    }

    fn complete(
        &mut self,
        offset_end: u64,
        in_header: bool,
        in_query: bool,
    ) -> Result<Option<Event>, Error> {
        let mut event = std::mem::replace(&mut self.event, Event::new(&self.options.server));
        let header_lines = self.header_lines;
        self.reset(in_header, in_query);

        if event.query_time().is_none() {
            if header_lines == 0 {
                error!(
                    "record completed at {offset} without header or Query_time: {event:?}",
                    offset = self.line_offset
                );
                return Err(Error::MissingQueryTime {
                    offset: self.line_offset,
                });
            }
            debug!(
                "discarding record at {offset} without Query_time",
                offset = event.offset
            );
            counter!("slowlog_records_discarded").increment(1);
            return Ok(None);
        }

        event.offset_end = offset_end;
        if let Some(db) = event.db.strip_suffix(";\n").or_else(|| event.db.strip_suffix(';')) {
            event.db = db.to_string();
        }
        if let Some(query) = event.query.strip_suffix(';') {
            event.query = query.to_string();
        }
        Ok(Some(event))
    }
}

#[derive(Debug, Clone)]
/// Requests that a running [`Parser`] stop.
pub struct StopHandle {
    trigger: qan_signal::Trigger,
}

impl StopHandle {
    /// Stop the parser. Safe to call any number of times; only the first call
    /// has an effect.
    pub fn stop(&self) {
        if self.trigger.signal() {
            info!("parser stop requested");
        }
    }
}

#[derive(Debug)]
/// The parser worker.
///
/// Construct it over a reader, take the event receiver with
/// [`Parser::events`], then drive it with [`Parser::start`], typically in
/// its own task. The receiver yields events in log order and closes once the
/// parser returns.
pub struct Parser<R: ?Sized> {
    reader: Arc<R>,
    machine: Machine,
    generation: u64,
    sender: mpsc::Sender<Event>,
    receiver: Option<mpsc::Receiver<Event>>,
    stop: StopHandle,
}

impl<R> Parser<R>
where
    R: Reader + ?Sized,
{
    /// Create a new [`Parser`].
    pub fn new(reader: Arc<R>, options: Options) -> Self {
        // A single slot: the worker blocks until the consumer has taken the
        // previous event.
        let (sender, receiver) = mpsc::channel(1);
        let (_watcher, trigger) = qan_signal::signal();
        Self {
            generation: reader.generation(),
            reader,
            machine: Machine::new(options),
            sender,
            receiver: Some(receiver),
            stop: StopHandle { trigger },
        }
    }

    /// The receiving end of the event channel. Returns `None` after the first
    /// call.
    pub fn events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.receiver.take()
    }

    /// A handle through which the parser may be stopped once started.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request the parser stop. See [`StopHandle::stop`].
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Run the parser until the reader reports end of stream, an error occurs
    /// or a stop is requested. The event channel closes when this returns.
    ///
    /// # Errors
    ///
    /// Reader I/O errors are returned as [`Error::Reader`]. An inconsistent
    /// record is fatal and returned as [`Error::MissingQueryTime`].
    pub async fn start(mut self) -> Result<(), Error> {
        let mut stopped = self.stop.trigger.watcher();
        loop {
            let line = tokio::select! {
                biased;
                () = stopped.recv() => {
                    info!("parser stopped");
                    return Ok(());
                }
                line = self.reader.next_line() => line,
            };
            let line = match line {
                Ok(line) => line,
                Err(qan_tail::Error::Closed) => break,
                Err(err) => {
                    error!("reader failed: {err}");
                    return Err(Error::Reader(err));
                }
            };

            let generation = self.reader.generation();
            if generation != self.generation {
                self.generation = generation;
                self.machine.rebase();
            }

            let Some(event) = self.machine.feed(&line)? else {
                continue;
            };
            if !self.send(event, &mut stopped).await {
                return Ok(());
            }
        }

        if let Some(event) = self.machine.finish()? {
            self.send(event, &mut stopped).await;
        }
        info!("parser reached end of stream");
        Ok(())
    }

    /// Hand `event` to the consumer. Returns `false` if the parser should stop
    /// instead, either by request or because the consumer is gone.
    async fn send(&self, event: Event, stopped: &mut qan_signal::Watcher) -> bool {
        tokio::select! {
            biased;
            () = stopped.recv() => {
                info!("parser stopped while handing off an event");
                false
            }
            res = self.sender.send(event) => {
                if res.is_ok() {
                    counter!("slowlog_events_emitted").increment(1);
                    true
                } else {
                    info!("event consumer went away, parser stopping");
                    false
                }
            }
        }
    }
}
