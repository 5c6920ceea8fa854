//! The consumer side of the slow log pipeline.
//!
//! [`Pipeline`] follows a live slow log: a [`Tailer`] feeds a [`Parser`]
//! running in its own task, and the pipeline's loop fingerprints every event
//! and folds it into the current window's [`Aggregator`]. Each
//! `report_interval` the window is finalized and its result sent on. Once
//! shutdown is signaled the reader is closed, the parser drained and stopped,
//! and the last window reported.
//!
//! [`digest`] is the offline counterpart: it aggregates a finite reader into
//! a single result.
//!
//! ## Metrics
//!
//! `qan_reports_produced`: Window results handed to the report receiver
//!

use std::{sync::Arc, time::Duration};

use metrics::counter;
use qan_signal::Watcher;
use qan_slowlog::{Event, Options, Parser};
use qan_tail::{Reader, Tailer};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::{self, Aggregator, Settings},
    config::{self, Config},
    fingerprint,
};

/// Errors produced by [`Pipeline`] and [`digest`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    /// The slow log could not be opened.
    #[error("Reader error: {0}")]
    Reader(#[from] qan_tail::Error),
    /// The parser's event receiver was already handed out.
    #[error("Parser event receiver already taken")]
    EventsTaken,
}

fn add(aggregator: &mut Aggregator, event: &Event) {
    let (id, fingerprint) = fingerprint::classify(event);
    aggregator.add_event(event, &id, &fingerprint);
}

/// Send `result`. Returns `false` if nobody is listening any longer.
async fn report(reports: &mpsc::Sender<aggregator::Result>, result: aggregator::Result) -> bool {
    let classes = result.class.len();
    let total = result.global.total_queries;
    if reports.send(result).await.is_err() {
        warn!("report receiver dropped, window lost");
        return false;
    }
    counter!("qan_reports_produced").increment(1);
    info!("reported {classes} classes over {total} queries");
    true
}

#[derive(Debug)]
/// Follows one slow log and periodically reports on it.
pub struct Pipeline {
    reader: Arc<Tailer>,
    options: Options,
    settings: Settings,
    report_interval: Duration,
    shutdown: Watcher,
}

impl Pipeline {
    /// Create a new [`Pipeline`], opening the configured slow log.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the slow log
    /// cannot be opened.
    pub async fn new(config: Config, shutdown: Watcher) -> Result<Self, Error> {
        let options = config.parser_options()?;
        let settings = config.aggregator_settings()?;
        let reader =
            Tailer::open_at(&config.path, config.start_offset, config.poll_interval).await?;
        Ok(Self {
            reader: Arc::new(reader),
            options,
            settings,
            report_interval: config.report_interval,
            shutdown,
        })
    }

    /// Run the pipeline until shutdown is signaled, the parser fails or the
    /// report receiver goes away. A parser failure is reported in the final
    /// result's `error`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EventsTaken`] only if the parser misbehaves.
    pub async fn spin(self, reports: mpsc::Sender<aggregator::Result>) -> Result<(), Error> {
        let Self {
            reader,
            options,
            settings,
            report_interval,
            mut shutdown,
        } = self;

        let mut parser = Parser::new(Arc::clone(&reader), options);
        let mut events = parser.events().ok_or(Error::EventsTaken)?;
        let stop = parser.stop_handle();
        let worker = tokio::spawn(parser.start());

        let mut interval = time::interval_at(Instant::now() + report_interval, report_interval);
        let mut aggregator = settings.aggregator();
        loop {
            tokio::select! {
                () = shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
                _ = interval.tick() => {
                    let window = std::mem::replace(&mut aggregator, settings.aggregator());
                    if window.is_empty() {
                        debug!("no events this window");
                        continue;
                    }
                    if !report(&reports, window.finalize()).await {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("parser closed its event stream");
                        break;
                    };
                    add(&mut aggregator, &event);
                }
            }
        }

        if let Err(err) = reader.close() {
            warn!("failed to close {path}: {err}", path = reader.path().display());
        }
        // With the reader closed the parser runs out of lines, flushes any
        // open record and ends its stream.
        while let Some(event) = events.recv().await {
            add(&mut aggregator, &event);
        }
        stop.stop();

        let error = match worker.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                error!("parser failed: {err}");
                Some(err.to_string())
            }
            Err(err) => {
                error!("parser task failed: {err}");
                Some(err.to_string())
            }
        };

        if aggregator.is_empty() && error.is_none() {
            return Ok(());
        }
        let mut result = aggregator.finalize();
        if let Some(error) = error {
            result.error = error;
        }
        report(&reports, result).await;
        Ok(())
    }
}

/// Parse and aggregate everything `reader` yields into one result. A parser
/// failure ends the digest early and is reported in the result's `error`.
///
/// # Errors
///
/// Returns [`Error::EventsTaken`] only if the parser misbehaves.
pub async fn digest<R>(
    reader: Arc<R>,
    options: Options,
    settings: Settings,
) -> Result<aggregator::Result, Error>
where
    R: Reader + ?Sized,
{
    let mut parser = Parser::new(reader, options);
    let mut events = parser.events().ok_or(Error::EventsTaken)?;
    let mut aggregator = settings.aggregator();

    let consume = async {
        while let Some(event) = events.recv().await {
            add(&mut aggregator, &event);
        }
    };
    let (parsed, ()) = tokio::join!(parser.start(), consume);

    let mut result = aggregator.finalize();
    if let Err(err) = parsed {
        error!("parser failed: {err}");
        result.error = err.to_string();
    }
    Ok(result)
}
