use std::{path::PathBuf, process::exit, sync::Arc};

use clap::Parser;
use qan::{
    aggregator::{Class, Settings},
    pipeline,
};
use qan_slowlog::Options;
use qan_tail::SimpleReader;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Queries slower than this many seconds are counted as outliers
    #[clap(long, default_value_t = 0.0)]
    outlier_time: f64,

    /// Show only the N classes with the largest total `Query_time`
    #[clap(long)]
    top: Option<usize>,

    /// Admin command to drop, repeatable. Replaces the default list.
    #[clap(long = "filter-admin-command")]
    filter_admin_commands: Vec<String>,

    /// Path to the slow log to digest
    slowlog: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Reader(#[from] qan_tail::Error),
    #[error(transparent)]
    Pipeline(#[from] pipeline::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Digest<'a> {
    global: &'a Class,
    class: Vec<&'a Class>,
    rate_limit: u64,
    error: &'a str,
}

fn query_time_sum(class: &Class) -> f64 {
    class
        .metrics
        .time_metrics
        .get("Query_time")
        .map_or(0.0, |stats| stats.sum)
}

async fn run(args: Args) -> Result<(), Error> {
    let reader = Arc::new(SimpleReader::open(&args.slowlog, 0).await?);
    let mut options = Options::default();
    if !args.filter_admin_commands.is_empty() {
        options.filter_admin_commands = args.filter_admin_commands.into_iter().collect();
    }
    let settings = Settings {
        outlier_time: args.outlier_time,
        ..Settings::default()
    };

    let result = pipeline::digest(reader, options, settings).await?;
    info!(
        "digested {total} queries into {classes} classes",
        total = result.global.total_queries,
        classes = result.class.len()
    );

    let mut classes: Vec<&Class> = result.class.values().collect();
    classes.sort_by(|a, b| query_time_sum(b).total_cmp(&query_time_sum(a)));
    if let Some(top) = args.top {
        classes.truncate(top);
    }
    let digest = Digest {
        global: &result.global,
        class: classes,
        rate_limit: result.rate_limit,
        error: &result.error,
    };
    println!("{}", serde_json::to_string_pretty(&digest)?);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .finish()
        .init();

    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Could not build runtime: {e}");
            exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(args)) {
        error!("{e}");
        exit(1);
    }
}
