//! This module controls configuration parsing from the end user. A
//! configuration names the slow log to follow and how its events are
//! aggregated and reported.
use std::{
    io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use qan_slowlog::parser::{DEFAULT_FILTERED_ADMIN_COMMANDS, Options};
use serde::Deserialize;
use time::UtcOffset;

use crate::aggregator::{DEFAULT_MAX_EXAMPLE_BYTES, Settings};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// A duration that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// The UTC offset is out of range
    #[error("Invalid utc_offset_seconds {seconds}: {source}")]
    UtcOffset {
        /// Configured offset
        seconds: i32,
        /// Range error
        #[source]
        source: time::error::ComponentRange,
    },
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_filter_admin_commands() -> Vec<String> {
    DEFAULT_FILTERED_ADMIN_COMMANDS
        .iter()
        .map(|cmd| (*cmd).to_string())
        .collect()
}

fn default_max_example_bytes() -> usize {
    DEFAULT_MAX_EXAMPLE_BYTES
}

fn default_keep_samples() -> bool {
    true
}

/// Main configuration struct for this program
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The slow log to follow
    pub path: PathBuf,
    /// Sleep between reads that find no new data
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Queries slower than this many seconds are outliers, 0 disables
    #[serde(default)]
    pub outlier_time: f64,
    /// Length of one aggregation window
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,
    /// Admin commands to drop, without trailing `;`
    #[serde(default = "default_filter_admin_commands")]
    pub filter_admin_commands: Vec<String>,
    /// Offset of zone-less log timestamps from UTC, also applied to example
    /// timestamps
    #[serde(default)]
    pub utc_offset_seconds: i32,
    /// Cap on example query text, bytes
    #[serde(default = "default_max_example_bytes")]
    pub max_example_bytes: usize,
    /// Keep the slowest query of every class as its example
    #[serde(default = "default_keep_samples")]
    pub keep_samples: bool,
    /// Name stamped on every event
    #[serde(default)]
    pub server: String,
    /// Byte offset to start reading at
    #[serde(default)]
    pub start_offset: u64,
    /// Trace every parsed line
    #[serde(default)]
    pub debug: bool,
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Load and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML for
    /// this struct or fails validation.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        contents.parse()
    }

    fn validate(&self) -> Result<(), Error> {
        if self.poll_interval.is_zero() {
            return Err(Error::ZeroDuration("poll_interval"));
        }
        if self.report_interval.is_zero() {
            return Err(Error::ZeroDuration("report_interval"));
        }
        self.utc_offset()?;
        Ok(())
    }

    /// The configured UTC offset.
    ///
    /// # Errors
    ///
    /// Returns an error if `utc_offset_seconds` is out of range.
    pub fn utc_offset(&self) -> Result<UtcOffset, Error> {
        UtcOffset::from_whole_seconds(self.utc_offset_seconds).map_err(|source| {
            Error::UtcOffset {
                seconds: self.utc_offset_seconds,
                source,
            }
        })
    }

    /// Parser options for this configuration.
    ///
    /// # Errors
    ///
    /// See [`Config::utc_offset`].
    pub fn parser_options(&self) -> Result<Options, Error> {
        Ok(Options {
            start_offset: self.start_offset,
            filter_admin_commands: self.filter_admin_commands.iter().cloned().collect(),
            debug: self.debug,
            default_offset: self.utc_offset()?,
            server: self.server.clone(),
        })
    }

    /// Aggregator settings for this configuration.
    ///
    /// # Errors
    ///
    /// See [`Config::utc_offset`].
    pub fn aggregator_settings(&self) -> Result<Settings, Error> {
        Ok(Settings {
            samples: self.keep_samples,
            utc_offset: self.utc_offset()?,
            outlier_time: self.outlier_time,
            max_example_bytes: self.max_example_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf, time::Duration};

    use super::{Config, Error};

    #[test]
    fn minimal_config_takes_defaults() {
        let config: Config = "path: /var/log/mysql/slow.log".parse().expect("config");
        assert_eq!(config.path, PathBuf::from("/var/log/mysql/slow.log"));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.report_interval, Duration::from_secs(60));
        assert_eq!(
            config.filter_admin_commands,
            vec!["Binlog Dump".to_string(), "Binlog Dump GTID".to_string()]
        );
        assert_eq!(config.max_example_bytes, 20_480);
        assert!(config.keep_samples);
        assert!(!config.debug);

        let options = config.parser_options().expect("options");
        assert!(options.filter_admin_commands.contains("Binlog Dump GTID"));
        assert_eq!(options.start_offset, 0);
    }

    #[test]
    fn full_config_from_file() {
        let yaml = r#"
path: /tmp/slow.log
poll_interval: 250ms
outlier_time: 10.5
report_interval: 5m
filter_admin_commands: []
utc_offset_seconds: -18000
max_example_bytes: 1024
keep_samples: false
server: db-1
start_offset: 4096
debug: true
"#;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(yaml.as_bytes()).expect("write");

        let config = Config::from_path(file.path()).expect("config");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.report_interval, Duration::from_secs(300));
        assert!(config.filter_admin_commands.is_empty());
        assert_eq!(config.server, "db-1");

        let settings = config.aggregator_settings().expect("settings");
        assert!(!settings.samples);
        assert_eq!(settings.outlier_time, 10.5);
        assert_eq!(settings.max_example_bytes, 1024);
        assert_eq!(settings.utc_offset.whole_seconds(), -18_000);

        let options = config.parser_options().expect("options");
        assert_eq!(options.start_offset, 4096);
        assert_eq!(options.server, "db-1");
        assert!(options.debug);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res = "path: /tmp/slow.log\npoll: 1s".parse::<Config>();
        assert!(matches!(res, Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let res = "path: /tmp/slow.log\nreport_interval: 0s".parse::<Config>();
        assert!(matches!(res, Err(Error::ZeroDuration("report_interval"))));
    }

    #[test]
    fn offset_out_of_range() {
        let res = "path: /tmp/slow.log\nutc_offset_seconds: 100000".parse::<Config>();
        assert!(matches!(res, Err(Error::UtcOffset { seconds: 100_000, .. })));
    }

    #[test]
    fn missing_file() {
        let res = Config::from_path(std::path::Path::new("/nonexistent/qan.yaml"));
        assert!(matches!(res, Err(Error::ReadFile { .. })));
    }
}
