//! Log level, format and filter resolution.
//!
//! A level comes from, lowest precedence first: the default (`info`),
//! RUST_LOG, TQ_LOG, then `--log-level`. RUST_LOG keeps its full directive
//! syntax only while nothing above it has picked a level.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

/// Log output format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    #[value(alias = "console")]
    Human,
    /// One JSON object per line.
    #[value(alias = "json")]
    Jsonl,
}

/// Log level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    /// Queue mode changes and evictions (default).
    #[default]
    Info,
    /// Storage and ticket failures the pipeline recovers from.
    #[value(alias = "warning")]
    Warn,
    /// Rejected configuration and unwritable directory files.
    Error,
    #[value(alias = "quiet")]
    Off,
}

fn write_value_name<T: ValueEnum>(value: &T, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value.to_possible_value() {
        Some(name) => f.write_str(name.get_name()),
        None => Ok(()),
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value_name(self, f)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value_name(self, f)
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

/// Resolved logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// RUST_LOG directives, set only when they decide the filter.
    pub rust_log: Option<String>,
}

impl LogConfig {
    /// Resolve from the process environment and CLI flags.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::from_vars(|name| std::env::var(name).ok(), cli_level, cli_format)
    }

    /// Resolve from an arbitrary variable lookup and CLI flags.
    pub fn from_vars(
        var: impl Fn(&str) -> Option<String>,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        let mut config = LogConfig::default();

        if let Some(level) = cli_level {
            config.level = level;
        } else if let Some(val) = var("TQ_LOG") {
            if let Ok(level) = LogLevel::from_str(&val, true) {
                config.level = level;
            }
        } else if let Some(val) = var("RUST_LOG").filter(|v| !v.trim().is_empty()) {
            config.level = level_hint(&val);
            config.rust_log = Some(val);
        }

        config.format = cli_format
            .or_else(|| var("TQ_LOG_FORMAT").and_then(|v| LogFormat::from_str(&v, true).ok()))
            .unwrap_or_default();

        config
    }
}

/// Most verbose level word in a directive string like `tq_events=debug,warn`.
fn level_hint(directives: &str) -> LogLevel {
    [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ]
    .into_iter()
    .find(|level| directives.contains(&level.to_string()))
    .unwrap_or(LogLevel::Info)
}
