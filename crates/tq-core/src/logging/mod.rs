//! Structured logging for the tq binary.
//!
//! Provides dual-mode logging:
//! - Human-readable console output for interactive use
//! - Machine-parseable JSONL for scripted use
//!
//! stdout is reserved for command payloads; all log output goes to stderr.

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose events the default filter lets through.
const LOG_TARGETS: [&str; 4] = ["tq", "tq_core", "tq_events", "tq_storage"];

/// `EnvFilter` directives enabling every tq crate at `level`.
pub fn filter_directives(level: LogLevel) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// The `EnvFilter` directives for `config`.
///
/// RUST_LOG directives are used as given when they decide the level and
/// parse; otherwise every tq crate is enabled at the resolved level.
pub fn filter_spec(config: &LogConfig) -> String {
    match &config.rust_log {
        Some(directives) if EnvFilter::try_new(directives).is_ok() => directives.clone(),
        _ => filter_directives(config.level),
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::new(filter_spec(config));

    match config.format {
        LogFormat::Human => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal());
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
        LogFormat::Jsonl => {
            let json_layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_cover_every_crate() {
        let directives = filter_directives(LogLevel::Debug);
        assert_eq!(
            directives,
            "tq=debug,tq_core=debug,tq_events=debug,tq_storage=debug"
        );
    }

    #[test]
    fn test_filter_directives_parse() {
        for level in [LogLevel::Trace, LogLevel::Warn, LogLevel::Off] {
            assert!(EnvFilter::try_new(filter_directives(level)).is_ok());
        }
    }

    #[test]
    fn test_explicit_level_ignores_rust_log() {
        let config = LogConfig::from_vars(
            |name| (name == "RUST_LOG").then(|| "tq_storage=trace".to_string()),
            Some(LogLevel::Warn),
            None,
        );
        assert_eq!(
            filter_spec(&config),
            "tq=warn,tq_core=warn,tq_events=warn,tq_storage=warn"
        );
    }

    #[test]
    fn test_rust_log_directives_used_when_in_charge() {
        let config = LogConfig::from_vars(
            |name| (name == "RUST_LOG").then(|| "tq_storage=trace".to_string()),
            None,
            None,
        );
        assert_eq!(filter_spec(&config), "tq_storage=trace");
    }

    #[test]
    fn test_unparseable_rust_log_falls_back_to_level() {
        let config = LogConfig {
            rust_log: Some("tq_storage=loud".to_string()),
            ..LogConfig::default()
        };
        assert_eq!(filter_spec(&config), filter_directives(LogLevel::Info));
    }
}
