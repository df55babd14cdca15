//! Rendering of command results for stdout.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tq_common::{Error, PipelineConfig, Result};
use tq_events::EventRecord;

use crate::commands::{RecordReport, StatusReport};
use crate::exit_codes::ExitCode;

/// Supported output formats for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Structured JSON (JSON lines for event streams)
    #[default]
    Json,
    /// Human-readable text
    Human,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Human => write!(f, "human"),
        }
    }
}

pub fn render_status(report: &StatusReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Human => {
            let mut out = format!(
                "user {}: {} file(s), {} bytes ({})\n",
                report.user,
                report.files.len(),
                report.total_bytes,
                report.directory
            );
            for file in &report.files {
                out.push_str(&format!("  {}  {} bytes\n", file.name, file.size));
            }
            Ok(out)
        }
    }
}

pub fn render_record(report: &RecordReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Human => Ok(format!(
            "recorded {} in {} ({} file(s), {} bytes on disk)\n",
            report.event.name(),
            report.file,
            report.stats.files,
            report.stats.total_files_size
        )),
    }
}

/// One line per event.
pub fn render_events(events: &[EventRecord], format: OutputFormat) -> Result<String> {
    let mut out = String::new();
    for event in events {
        match format {
            OutputFormat::Json => out.push_str(&serde_json::to_string(event)?),
            OutputFormat::Human => out.push_str(&format!(
                "{}  {}  {}  {}",
                event.timestamp().to_rfc3339(),
                event.name(),
                event.dimensions(),
                event.measurements()
            )),
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn render_config(config: &PipelineConfig, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(config)?),
        OutputFormat::Human => toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("cannot render config: {e}"))),
    }
}

/// Error report for stderr.
pub fn render_error(err: &Error, exit_code: ExitCode, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            let response = serde_json::json!({
                "status": "error",
                "exit_code": exit_code.code_name(),
                "error": {
                    "code": err.code(),
                    "category": err.category(),
                    "message": err.to_string(),
                    "remediation": err.remediation(),
                }
            });
            serde_json::to_string_pretty(&response).unwrap_or_else(|_| err.to_string())
        }
        OutputFormat::Human => format!("error: {}\nhint: {}", err, err.remediation()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::FileEntry;
    use serde_json::{json, Value};
    use tq_common::UserId;

    fn status() -> StatusReport {
        StatusReport {
            user: UserId(9),
            directory: "evq_9.dir".to_string(),
            files: vec![FileEntry {
                name: "evq_0000000000000001.json".to_string(),
                size: 120,
            }],
            total_bytes: 120,
        }
    }

    #[test]
    fn test_status_json_shape() {
        let text = render_status(&status(), OutputFormat::Json).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["user"], 9);
        assert_eq!(value["total_bytes"], 120);
        assert_eq!(value["files"][0]["size"], 120);
    }

    #[test]
    fn test_status_human_lists_files() {
        let text = render_status(&status(), OutputFormat::Human).unwrap();
        assert!(text.starts_with("user 9: 1 file(s), 120 bytes"));
        assert!(text.contains("evq_0000000000000001.json"));
    }

    #[test]
    fn test_events_render_one_line_each() {
        let events = vec![
            EventRecord::now(UserId(9), "A", json!({"x": 1}), Value::Null).unwrap(),
            EventRecord::now(UserId(9), "B", Value::Null, json!({"y": 2.5})).unwrap(),
        ];
        let text = render_events(&events, OutputFormat::Json).unwrap();
        let parsed: Vec<EventRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed, events);

        let human = render_events(&events, OutputFormat::Human).unwrap();
        assert_eq!(human.lines().count(), 2);
    }

    #[test]
    fn test_config_human_is_toml() {
        let config = PipelineConfig::default();
        let text = render_config(&config, OutputFormat::Human).unwrap();
        assert_eq!(PipelineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_error_json_carries_code_and_hint() {
        let err = Error::InvalidEvent("bad name".to_string());
        let text = render_error(&err, ExitCode::ArgsError, OutputFormat::Json);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["exit_code"], "ERR_ARGS");
        assert_eq!(value["error"]["code"], 40);
        assert_eq!(value["error"]["category"], "payload");
    }
}
