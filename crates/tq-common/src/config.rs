//! Configuration for the telemetry pipeline.
//!
//! All sections default to the values the pipeline ships with, so an empty
//! (or absent) config file is valid. Values are validated before anything is
//! constructed; a rejected value never mutates existing state.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

/// Smallest accepted size for a single persisted events file.
pub const MIN_FILE_SIZE_BYTES: u64 = 1024;

/// Default size of a single persisted events file (128 kB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 128_000;

/// Default storage allotment: room for 150 full files (~20 MB).
pub const DEFAULT_STORAGE_ALLOTMENT: u64 = DEFAULT_MAX_FILE_SIZE * 150;

/// Disk limits for persisted, unsent events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum bytes written to one events file before a new file is started.
    pub max_file_size: u64,
    /// Maximum total bytes of persisted events before the oldest file is evicted.
    pub storage_allotment: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            storage_allotment: DEFAULT_STORAGE_ALLOTMENT,
        }
    }
}

impl QueueConfig {
    /// Set the max file size. Rejects anything below 1 kB.
    pub fn set_max_file_size(&mut self, bytes: u64) -> Result<()> {
        if bytes < MIN_FILE_SIZE_BYTES {
            error!(requested = bytes, "max file size must be at least 1kb");
            return Err(Error::InvalidMaxFileSize {
                requested: bytes,
                minimum: MIN_FILE_SIZE_BYTES,
            });
        }
        self.max_file_size = bytes;
        Ok(())
    }

    /// Set the storage allotment. Rejects anything below the max file size.
    pub fn set_storage_allotment(&mut self, bytes: u64) -> Result<()> {
        if bytes < self.max_file_size {
            error!(
                requested = bytes,
                max_file_size = self.max_file_size,
                "storage allotment must be greater than the maximum file size"
            );
            return Err(Error::InvalidStorageAllotment {
                requested: bytes,
                max_file_size: self.max_file_size,
            });
        }
        self.storage_allotment = bytes;
        Ok(())
    }

    /// Validate both values together.
    pub fn validate(&self) -> Result<()> {
        let mut candidate = QueueConfig {
            max_file_size: MIN_FILE_SIZE_BYTES,
            storage_allotment: u64::MAX,
        };
        candidate.set_max_file_size(self.max_file_size)?;
        candidate.set_storage_allotment(self.storage_allotment)
    }
}

/// Payload caps supplied by the collector tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantLimits {
    /// Maximum number of events batched into one upload payload.
    pub max_events_per_payload: usize,
    /// Maximum serialized size of one event, used to size flush buffers.
    pub max_event_size_bytes: u64,
}

impl Default for TenantLimits {
    fn default() -> Self {
        TenantLimits {
            max_events_per_payload: 500,
            max_event_size_bytes: 64 * 1024,
        }
    }
}

impl TenantLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_events_per_payload == 0 {
            return Err(Error::InvalidTenantLimits(
                "max_events_per_payload must be at least 1".to_string(),
            ));
        }
        if self.max_event_size_bytes == 0 {
            return Err(Error::InvalidTenantLimits(
                "max_event_size_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduler-facing upload settings. Consumed by the upload scheduler, not
/// by the queue itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Base delay between upload ticks.
    pub min_upload_interval_ms: u64,
    /// After this long without an attempt, upload even a single event.
    pub max_upload_interval_ms: u64,
    /// Events required before a payload is uploaded early.
    pub payload_min_event_count: usize,
    /// Cap on the exponential backoff multiplier.
    pub max_backoff_multiplier: u64,
    /// Timeout handed to the transport for one upload request.
    pub upload_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            min_upload_interval_ms: 3_000,
            max_upload_interval_ms: 60_000,
            payload_min_event_count: 10,
            max_backoff_multiplier: 600,
            upload_timeout_secs: 10,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_upload_interval_ms == 0 {
            return Err(Error::Config(
                "upload.min_upload_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.max_upload_interval_ms < self.min_upload_interval_ms {
            return Err(Error::Config(format!(
                "upload.max_upload_interval_ms ({}) must be >= min_upload_interval_ms ({})",
                self.max_upload_interval_ms, self.min_upload_interval_ms
            )));
        }
        if self.max_backoff_multiplier == 0 {
            return Err(Error::Config(
                "upload.max_backoff_multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Naming of events and the instrumentation key rendered into uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventNaming {
    /// Prefix of every full event name (`prefix + title_id + "." + name`).
    pub name_prefix: String,
    /// Title the events belong to.
    pub title_id: u32,
    /// Prefix of the instrumentation key (`ikey_prefix + title_id`).
    pub ikey_prefix: String,
    /// Prefix of every blob key written by the queue.
    pub file_prefix: String,
}

impl Default for EventNaming {
    fn default() -> Self {
        EventNaming {
            name_prefix: "Microsoft.XboxLive.T".to_string(),
            title_id: 0,
            ikey_prefix: "P-XBL-T".to_string(),
            file_prefix: "evq_".to_string(),
        }
    }
}

impl EventNaming {
    /// Full event name for a short name.
    pub fn full_name(&self, name: &str) -> String {
        format!("{}{}.{}", self.name_prefix, self.title_id, name)
    }

    /// Instrumentation key for this title.
    pub fn ikey(&self) -> String {
        format!("{}{}", self.ikey_prefix, self.title_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_prefix.contains(['/', '\\', '\t', '\n']) {
            return Err(Error::Config(format!(
                "naming.file_prefix contains a path or record separator: {:?}",
                self.file_prefix
            )));
        }
        Ok(())
    }
}

/// The complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub tenant: TenantLimits,
    pub upload: UploadConfig,
    pub naming: EventNaming,
}

impl PipelineConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.tenant.validate()?;
        self.upload.validate()?;
        self.naming.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_file_size, 128_000);
        assert_eq!(config.storage_allotment, 128_000 * 150);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_file_size_rejects_small_values() {
        let mut config = QueueConfig::default();
        let err = config.set_max_file_size(1023).unwrap_err();
        assert!(matches!(err, Error::InvalidMaxFileSize { requested: 1023, .. }));
        // Rejected value must not be applied.
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert!(config.set_max_file_size(1024).is_ok());
        assert_eq!(config.max_file_size, 1024);
    }

    #[test]
    fn test_storage_allotment_must_cover_file_size() {
        let mut config = QueueConfig::default();
        config.set_max_file_size(4096).unwrap();
        assert!(config.set_storage_allotment(4095).is_err());
        assert_eq!(config.storage_allotment, DEFAULT_STORAGE_ALLOTMENT);
        assert!(config.set_storage_allotment(4096).is_ok());
    }

    #[test]
    fn test_queue_validate_rejects_inverted_limits() {
        let config = QueueConfig {
            max_file_size: 2048,
            storage_allotment: 1024,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tenant_limits_validation() {
        assert!(TenantLimits::default().validate().is_ok());
        let limits = TenantLimits {
            max_events_per_payload: 0,
            ..Default::default()
        };
        assert_eq!(limits.validate().unwrap_err().code(), 13);
    }

    #[test]
    fn test_naming_helpers() {
        let naming = EventNaming {
            title_id: 1234,
            ..Default::default()
        };
        assert_eq!(naming.full_name("PuzzleSolved"), "Microsoft.XboxLive.T1234.PuzzleSolved");
        assert_eq!(naming.ikey(), "P-XBL-T1234");
    }

    #[test]
    fn test_pipeline_config_from_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [queue]
            max_file_size = 2048

            [naming]
            title_id = 77
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_file_size, 2048);
        assert_eq!(config.queue.storage_allotment, DEFAULT_STORAGE_ALLOTMENT);
        assert_eq!(config.naming.title_id, 77);
        assert_eq!(config.upload, UploadConfig::default());
    }

    #[test]
    fn test_pipeline_config_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nmax_file_size = 10").unwrap();
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidMaxFileSize { .. }));
    }

    #[test]
    fn test_pipeline_config_rejects_malformed_toml() {
        let err = PipelineConfig::from_toml_str("[queue\nmax_file_size = ").unwrap_err();
        assert_eq!(err.code(), 62);
    }
}
