//! Command implementations behind the `tq` binary.
//!
//! Every command runs storage on inline execution contexts, so a queue
//! operation has fully reached disk by the time the call returns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tq_common::{Error, PipelineConfig, Result, UserId};
use tq_events::directory::directory_key;
use tq_events::{EventQueue, EventRecord, FileIndex, QueueMode, QueueStats};
use tq_storage::{
    default_storage_dir, FileStorage, InlineQueue, KeyRequest, LocalStorage, StorageBackend,
    StorageError,
};
use tracing::{debug, info};

/// One persisted events file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Output of `tq status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub user: UserId,
    pub directory: String,
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
}

/// Output of `tq record`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordReport {
    pub event: EventRecord,
    pub file: String,
    pub stats: QueueStats,
}

/// A user's pipeline rooted at a data directory.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    data_dir: PathBuf,
    user: UserId,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, data_dir: impl Into<PathBuf>, user: UserId) -> Self {
        Self {
            config,
            data_dir: data_dir.into(),
            user,
        }
    }

    /// Load the config file (or defaults) and resolve the data directory.
    pub fn open(config_path: Option<&Path>, data_dir: Option<PathBuf>, user: UserId) -> Result<Self> {
        let config = match config_path {
            Some(path) => {
                debug!(path = %path.display(), "loading pipeline config");
                PipelineConfig::load(path)?
            }
            None => PipelineConfig::default(),
        };
        let data_dir = data_dir.unwrap_or_else(default_storage_dir);
        Ok(Self::new(config, data_dir, user))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// Read the directory file without touching any events file.
    pub fn status(&self) -> Result<StatusReport> {
        let directory = directory_key(&self.config.naming.file_prefix, self.user);
        let files = FileStorage::new(&self.data_dir);
        let bytes = files
            .read(&KeyRequest {
                user: self.user,
                key: directory.clone(),
            })
            .map_err(|e| storage_error("read", &directory, e))?;
        let index = FileIndex::parse(&bytes)?;

        Ok(StatusReport {
            user: self.user,
            files: index
                .iter()
                .map(|(name, size)| FileEntry {
                    name: name.to_string(),
                    size,
                })
                .collect(),
            total_bytes: index.total_size(),
            directory,
        })
    }

    /// Validate one event and persist it through an offline queue.
    pub fn record(&self, name: &str, dimensions: &str, measurements: &str) -> Result<RecordReport> {
        let event =
            EventRecord::from_json_text(self.user, name, dimensions, measurements, Utc::now())?;
        let line_bytes = event.serialize().len() as u64 + 1;
        let limit = self.config.tenant.max_event_size_bytes;
        if line_bytes > limit {
            return Err(Error::InvalidEvent(format!(
                "event is {line_bytes} bytes, limit is {limit}"
            )));
        }

        let queue = self.queue();
        queue.set_mode(QueueMode::Offline);
        queue.initialize();
        let before = queue.files();
        queue.add_event(event.clone());
        let after = queue.files();

        let file = after
            .newest()
            .filter(|(name, size)| before.get(name) != Some(*size))
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| Error::Storage {
                op: "write".to_string(),
                key: directory_key(&self.config.naming.file_prefix, self.user),
                reason: "event did not reach an events file".to_string(),
            })?;

        info!(user = %self.user, file = %file, name = event.name(), "recorded event");
        Ok(RecordReport {
            event,
            file,
            stats: queue.stats(),
        })
    }

    /// Read every persisted event back, clearing the files it came from.
    pub fn drain(&self) -> Result<Vec<EventRecord>> {
        let queue = self.queue();
        queue.initialize();

        let mut events = Vec::new();
        while let Some(payload) = queue.get_next_payload(1) {
            events.extend(payload.events().cloned());
        }
        info!(
            user = %self.user,
            events = events.len(),
            files_left = queue.stats().files,
            "drained persisted events"
        );
        Ok(events)
    }

    fn queue(&self) -> Arc<EventQueue> {
        let storage = LocalStorage::new(
            StorageBackend::Default {
                root: self.data_dir.clone(),
            },
            Arc::new(InlineQueue),
            Arc::new(InlineQueue),
        );
        EventQueue::new(
            self.user,
            self.config.tenant,
            self.config.naming.clone(),
            self.config.queue,
            storage,
        )
    }
}

fn storage_error(op: &str, key: &str, err: StorageError) -> Error {
    Error::Storage {
        op: op.to_string(),
        key: key.to_string(),
        reason: err.to_string(),
    }
}
