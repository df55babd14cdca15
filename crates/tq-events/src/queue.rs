//! Persistent, per-user event queue.
//!
//! Events are buffered in memory as a FIFO of [`UploadPayload`]s and pulled
//! by an upload scheduler. In offline mode every add is flushed to durable
//! storage; switching back to normal mode reads persisted files back into
//! memory. A write-through [`FileIndex`] tracks every persisted file and
//! keeps total disk use within the storage allotment by evicting the oldest
//! file.
//!
//! Locking: all bookkeeping happens under one mutex, which is never held
//! while storage is called. Each operation plans its storage commands under
//! the lock and issues them after releasing it, in order. Storage
//! continuations re-acquire the lock.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tq_common::{EventNaming, QueueConfig, Result, TenantLimits, UserId};
use tq_storage::{LocalStorage, StorageResult, WriteMode};
use tracing::{debug, error, info, warn};

use crate::directory::{directory_key, FileIndex};
use crate::event::EventRecord;
use crate::payload::UploadPayload;

/// Whether events stay in memory or go straight to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QueueMode {
    /// Events wait in memory for the upload scheduler.
    Normal = 0,
    /// Uploads are failing; every add is flushed to storage.
    Offline = 1,
}

impl QueueMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => QueueMode::Offline,
            _ => QueueMode::Normal,
        }
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Normal => write!(f, "normal"),
            QueueMode::Offline => write!(f, "offline"),
        }
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub mode: QueueMode,
    pub payloads: usize,
    pub buffered_events: usize,
    pub files: usize,
    pub total_files_size: u64,
    pub flush_in_progress: bool,
    pub has_failed_payload: bool,
}

/// Storage work decided under the lock, issued after it is released.
#[derive(Debug)]
enum StorageCommand {
    AppendEvents { key: String, data: Vec<u8>, events: usize },
    WriteDirectory(Vec<u8>),
    Evict { key: String, size: u64 },
    ReadFile { key: String },
    ClearRecovered { key: String },
}

struct QueueState {
    payloads: VecDeque<UploadPayload>,
    failed: Option<UploadPayload>,
    index: FileIndex,
    flush_in_progress: bool,
    /// Files whose read-back is in flight.
    recovering: HashSet<String>,
    config: QueueConfig,
}

/// The persistent event queue for one user.
pub struct EventQueue {
    user: UserId,
    limits: TenantLimits,
    naming: EventNaming,
    directory_key: String,
    storage: Arc<LocalStorage>,
    mode: AtomicU8,
    state: Mutex<QueueState>,
}

impl EventQueue {
    pub fn new(
        user: UserId,
        limits: TenantLimits,
        naming: EventNaming,
        config: QueueConfig,
        storage: Arc<LocalStorage>,
    ) -> Arc<Self> {
        let directory_key = directory_key(&naming.file_prefix, user);
        Arc::new(Self {
            user,
            limits,
            naming,
            directory_key,
            storage,
            mode: AtomicU8::new(QueueMode::Normal as u8),
            state: Mutex::new(QueueState {
                payloads: VecDeque::new(),
                failed: None,
                index: FileIndex::new(),
                flush_in_progress: false,
                recovering: HashSet::new(),
                config,
            }),
        })
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn naming(&self) -> &EventNaming {
        &self.naming
    }

    pub fn directory_key(&self) -> &str {
        &self.directory_key
    }

    pub fn mode(&self) -> QueueMode {
        QueueMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Load the directory file, then read every listed file back.
    pub fn initialize(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.storage
            .read_async(self.user, self.directory_key.clone(), move |result| {
                if let Some(queue) = weak.upgrade() {
                    queue.on_directory_read(result);
                }
            });
    }

    pub fn add_event(self: &Arc<Self>, event: EventRecord) {
        self.add_events(vec![event]);
    }

    /// Append events in order. In offline mode they are flushed at once.
    pub fn add_events(self: &Arc<Self>, events: Vec<EventRecord>) {
        let commands = {
            let mut state = self.lock_state();
            self.push_events(&mut state, events);
            if self.mode() == QueueMode::Offline {
                self.plan_flush(&mut state).into_iter().collect()
            } else {
                Vec::new()
            }
        };
        self.execute(commands);
    }

    /// Next payload to upload: a requeued failure first, else the oldest
    /// payload if it holds at least `minimum_event_count` events.
    pub fn get_next_payload(&self, minimum_event_count: usize) -> Option<UploadPayload> {
        let mut state = self.lock_state();
        if let Some(failed) = state.failed.take() {
            return Some(failed);
        }
        let ready = state
            .payloads
            .front()
            .is_some_and(|p| !p.is_empty() && p.event_count() >= minimum_event_count);
        if ready {
            state.payloads.pop_front()
        } else {
            None
        }
    }

    /// Hold a payload whose upload failed; it is handed out before anything else.
    pub fn requeue_failed_payload(&self, payload: UploadPayload) {
        let mut state = self.lock_state();
        if let Some(previous) = state.failed.replace(payload) {
            warn!(
                user = %self.user,
                events = previous.event_count(),
                "failed payload slot already occupied; moving previous payload to the queue front"
            );
            state.payloads.push_front(previous);
        }
    }

    /// Switch modes. Offline flushes buffered events; normal reads persisted
    /// events back.
    pub fn set_mode(self: &Arc<Self>, mode: QueueMode) {
        let commands = {
            let mut state = self.lock_state();
            if self.mode() == mode {
                return;
            }
            self.mode.store(mode as u8, Ordering::Release);
            info!(user = %self.user, mode = %mode, "event queue mode changed");
            match mode {
                QueueMode::Offline => self.plan_flush(&mut state).into_iter().collect(),
                QueueMode::Normal => self.plan_populate(&mut state),
            }
        };
        self.execute(commands);
    }

    /// Write buffered events to storage. No-op while a flush is outstanding.
    pub fn flush(self: &Arc<Self>) {
        let command = {
            let mut state = self.lock_state();
            self.plan_flush(&mut state)
        };
        self.execute(command.into_iter().collect());
    }

    /// Read every indexed file back into memory (normal mode only).
    pub fn populate(self: &Arc<Self>) {
        let commands = {
            let mut state = self.lock_state();
            self.plan_populate(&mut state)
        };
        self.execute(commands);
    }

    /// Shutdown hook: return the failed payload to the queue and flush.
    pub fn cleanup(self: &Arc<Self>) {
        let command = {
            let mut state = self.lock_state();
            if let Some(failed) = state.failed.take() {
                state.payloads.push_back(failed);
            }
            self.plan_flush(&mut state)
        };
        self.execute(command.into_iter().collect());
    }

    pub fn set_max_file_size(&self, bytes: u64) -> Result<()> {
        self.lock_state().config.set_max_file_size(bytes)
    }

    pub fn set_storage_allotment(&self, bytes: u64) -> Result<()> {
        self.lock_state().config.set_storage_allotment(bytes)
    }

    pub fn config(&self) -> QueueConfig {
        self.lock_state().config
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            mode: self.mode(),
            payloads: state.payloads.len(),
            buffered_events: state.payloads.iter().map(UploadPayload::event_count).sum(),
            files: state.index.len(),
            total_files_size: state.index.total_size(),
            flush_in_progress: state.flush_in_progress,
            has_failed_payload: state.failed.is_some(),
        }
    }

    /// Snapshot of the file index.
    pub fn files(&self) -> FileIndex {
        self.lock_state().index.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_events(&self, state: &mut QueueState, events: Vec<EventRecord>) {
        for event in events {
            let event = match state.payloads.back_mut() {
                Some(payload) => match payload.add_event(event) {
                    Ok(()) => continue,
                    Err(full) => full.into_event(),
                },
                None => event,
            };
            let mut payload = UploadPayload::new(self.user, &self.limits);
            if payload.add_event(event).is_err() {
                // Only possible with a zero capacity, which validation rejects.
                warn!(user = %self.user, "dropping event: payload capacity is zero");
                continue;
            }
            state.payloads.push_back(payload);
        }
    }

    /// Put the events of an unwritten flush back at the front of the queue,
    /// ahead of anything added since. Returns how many were restored.
    fn restore_front(&self, state: &mut QueueState, data: &[u8]) -> usize {
        let events: Vec<EventRecord> = data
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| EventRecord::deserialize(line).ok())
            .collect();
        let restored = events.len();
        let mut payloads = Vec::new();
        for event in events {
            let needs_new = payloads.last().map_or(true, UploadPayload::is_full);
            if needs_new {
                payloads.push(UploadPayload::new(self.user, &self.limits));
            }
            if let Some(payload) = payloads.last_mut() {
                if payload.add_event(event).is_err() {
                    warn!(user = %self.user, "dropping event: payload capacity is zero");
                }
            }
        }
        for payload in payloads.into_iter().rev() {
            state.payloads.push_front(payload);
        }
        restored
    }

    fn plan_flush(&self, state: &mut QueueState) -> Option<StorageCommand> {
        if state.flush_in_progress {
            debug!(user = %self.user, "flush already in progress");
            return None;
        }
        if state.payloads.iter().all(UploadPayload::is_empty) {
            return None;
        }

        let max_file_size = state.config.max_file_size;
        let reuse = state
            .index
            .newest()
            .filter(|(name, size)| *size < max_file_size && !state.recovering.contains(*name))
            .map(|(name, size)| (name.to_string(), size));
        let used = reuse.as_ref().map_or(0, |(_, size)| *size);
        let target = usize::try_from(max_file_size - used).unwrap_or(usize::MAX);

        // Grows with the events actually extracted; the file budget may be huge.
        let mut data = Vec::new();
        let mut earliest = Utc::now();
        let mut events = 0usize;
        while let Some(payload) = state.payloads.front_mut() {
            let before = payload.event_count();
            let remaining = payload.extract_events_and_serialize(&mut data, target, &mut earliest);
            events += before - remaining;
            if remaining > 0 {
                // Buffer is full; the partial payload stays at the front.
                break;
            }
            state.payloads.pop_front();
        }
        if data.is_empty() {
            return None;
        }

        let key = match reuse {
            Some((name, _)) => name,
            None => state
                .index
                .next_file_name(&self.naming.file_prefix, earliest),
        };
        state.flush_in_progress = true;
        debug!(user = %self.user, file = %key, events, bytes = data.len(), "flushing events");
        Some(StorageCommand::AppendEvents { key, data, events })
    }

    fn plan_populate(&self, state: &mut QueueState) -> Vec<StorageCommand> {
        let mut commands = Vec::new();
        for (name, _) in state.index.iter() {
            if state.recovering.contains(name) {
                continue;
            }
            commands.push(StorageCommand::ReadFile {
                key: name.to_string(),
            });
        }
        for command in &commands {
            if let StorageCommand::ReadFile { key } = command {
                state.recovering.insert(key.clone());
            }
        }
        if !commands.is_empty() {
            debug!(user = %self.user, files = commands.len(), "recovering persisted events");
        }
        commands
    }

    /// Evict oldest files until the allotment holds, then persist the index.
    fn plan_eviction(&self, state: &mut QueueState) -> Vec<StorageCommand> {
        let mut commands = Vec::new();
        while state.index.total_size() > state.config.storage_allotment {
            let Some((key, size)) = state.index.pop_oldest() else {
                break;
            };
            info!(
                user = %self.user,
                file = %key,
                size,
                allotment = state.config.storage_allotment,
                "storage allotment exceeded, evicting oldest file; its events are lost"
            );
            commands.push(StorageCommand::Evict { key, size });
        }
        commands
    }

    fn execute(self: &Arc<Self>, commands: Vec<StorageCommand>) {
        for command in commands {
            match command {
                StorageCommand::AppendEvents { key, data, events } => {
                    let queue = Arc::clone(self);
                    let written = key.clone();
                    let retained = data.clone();
                    self.storage
                        .write_async(self.user, WriteMode::Append, key, data, move |result| {
                            queue.on_events_written(written, events, retained, result);
                        });
                }
                StorageCommand::WriteDirectory(data) => {
                    let user = self.user;
                    self.storage.write_async(
                        user,
                        WriteMode::Truncate,
                        self.directory_key.clone(),
                        data,
                        move |result| {
                            if let Err(err) = result {
                                error!(
                                    user = %user,
                                    error = %err,
                                    "failed to write events directory file; offline event data may be lost"
                                );
                            }
                        },
                    );
                }
                StorageCommand::Evict { key, size } => {
                    let weak = Arc::downgrade(self);
                    let evicted = key.clone();
                    self.storage.clear_async(self.user, key, move |result| {
                        if let Some(queue) = weak.upgrade() {
                            queue.on_evicted(evicted, size, result);
                        }
                    });
                }
                StorageCommand::ReadFile { key } => {
                    let weak = Arc::downgrade(self);
                    let read = key.clone();
                    self.storage.read_async(self.user, key, move |result| {
                        on_file_read(&weak, read, result);
                    });
                }
                StorageCommand::ClearRecovered { key } => {
                    let user = self.user;
                    let cleared = key.clone();
                    self.storage.clear_async(user, key, move |result| {
                        if let Err(err) = result {
                            warn!(
                                user = %user,
                                file = %cleared,
                                error = %err,
                                "failed to clear recovered events file"
                            );
                        }
                    });
                }
            }
        }
    }

    fn on_directory_read(self: &Arc<Self>, result: StorageResult<Vec<u8>>) {
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    user = %self.user,
                    file = %self.directory_key,
                    error = %err,
                    "failed to read events directory file"
                );
                return;
            }
        };
        let commands = {
            let mut state = self.lock_state();
            state.index.merge_missing(FileIndex::rebuild(&bytes));
            info!(
                user = %self.user,
                files = state.index.len(),
                bytes = state.index.total_size(),
                "loaded events directory"
            );
            if self.mode() == QueueMode::Normal {
                self.plan_populate(&mut state)
            } else {
                Vec::new()
            }
        };
        self.execute(commands);
    }

    fn on_recovered(self: &Arc<Self>, key: String, bytes: Vec<u8>) {
        let mut events = Vec::new();
        for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            match EventRecord::deserialize(line) {
                Ok(event) => events.push(event),
                Err(err) => debug!(file = %key, error = %err, "skipping unreadable event line"),
            }
        }

        let commands = {
            let mut state = self.lock_state();
            state.recovering.remove(&key);
            if self.mode() != QueueMode::Normal {
                debug!(user = %self.user, file = %key, "queue went offline during recovery; file kept");
                return;
            }
            let count = events.len();
            self.push_events(&mut state, events);
            let mut commands = Vec::new();
            if state.index.remove(&key).is_some() {
                commands.push(StorageCommand::WriteDirectory(state.index.persist()));
            }
            commands.push(StorageCommand::ClearRecovered { key: key.clone() });
            info!(user = %self.user, file = %key, events = count, "recovered persisted events");
            commands
        };
        self.execute(commands);
    }

    fn on_events_written(
        self: &Arc<Self>,
        key: String,
        events: usize,
        data: Vec<u8>,
        result: StorageResult<u64>,
    ) {
        let commands = {
            let mut state = self.lock_state();
            state.flush_in_progress = false;
            match result {
                Ok(size) => {
                    state.index.insert(key.clone(), size);
                    debug!(user = %self.user, file = %key, size, events, "events flushed");
                    let mut commands = self.plan_eviction(&mut state);
                    commands.push(StorageCommand::WriteDirectory(state.index.persist()));
                    commands.extend(self.plan_flush(&mut state));
                    commands
                }
                Err(err) => {
                    // Retried by the next add, flush or cleanup.
                    let restored = self.restore_front(&mut state, &data);
                    warn!(
                        user = %self.user,
                        file = %key,
                        events,
                        restored,
                        error = %err,
                        "failed to write events file; events returned to the queue"
                    );
                    Vec::new()
                }
            }
        };
        self.execute(commands);
    }

    fn on_evicted(self: &Arc<Self>, key: String, size: u64, result: StorageResult<()>) {
        let Err(err) = result else {
            debug!(user = %self.user, file = %key, size, "evicted events file");
            return;
        };
        warn!(
            user = %self.user,
            file = %key,
            error = %err,
            "failed to clear evicted events file; will retry on next flush"
        );
        let commands = {
            let mut state = self.lock_state();
            if state.index.contains(&key) {
                return;
            }
            state.index.insert(key, size);
            vec![StorageCommand::WriteDirectory(state.index.persist())]
        };
        self.execute(commands);
    }
}

fn on_file_read(weak: &Weak<EventQueue>, key: String, result: StorageResult<Vec<u8>>) {
    let Some(queue) = weak.upgrade() else {
        return;
    };
    match result {
        Ok(bytes) => queue.on_recovered(key, bytes),
        Err(err) => {
            warn!(
                user = %queue.user,
                file = %key,
                error = %err,
                "failed to read events file; will retry on next populate"
            );
            queue.lock_state().recovering.remove(&key);
        }
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("user", &self.user)
            .field("stats", &self.stats())
            .finish()
    }
}
