//! Recording in-memory storage backend for queue scenario tests.
//!
//! Every backend call is recorded when it starts. Calls can be held back
//! (`set_deferred(true)`) and released one at a time to observe the queue
//! while storage work is outstanding.

#![allow(dead_code)]
// Test support provides more helpers than any single test uses.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tq_common::{EventNaming, QueueConfig, TenantLimits, UserId};
use tq_events::EventQueue;
use tq_storage::{
    InlineQueue, KeyRequest, LocalStorage, OperationHandle, StorageBackend, StorageError,
    StorageHandlers, StorageResult, WriteMode, WriteRequest,
};

pub const USER: UserId = UserId(281_474_976_710_656);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Write { key: String, mode: WriteMode, bytes: usize },
    Read { key: String },
    Clear { key: String },
}

impl Call {
    pub fn key(&self) -> &str {
        match self {
            Call::Write { key, .. } | Call::Read { key } | Call::Clear { key } => key,
        }
    }
}

enum Pending {
    Write(WriteRequest, OperationHandle<u64>),
    Read(KeyRequest, OperationHandle<Vec<u8>>),
    Clear(KeyRequest, OperationHandle<()>),
}

#[derive(Default)]
pub struct MemoryBackend {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    calls: Mutex<Vec<Call>>,
    pending: Mutex<VecDeque<Pending>>,
    deferred: AtomicBool,
    fail_clears: AtomicBool,
    fail_appends: AtomicBool,
    fail_reads: Mutex<HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handlers(self: &Arc<Self>) -> StorageHandlers {
        let w = Arc::clone(self);
        let r = Arc::clone(self);
        let c = Arc::clone(self);
        StorageHandlers::new(
            Arc::new(move |req: WriteRequest, op: OperationHandle<u64>| {
                w.record(Call::Write {
                    key: req.key.clone(),
                    mode: req.mode,
                    bytes: req.data.len(),
                });
                w.dispatch(Pending::Write(req, op));
            }),
            Arc::new(move |req: KeyRequest, op: OperationHandle<Vec<u8>>| {
                r.record(Call::Read {
                    key: req.key.clone(),
                });
                r.dispatch(Pending::Read(req, op));
            }),
            Arc::new(move |req: KeyRequest, op: OperationHandle<()>| {
                c.record(Call::Clear {
                    key: req.key.clone(),
                });
                c.dispatch(Pending::Clear(req, op));
            }),
        )
    }

    /// Storage over this backend with inline execution contexts.
    pub fn storage(self: &Arc<Self>) -> Arc<LocalStorage> {
        LocalStorage::new(
            StorageBackend::Custom(self.handlers()),
            Arc::new(InlineQueue),
            Arc::new(InlineQueue),
        )
    }

    /// A queue for [`USER`] over this backend.
    pub fn queue(self: &Arc<Self>, limits: TenantLimits, config: QueueConfig) -> Arc<EventQueue> {
        EventQueue::new(USER, limits, EventNaming::default(), config, self.storage())
    }

    pub fn seed(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.blobs.lock().unwrap().insert(key.to_string(), data.into());
    }

    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Appends to event files (everything but the directory file).
    pub fn event_writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Write { mode: WriteMode::Append, .. }))
            .collect()
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::SeqCst);
    }

    pub fn set_fail_clears(&self, fail: bool) {
        self.fail_clears.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads_of(&self, key: &str) {
        self.fail_reads.lock().unwrap().insert(key.to_string());
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Complete the oldest held-back call. Returns false if none was held.
    pub fn release_one(&self) -> bool {
        let next = self.pending.lock().unwrap().pop_front();
        match next {
            Some(pending) => {
                self.complete(pending);
                true
            }
            None => false,
        }
    }

    /// Stop deferring and complete everything held back.
    pub fn release_all(&self) {
        self.set_deferred(false);
        while self.release_one() {}
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn dispatch(&self, pending: Pending) {
        if self.deferred.load(Ordering::SeqCst) {
            self.pending.lock().unwrap().push_back(pending);
        } else {
            self.complete(pending);
        }
    }

    fn complete(&self, pending: Pending) {
        match pending {
            Pending::Write(req, op) => {
                op.complete(self.apply_write(req));
            }
            Pending::Read(req, op) => {
                op.complete(self.apply_read(&req));
            }
            Pending::Clear(req, op) => {
                op.complete(self.apply_clear(&req));
            }
        }
    }

    fn apply_write(&self, req: WriteRequest) -> StorageResult<u64> {
        if req.mode == WriteMode::Append && self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::Failed(format!("append to {} failed", req.key)));
        }
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs.entry(req.key).or_default();
        if req.mode == WriteMode::Truncate {
            blob.clear();
        }
        blob.extend_from_slice(&req.data);
        Ok(blob.len() as u64)
    }

    fn apply_read(&self, req: &KeyRequest) -> StorageResult<Vec<u8>> {
        if self.fail_reads.lock().unwrap().contains(&req.key) {
            return Err(StorageError::Failed(format!("read of {} failed", req.key)));
        }
        Ok(self.blob(&req.key).unwrap_or_default())
    }

    fn apply_clear(&self, req: &KeyRequest) -> StorageResult<()> {
        if self.fail_clears.load(Ordering::SeqCst) {
            return Err(StorageError::Failed(format!("clear of {} failed", req.key)));
        }
        self.blobs.lock().unwrap().remove(&req.key);
        Ok(())
    }
}
