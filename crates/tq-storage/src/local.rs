//! Per-user durable blob storage with pluggable backends.
//!
//! [`LocalStorage`] serializes every read, write and clear through one FIFO
//! operation queue. Only one operation is in flight at a time: the next one
//! begins after the previous continuation has fully run, so concurrent
//! callers can never race on the same backing store, whatever the backend.
//!
//! Backends are a set of three handlers ([`StorageHandlers`]) chosen at
//! construction. [`FileStorage`] provides the default set over plain files.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tq_common::{Error, UserId};

use crate::operation::{
    lock, ClientOperation, Operation, OperationHandle, StorageError, StorageResult, TaskQueue,
};

/// How a write treats existing data under the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Add to the end of existing data.
    Append,
    /// Replace existing data.
    Truncate,
}

/// A write handed to a backend. Completes with the new total size of the blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub user: UserId,
    pub mode: WriteMode,
    pub key: String,
    pub data: Vec<u8>,
}

/// A read or clear handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub user: UserId,
    pub key: String,
}

pub type WriteHandler = Arc<dyn Fn(WriteRequest, OperationHandle<u64>) + Send + Sync>;
/// Must complete with empty data, not an error, when the key is absent.
pub type ReadHandler = Arc<dyn Fn(KeyRequest, OperationHandle<Vec<u8>>) + Send + Sync>;
pub type ClearHandler = Arc<dyn Fn(KeyRequest, OperationHandle<()>) + Send + Sync>;

/// The three backend handlers, always configured together.
#[derive(Clone)]
pub struct StorageHandlers {
    write: WriteHandler,
    read: ReadHandler,
    clear: ClearHandler,
}

impl StorageHandlers {
    pub fn new(write: WriteHandler, read: ReadHandler, clear: ClearHandler) -> Self {
        Self { write, read, clear }
    }

    /// Build from optionally-supplied handlers.
    ///
    /// All three absent means "use the default backend" (`Ok(None)`); a
    /// partial set is rejected.
    pub fn from_parts(
        write: Option<WriteHandler>,
        read: Option<ReadHandler>,
        clear: Option<ClearHandler>,
    ) -> tq_common::Result<Option<Self>> {
        match (write, read, clear) {
            (Some(write), Some(read), Some(clear)) => Ok(Some(Self::new(write, read, clear))),
            (None, None, None) => Ok(None),
            (write, read, clear) => Err(Error::Config(format!(
                "storage handlers must be set together (write: {}, read: {}, clear: {})",
                write.is_some(),
                read.is_some(),
                clear.is_some()
            ))),
        }
    }
}

impl fmt::Debug for StorageHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageHandlers { .. }")
    }
}

/// Backend selection for [`LocalStorage`].
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// Plain files under `root/<user>/<key>`.
    Default { root: PathBuf },
    /// Caller-supplied handlers.
    Custom(StorageHandlers),
}

impl StorageBackend {
    fn into_handlers(self) -> StorageHandlers {
        match self {
            StorageBackend::Default { root } => Arc::new(FileStorage::new(root)).handlers(),
            StorageBackend::Custom(handlers) => handlers,
        }
    }
}

#[derive(Default)]
struct OperationQueue {
    pending: VecDeque<Box<dyn Operation>>,
    busy: bool,
    /// Set while some caller is in `drain`. Nested completions only mark the
    /// queue idle and leave the next operation to that caller's loop.
    draining: bool,
}

/// Durable get/set/delete of named byte blobs, scoped per user.
pub struct LocalStorage {
    handlers: StorageHandlers,
    work: Arc<dyn TaskQueue>,
    completion: Arc<dyn TaskQueue>,
    queue: Mutex<OperationQueue>,
}

impl LocalStorage {
    /// Create a store. Launchers run on `work`, continuations on `completion`.
    pub fn new(
        backend: StorageBackend,
        work: Arc<dyn TaskQueue>,
        completion: Arc<dyn TaskQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handlers: backend.into_handlers(),
            work,
            completion,
            queue: Mutex::new(OperationQueue::default()),
        })
    }

    /// Write `data` under `key`. Completes with the blob's new total size.
    pub fn write_async(
        self: &Arc<Self>,
        user: UserId,
        mode: WriteMode,
        key: impl Into<String>,
        data: Vec<u8>,
        callback: impl FnOnce(StorageResult<u64>) + Send + 'static,
    ) {
        let handler = Arc::clone(&self.handlers.write);
        let request = WriteRequest {
            user,
            mode,
            key: key.into(),
            data,
        };
        debug!(
            user = %request.user,
            key = %request.key,
            bytes = request.data.len(),
            mode = ?request.mode,
            "queueing storage write"
        );
        self.queue_operation(ClientOperation::new(
            "write",
            move |op| handler(request, op),
            Arc::clone(&self.work),
            Arc::clone(&self.completion),
            self.finish_with(callback),
        ));
    }

    /// Read the blob under `key`. A missing key completes with empty data.
    pub fn read_async(
        self: &Arc<Self>,
        user: UserId,
        key: impl Into<String>,
        callback: impl FnOnce(StorageResult<Vec<u8>>) + Send + 'static,
    ) {
        let handler = Arc::clone(&self.handlers.read);
        let request = KeyRequest {
            user,
            key: key.into(),
        };
        debug!(user = %request.user, key = %request.key, "queueing storage read");
        self.queue_operation(ClientOperation::new(
            "read",
            move |op| handler(request, op),
            Arc::clone(&self.work),
            Arc::clone(&self.completion),
            self.finish_with(callback),
        ));
    }

    /// Delete the blob under `key`.
    pub fn clear_async(
        self: &Arc<Self>,
        user: UserId,
        key: impl Into<String>,
        callback: impl FnOnce(StorageResult<()>) + Send + 'static,
    ) {
        let handler = Arc::clone(&self.handlers.clear);
        let request = KeyRequest {
            user,
            key: key.into(),
        };
        debug!(user = %request.user, key = %request.key, "queueing storage clear");
        self.queue_operation(ClientOperation::new(
            "clear",
            move |op| handler(request, op),
            Arc::clone(&self.work),
            Arc::clone(&self.completion),
            self.finish_with(callback),
        ));
    }

    /// Operations queued behind the one in flight.
    pub fn pending_operations(&self) -> usize {
        lock(&self.queue).pending.len()
    }

    /// Whether no operation is in flight or queued.
    pub fn is_idle(&self) -> bool {
        let queue = lock(&self.queue);
        !queue.busy && queue.pending.is_empty()
    }

    /// Wrap a caller callback so the queue advances after it has run.
    fn finish_with<T: Send + 'static>(
        self: &Arc<Self>,
        callback: impl FnOnce(StorageResult<T>) + Send + 'static,
    ) -> impl FnOnce(StorageResult<T>) + Send + 'static {
        let storage = Arc::clone(self);
        move |result| {
            callback(result);
            storage.operation_complete();
        }
    }

    fn queue_operation<T: Send + 'static>(&self, op: ClientOperation<T>) {
        lock(&self.queue).pending.push_back(Box::new(op));
        self.drain();
    }

    fn operation_complete(&self) {
        lock(&self.queue).busy = false;
        self.drain();
    }

    /// Begin queued operations one at a time until one stays in flight.
    ///
    /// Inline contexts complete an operation, and queue follow-up work from
    /// its continuation, before `begin` returns. Looping here instead of
    /// recursing keeps the stack flat however long that chain gets.
    fn drain(&self) {
        let mut next = {
            let mut queue = lock(&self.queue);
            if queue.draining {
                return;
            }
            let op = Self::take_next(&mut queue);
            queue.draining = op.is_some();
            op
        };
        while let Some(op) = next {
            Self::run(op);
            let mut queue = lock(&self.queue);
            next = Self::take_next(&mut queue);
            queue.draining = next.is_some();
        }
    }

    fn take_next(queue: &mut OperationQueue) -> Option<Box<dyn Operation>> {
        if queue.busy {
            return None;
        }
        let op = queue.pending.pop_front()?;
        queue.busy = true;
        Some(op)
    }

    // Runs without the queue lock held: an inline backend may complete, and
    // re-enter `operation_complete`, before `begin` returns.
    fn run(op: Box<dyn Operation>) {
        if let Err(err) = op.begin() {
            warn!(op = op.name(), error = %err, "failed to begin storage operation");
            op.fail(err);
        }
    }
}

impl fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = lock(&self.queue);
        f.debug_struct("LocalStorage")
            .field("busy", &queue.busy)
            .field("pending", &queue.pending.len())
            .finish()
    }
}

/// Default backend: one file per key under a per-user directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of a user's blob.
    pub fn path_for(&self, user: UserId, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty()
            || key == "."
            || key == ".."
            || key.contains(['/', '\\', '\0'])
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(user.to_string()).join(key))
    }

    pub fn write(&self, request: &WriteRequest) -> StorageResult<u64> {
        let path = self.path_for(request.user, &request.key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        match request.mode {
            WriteMode::Append => options.append(true),
            WriteMode::Truncate => options.write(true).truncate(true),
        };
        let mut file = options.open(&path)?;
        file.write_all(&request.data)?;
        file.flush()?;
        Ok(file.metadata()?.len())
    }

    pub fn read(&self, request: &KeyRequest) -> StorageResult<Vec<u8>> {
        let path = self.path_for(request.user, &request.key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn clear(&self, request: &KeyRequest) -> StorageResult<()> {
        let path = self.path_for(request.user, &request.key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Expose this backend through the handler interface.
    pub fn handlers(self: Arc<Self>) -> StorageHandlers {
        let writer = Arc::clone(&self);
        let reader = Arc::clone(&self);
        let clearer = self;
        StorageHandlers::new(
            Arc::new(move |request: WriteRequest, op: OperationHandle<u64>| {
                let result = writer.write(&request);
                if let Err(err) = &result {
                    debug!(key = %request.key, error = %err, "file write failed");
                }
                op.complete(result);
            }),
            Arc::new(move |request: KeyRequest, op: OperationHandle<Vec<u8>>| {
                let result = reader.read(&request);
                if let Err(err) = &result {
                    debug!(key = %request.key, error = %err, "file read failed");
                }
                op.complete(result);
            }),
            Arc::new(move |request: KeyRequest, op: OperationHandle<()>| {
                let result = clearer.clear(&request);
                if let Err(err) = &result {
                    debug!(key = %request.key, error = %err, "file delete failed");
                }
                op.complete(result);
            }),
        )
    }
}

/// Default root for file-backed storage.
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tq")
        .join("storage")
}
