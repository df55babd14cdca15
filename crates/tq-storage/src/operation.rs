//! Asynchronous client operations and the execution contexts they run on.
//!
//! A [`ClientOperation`] wraps one unit of work that completes later, possibly
//! from another thread:
//!
//! ```text
//! Created --begin()--> Begun --complete()/fail()--> Completed
//! ```
//!
//! `begin` schedules the launcher on the work [`TaskQueue`] and hands it an
//! [`OperationHandle`]. Whoever holds that handle (typically a storage backend)
//! owns the operation until it calls [`OperationHandle::complete`]; the
//! continuation then runs exactly once on the completion queue. Completing a
//! second time is ignored and logged, so a backend racing a synchronous
//! failure path can never run the continuation twice.

use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors delivered to storage continuations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage operation failed: {0}")]
    Failed(String),

    #[error("I/O error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("execution context is shut down")]
    QueueClosed,

    #[error("operation already begun")]
    AlreadyBegun,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type carried by storage continuations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A unit of work for a [`TaskQueue`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// An execution context that runs submitted tasks.
///
/// The pipeline owns no threads of its own; callers choose where launchers
/// and continuations run by supplying queues.
pub trait TaskQueue: Send + Sync {
    /// Schedule a task. Fails only if the context has been shut down.
    fn submit(&self, task: Task) -> Result<(), StorageError>;
}

/// Runs every task immediately on the submitting thread.
///
/// Deterministic; used by tests and by single-threaded hosts that pump
/// their own loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl TaskQueue for InlineQueue {
    fn submit(&self, task: Task) -> Result<(), StorageError> {
        task();
        Ok(())
    }
}

/// A single background thread draining tasks in submission order.
pub struct WorkerQueue {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl WorkerQueue {
    /// Spawn the worker thread.
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Task>();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(task) = rx.recv() {
                task();
            }
        })?;
        let thread_id = handle.thread().id();
        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Stop accepting tasks and wait for queued ones to finish.
    ///
    /// Called from the worker itself this only closes the queue.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                warn!(queue = %self.name, "worker thread panicked");
            }
        }
    }
}

impl TaskQueue for WorkerQueue {
    fn submit(&self, task: Task) -> Result<(), StorageError> {
        let sender = lock(&self.sender);
        match sender.as_ref() {
            Some(tx) => tx.send(task).map_err(|_| StorageError::QueueClosed),
            None => Err(StorageError::QueueClosed),
        }
    }
}

impl fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerQueue").field("name", &self.name).finish()
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Lifecycle of a [`ClientOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Created,
    Begun,
    Completed,
}

type Launcher<T> = Box<dyn FnOnce(OperationHandle<T>) + Send + 'static>;
type Continuation<T> = Box<dyn FnOnce(StorageResult<T>) + Send + 'static>;

struct Slots<T> {
    state: OperationState,
    launcher: Option<Launcher<T>>,
    continuation: Option<Continuation<T>>,
}

struct OperationInner<T> {
    name: &'static str,
    work: Arc<dyn TaskQueue>,
    completion: Arc<dyn TaskQueue>,
    slots: Mutex<Slots<T>>,
}

/// A unit of asynchronous work with a single-shot continuation.
pub struct ClientOperation<T> {
    inner: Arc<OperationInner<T>>,
}

impl<T: Send + 'static> ClientOperation<T> {
    pub fn new(
        name: &'static str,
        launcher: impl FnOnce(OperationHandle<T>) + Send + 'static,
        work: Arc<dyn TaskQueue>,
        completion: Arc<dyn TaskQueue>,
        continuation: impl FnOnce(StorageResult<T>) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(OperationInner {
                name,
                work,
                completion,
                slots: Mutex::new(Slots {
                    state: OperationState::Created,
                    launcher: Some(Box::new(launcher)),
                    continuation: Some(Box::new(continuation)),
                }),
            }),
        }
    }

    /// Schedule the launcher on the work queue.
    ///
    /// The operation is `Begun` even when scheduling fails, so the caller
    /// can follow up with [`ClientOperation::fail`].
    pub fn begin(&self) -> Result<(), StorageError> {
        let launcher = {
            let mut slots = lock(&self.inner.slots);
            if slots.state != OperationState::Created {
                return Err(StorageError::AlreadyBegun);
            }
            slots.state = OperationState::Begun;
            slots.launcher.take()
        };
        let Some(launcher) = launcher else {
            return Err(StorageError::AlreadyBegun);
        };
        let handle = self.handle();
        debug!(op = self.inner.name, "operation begun");
        self.inner.work.submit(Box::new(move || launcher(handle)))
    }

    /// Complete with a failure.
    pub fn fail(&self, error: StorageError) -> bool {
        self.handle().complete(Err(error))
    }

    pub fn state(&self) -> OperationState {
        lock(&self.inner.slots).state
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// A completion handle for this operation.
    pub fn handle(&self) -> OperationHandle<T> {
        OperationHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The capability to complete a begun operation.
///
/// Handed to launchers; holding it keeps the operation alive.
pub struct OperationHandle<T> {
    inner: Arc<OperationInner<T>>,
}

impl<T> Clone for OperationHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> OperationHandle<T> {
    /// Deliver the result to the continuation on the completion queue.
    ///
    /// Returns `false` (and does nothing) if the operation was not begun or
    /// was already completed.
    pub fn complete(&self, result: StorageResult<T>) -> bool {
        let continuation = {
            let mut slots = lock(&self.inner.slots);
            match slots.state {
                OperationState::Created => {
                    warn!(op = self.inner.name, "complete called before begin; ignored");
                    return false;
                }
                OperationState::Completed => {
                    warn!(op = self.inner.name, "operation completed twice; ignored");
                    return false;
                }
                OperationState::Begun => {
                    slots.state = OperationState::Completed;
                    slots.continuation.take()
                }
            }
        };
        let Some(continuation) = continuation else {
            return false;
        };

        // The task owns the continuation until it runs; if the completion
        // context is gone we still run it here so it is never lost.
        let pending = Arc::new(Mutex::new(Some((continuation, result))));
        let scheduled = Arc::clone(&pending);
        let submitted = self.inner.completion.submit(Box::new(move || {
            if let Some((continuation, result)) = lock(&scheduled).take() {
                continuation(result);
            }
        }));
        if submitted.is_err() {
            warn!(
                op = self.inner.name,
                "completion queue closed; running continuation inline"
            );
            let leftover = lock(&pending).take();
            if let Some((continuation, result)) = leftover {
                continuation(result);
            }
        }
        true
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

/// Type-erased view of a queued operation.
pub trait Operation: Send {
    fn begin(&self) -> Result<(), StorageError>;
    fn fail(&self, error: StorageError) -> bool;
    fn name(&self) -> &'static str;
}

impl<T: Send + 'static> Operation for ClientOperation<T> {
    fn begin(&self) -> Result<(), StorageError> {
        ClientOperation::begin(self)
    }

    fn fail(&self, error: StorageError) -> bool {
        ClientOperation::fail(self, error)
    }

    fn name(&self) -> &'static str {
        ClientOperation::name(self)
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
