//! Durable per-user blob storage for the telemetry queue.
//!
//! - [`operation`]: single-shot asynchronous operations and task queues
//! - [`local`]: the FIFO-serialized [`LocalStorage`] and its file backend

pub mod local;
pub mod operation;

pub use local::{
    default_storage_dir, ClearHandler, FileStorage, KeyRequest, LocalStorage, ReadHandler,
    StorageBackend, StorageHandlers, WriteHandler, WriteMode, WriteRequest,
};
pub use operation::{
    ClientOperation, InlineQueue, Operation, OperationHandle, OperationState, StorageError,
    StorageResult, Task, TaskQueue, WorkerQueue,
};
