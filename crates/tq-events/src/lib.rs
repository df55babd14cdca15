//! Telemetry events and the persistent, backpressure-aware event queue.
//!
//! - [`event`]: immutable [`EventRecord`]s and their persisted line format
//! - [`payload`]: bounded [`UploadPayload`] batches and upload request rendering
//! - [`directory`]: the index of persisted event files
//! - [`queue`]: the per-user [`EventQueue`]
//! - [`scheduler`]: the [`UploadScheduler`] that pulls payloads and applies backoff

pub mod directory;
pub mod event;
pub mod payload;
pub mod queue;
pub mod scheduler;

pub use directory::FileIndex;
pub use event::{EventParseError, EventRecord};
pub use payload::{PayloadFull, RequestData, TicketProvider, UploadPayload};
pub use queue::{EventQueue, QueueMode, QueueStats};
pub use scheduler::{TickOutcome, UploadScheduler, UploadTransport};
