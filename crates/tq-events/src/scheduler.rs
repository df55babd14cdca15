//! Upload scheduling: the pull side of the event queue.
//!
//! Each tick pulls at most one payload, renders its request, and hands it to
//! an [`UploadTransport`]. Failures requeue the payload and push the queue
//! into offline mode; the delay before the next tick backs off exponentially
//! with consecutive failures.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tq_common::{Result, UploadConfig};
use tracing::{debug, info, warn};

use crate::payload::{RequestData, TicketProvider, UploadPayload};
use crate::queue::{EventQueue, QueueMode};

/// HTTP status the collector returns for a malformed batch. Retrying it
/// cannot succeed, so it is treated like a success.
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Sends one rendered request to the collector.
pub trait UploadTransport: Send + Sync {
    /// Returns the HTTP status, or an error if no response was received.
    fn upload(&self, request: &RequestData, timeout: Duration) -> Result<u16>;
}

/// What one scheduler tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was ready to upload.
    Idle,
    /// The collector accepted the payload.
    Delivered { events: usize },
    /// The collector rejected the payload as malformed; it is dropped.
    Dropped { events: usize, status: u16 },
    /// The upload failed and the payload was requeued.
    Requeued { events: usize, reason: String },
}

/// Drives uploads for one [`EventQueue`].
pub struct UploadScheduler {
    queue: Arc<EventQueue>,
    tickets: Arc<dyn TicketProvider>,
    transport: Arc<dyn UploadTransport>,
    config: UploadConfig,
    retry_attempts: u32,
    last_attempt: Option<Instant>,
}

impl UploadScheduler {
    pub fn new(
        queue: Arc<EventQueue>,
        tickets: Arc<dyn TicketProvider>,
        transport: Arc<dyn UploadTransport>,
        config: UploadConfig,
    ) -> Self {
        Self {
            queue,
            tickets,
            transport,
            config,
            retry_attempts: 0,
            last_attempt: None,
        }
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Delay before the next tick: `min(2^retries, cap) * min_interval`.
    pub fn next_delay(&self) -> Duration {
        let multiplier = 1u64
            .checked_shl(self.retry_attempts)
            .unwrap_or(u64::MAX)
            .min(self.config.max_backoff_multiplier);
        Duration::from_millis(multiplier.saturating_mul(self.config.min_upload_interval_ms))
    }

    /// Events a payload needs before it is uploaded at `now`. Once the
    /// maximum interval has passed without an attempt, any event will do.
    pub fn minimum_event_count(&self, now: Instant) -> usize {
        let max_interval = Duration::from_millis(self.config.max_upload_interval_ms);
        match self.last_attempt {
            Some(last) if now.saturating_duration_since(last) <= max_interval => {
                self.config.payload_min_event_count
            }
            _ => 1,
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// Run one upload attempt as of `now`.
    pub fn tick_at(&mut self, now: Instant) -> TickOutcome {
        let minimum = self.minimum_event_count(now);
        let Some(mut payload) = self.queue.get_next_payload(minimum) else {
            return TickOutcome::Idle;
        };
        self.last_attempt = Some(now);
        let events = payload.event_count();

        let status = payload
            .get_request_data(self.tickets.as_ref(), self.queue.naming())
            .and_then(|request| {
                let timeout = Duration::from_secs(self.config.upload_timeout_secs);
                self.transport.upload(request, timeout)
            });

        match status {
            Ok(status) if (200..300).contains(&status) => {
                debug!(user = %self.queue.user(), events, status, "payload delivered");
                self.on_settled();
                TickOutcome::Delivered { events }
            }
            Ok(STATUS_BAD_REQUEST) => {
                warn!(
                    user = %self.queue.user(),
                    events,
                    "collector rejected payload as malformed; dropping it"
                );
                self.on_settled();
                TickOutcome::Dropped {
                    events,
                    status: STATUS_BAD_REQUEST,
                }
            }
            Ok(status) => {
                info!(user = %self.queue.user(), events, status, "event upload failed with HTTP status");
                self.on_failed(payload);
                TickOutcome::Requeued {
                    events,
                    reason: format!("HTTP status {status}"),
                }
            }
            Err(err) => {
                info!(user = %self.queue.user(), events, error = %err, "event upload failed");
                self.on_failed(payload);
                TickOutcome::Requeued {
                    events,
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Tick until `shutdown` fires or its sender is dropped, then run the
    /// queue's cleanup so buffered events reach storage.
    pub fn run(&mut self, shutdown: Receiver<()>) {
        loop {
            match shutdown.recv_timeout(self.next_delay()) {
                Err(RecvTimeoutError::Timeout) => {
                    self.tick();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(user = %self.queue.user(), "upload scheduler stopping");
        self.queue.cleanup();
    }

    fn on_settled(&mut self) {
        self.retry_attempts = 0;
        self.queue.set_mode(QueueMode::Normal);
    }

    fn on_failed(&mut self, payload: UploadPayload) {
        self.queue.requeue_failed_payload(payload);
        self.retry_attempts = self.retry_attempts.saturating_add(1);
        self.queue.set_mode(QueueMode::Offline);
    }
}
