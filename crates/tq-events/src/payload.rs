//! Upload payloads: bounded batches of events bound for one upload request.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tq_common::{Error, EventNaming, Result, TenantLimits, UserId};
use tracing::{debug, warn};

use crate::event::EventRecord;

pub const CONTENT_TYPE: &str = "application/x-json-stream";
pub const USER_TICKET_HEADER: &str = "X-AuthXToken";
pub const DEVICE_TICKET_HEADER: &str = "X-DeviceAuthXToken";

/// Returned by [`UploadPayload::add_event`] when the payload is at capacity.
/// Carries the rejected event back to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("upload payload is full")]
pub struct PayloadFull(pub EventRecord);

impl PayloadFull {
    pub fn into_event(self) -> EventRecord {
        self.0
    }
}

/// Supplies the short-lived credentials an upload request needs.
///
/// Implementations may block; the scheduler calls them from its own
/// context, never while the event queue's lock is held.
pub trait TicketProvider: Send + Sync {
    /// Device-level ticket. Fetched first.
    fn device_ticket(&self) -> Result<String>;

    /// Ticket for the user who owns the events.
    fn user_ticket(&self, user: UserId) -> Result<String>;
}

/// A rendered upload request, opaque to the queue beyond being cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestData {
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// An ordered batch of at most `capacity` events for one user.
pub struct UploadPayload {
    owner: UserId,
    capacity: usize,
    events: VecDeque<EventRecord>,
    request: Option<RequestData>,
}

impl UploadPayload {
    pub fn new(owner: UserId, limits: &TenantLimits) -> Self {
        Self {
            owner,
            capacity: limits.max_events_per_payload,
            events: VecDeque::new(),
            request: None,
        }
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    pub fn events(&self) -> impl Iterator<Item = &EventRecord> {
        self.events.iter()
    }

    /// Append an event. Fails once the payload holds `capacity` events.
    pub fn add_event(&mut self, event: EventRecord) -> std::result::Result<(), PayloadFull> {
        if self.is_full() {
            return Err(PayloadFull(event));
        }
        self.events.push_back(event);
        self.request = None;
        Ok(())
    }

    /// Move events from the front into `out` as persisted lines.
    ///
    /// Stops once `out` holds at least `target_bytes`, so the last event may
    /// overshoot the target. `earliest` is lowered to the oldest timestamp
    /// written. Returns how many events are left in the payload.
    pub fn extract_events_and_serialize(
        &mut self,
        out: &mut Vec<u8>,
        target_bytes: usize,
        earliest: &mut DateTime<Utc>,
    ) -> usize {
        let mut moved = 0usize;
        while out.len() < target_bytes {
            let Some(event) = self.events.pop_front() else {
                break;
            };
            if event.timestamp() < *earliest {
                *earliest = event.timestamp();
            }
            out.extend_from_slice(event.serialize().as_bytes());
            out.push(b'\n');
            moved += 1;
        }
        if moved > 0 {
            self.request = None;
        }
        self.events.len()
    }

    /// Build (once) the upload request for the buffered events.
    ///
    /// Fetches the device ticket, then the user ticket. A failure at either
    /// step is returned and leaves the payload untouched; a later call
    /// retries from the start.
    pub fn get_request_data(
        &mut self,
        tickets: &dyn TicketProvider,
        naming: &EventNaming,
    ) -> Result<&RequestData> {
        let request = match self.request.take() {
            Some(request) => request,
            None => {
                let device = tickets
                    .device_ticket()
                    .map_err(|e| ticket_error("device", e))?;
                let user = tickets
                    .user_ticket(self.owner)
                    .map_err(|e| ticket_error("user", e))?;
                let request = self.render(naming, device, user)?;
                debug!(
                    user = %self.owner,
                    events = self.events.len(),
                    bytes = request.body.len(),
                    "rendered upload request"
                );
                request
            }
        };
        Ok(self.request.insert(request))
    }

    /// Cached request data, if rendered and still current.
    pub fn cached_request(&self) -> Option<&RequestData> {
        self.request.as_ref()
    }

    fn render(&self, naming: &EventNaming, device: String, user: String) -> Result<RequestData> {
        let mut body = String::new();
        for event in &self.events {
            body.push_str(&serde_json::to_string(&event.render_upload_line(naming))?);
            body.push('\n');
        }
        let headers = BTreeMap::from([
            ("Content-Type".to_string(), CONTENT_TYPE.to_string()),
            (DEVICE_TICKET_HEADER.to_string(), device),
            (USER_TICKET_HEADER.to_string(), user),
        ]);
        Ok(RequestData { headers, body })
    }
}

fn ticket_error(kind: &str, err: Error) -> Error {
    warn!(ticket = kind, error = %err, "failed to fetch upload ticket");
    match err {
        Error::Ticket(_) => err,
        other => Error::Ticket(format!("{kind} ticket: {other}")),
    }
}

impl fmt::Debug for UploadPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadPayload")
            .field("owner", &self.owner)
            .field("events", &self.events.len())
            .field("capacity", &self.capacity)
            .field("request_cached", &self.request.is_some())
            .finish()
    }
}
