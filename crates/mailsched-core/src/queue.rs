//! Dispatch queue types shared between the dispatcher and the delivery workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::types::EventId;

/// One hand-off from the dispatcher to the worker pool.
///
/// Carries only the event id; the worker reloads the event and checks that
/// it is still `claimed`, so a job delivered twice is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// UUIDv7, time-sortable; used to correlate log lines.
    pub job_id: Uuid,
    pub event_id: EventId,
    pub dispatched_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(event_id: EventId) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            event_id,
            dispatched_at: Utc::now(),
        }
    }
}

pub type JobSender = mpsc::Sender<DeliveryJob>;

/// Receiving end shared by every worker in the pool.
pub type SharedJobReceiver = Arc<Mutex<mpsc::Receiver<DeliveryJob>>>;

/// Bounded dispatcher → worker queue.
pub fn dispatch_queue(capacity: usize) -> (JobSender, SharedJobReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Arc::new(Mutex::new(rx)))
}
