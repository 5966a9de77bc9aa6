use super::{EventId, Identity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One queued identity for a full game.
///
/// Order is by `sequence`, assigned monotonically at enqueue. `enqueued_at`
/// is informational only; coarse or skewed clocks never reorder the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    #[serde(rename = "eventId")]
    pub event_id: EventId,
    pub identity: Identity,
    #[serde(rename = "enqueuedAt")]
    pub enqueued_at: DateTime<Utc>,
    pub sequence: u64,
}
