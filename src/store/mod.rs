//! Admission state persistence.
//!
//! The engine only talks to [`AdmissionStore`]. Every capacity mutation is
//! written with [`AdmissionStore::cas_save_event`], which succeeds only when
//! the stored version still equals the version the caller read. Hold
//! writes are conditional on the stored status in the same way, so every
//! hold leaves ACTIVE exactly once even with several writers on one store.

use crate::event::{Event, EventId, Hold, HoldId, HoldStatus, Identity, WaitlistEntry};
use anyhow::Result;
use chrono::{DateTime, Utc};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub trait AdmissionStore: Send + Sync {
    /// Stores a freshly published game. Fails if the id already exists.
    fn insert_event(&self, event: &Event) -> Result<()>;

    fn load_event(&self, id: &EventId) -> Result<Option<Event>>;

    /// Replaces the stored aggregate with `event` iff the stored version
    /// equals `expected_version`. Returns false on a version conflict.
    fn cas_save_event(&self, event: &Event, expected_version: u64) -> Result<bool>;

    /// Games with at least one reserved unit.
    fn reserved_event_ids(&self) -> Result<Vec<EventId>>;

    /// Games whose waitlist is not empty.
    fn waitlisted_event_ids(&self) -> Result<Vec<EventId>>;

    /// Records a new ACTIVE hold. Returns false, writing nothing, if the
    /// identity already has an ACTIVE hold for this game.
    fn insert_hold(&self, hold: &Hold) -> Result<bool>;

    /// Overwrites `expires_at`, `status` and `expiry_notified` iff the
    /// stored hold is still in `expected` status. Returns false otherwise.
    fn update_hold(&self, hold: &Hold, expected: HoldStatus) -> Result<bool>;

    fn load_hold(&self, event_id: &EventId, hold_id: HoldId) -> Result<Option<Hold>>;

    fn find_active_hold(&self, event_id: &EventId, identity: &Identity) -> Result<Option<Hold>>;

    fn active_holds(&self, event_id: &EventId) -> Result<Vec<Hold>>;

    /// ACTIVE holds across all games with `expires_at < before`.
    fn active_holds_expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<Hold>>;

    /// Waitlist of one game in FIFO order.
    fn load_waitlist(&self, event_id: &EventId) -> Result<Vec<WaitlistEntry>>;

    /// Appends `identity` with the next sequence number. Returns `None` if
    /// the identity is already queued for this game.
    fn enqueue_waitlist(
        &self,
        event_id: &EventId,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<Option<WaitlistEntry>>;

    fn remove_waitlist(&self, event_id: &EventId, identity: &Identity) -> Result<bool>;
}
