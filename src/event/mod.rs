use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

mod hold;
mod validation;
mod waitlist;

pub use hold::{Hold, HoldId, HoldStatus};
pub use validation::{validate_new_event, ValidationError};
pub use waitlist::WaitlistEntry;

/// Identifier of a game (the scarce, shared resource).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Time-ordered id for newly published games.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Stable, opaque identity key of a caller.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// A confirmed participant of a game.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub identity: Identity,
    #[serde(rename = "joinedAt")]
    pub joined_at: DateTime<Utc>,
}

/// Request to publish a new game.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewEvent {
    /// Maximum participants; absent means unlimited
    #[serde(default)]
    pub capacity: Option<u32>,

    /// No joins accepted after this instant
    #[serde(default, rename = "rsvpCutoff")]
    pub rsvp_cutoff: Option<DateTime<Utc>>,

    #[serde(default, rename = "waitlistEnabled")]
    pub waitlist_enabled: bool,
}

/// Per-game capacity aggregate.
///
/// `participants.len() + reserved` never exceeds `capacity`. Only the
/// admission paths write this aggregate, and every write goes through a
/// compare-and-swap on `version`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub capacity: Option<u32>,
    pub rsvp_cutoff: Option<DateTime<Utc>>,
    pub waitlist_enabled: bool,

    /// Confirmed participants in join order
    pub participants: Vec<Participant>,

    /// Capacity units held by ACTIVE holds
    pub reserved: u32,

    /// Optimistic concurrency token, bumped on every save
    pub version: u64,

    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(id: EventId, spec: NewEvent, now: DateTime<Utc>) -> Self {
        Self {
            id,
            capacity: spec.capacity,
            rsvp_cutoff: spec.rsvp_cutoff,
            waitlist_enabled: spec.waitlist_enabled,
            participants: Vec::new(),
            reserved: 0,
            version: 0,
            created_at: now,
        }
    }

    pub fn participant_count(&self) -> u32 {
        self.participants.len() as u32
    }

    /// Units counted against capacity: confirmed participants plus active holds.
    pub fn occupied(&self) -> u32 {
        self.participant_count() + self.reserved
    }

    /// Free units, or `None` when capacity is unlimited.
    pub fn remaining(&self) -> Option<u32> {
        self.capacity
            .map(|capacity| capacity.saturating_sub(self.occupied()))
    }

    pub fn has_room(&self) -> bool {
        self.remaining().map_or(true, |free| free > 0)
    }

    pub fn is_participant(&self, identity: &Identity) -> bool {
        self.participants.iter().any(|p| &p.identity == identity)
    }

    /// Joins are refused strictly after the cutoff instant.
    pub fn cutoff_passed(&self, now: DateTime<Utc>) -> bool {
        self.rsvp_cutoff.map_or(false, |cutoff| now > cutoff)
    }

    /// Removes a confirmed participant. Returns false if absent.
    pub fn remove_participant(&mut self, identity: &Identity) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| &p.identity != identity);
        self.participants.len() != before
    }
}

/// Where an identity stands for one game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participation {
    None,
    Waitlisted,
    Held,
    Confirmed,
}
