//! Admission control for capacity-bounded games.
//!
//! Every mutating operation runs inside the game's critical section
//! ([`EventLocks`]) and writes the aggregate through the CAS driver in
//! [`cas`]. Business outcomes are returned as enums; only contention and
//! infrastructure faults are errors.

pub mod cas;
mod capacity;
mod hold;
mod locks;
mod sweep;
mod waitlist;

pub use capacity::{CapacityStatus, WaitlistPosition, WaitlistView};
pub use locks::EventLocks;
pub use sweep::{HoldSweeper, SweepReport};

use crate::clock::Clock;
use crate::config::{capped_seconds, HuddleConfig};
use crate::event::{
    validate_new_event, Event, EventId, Hold, HoldStatus, Identity, NewEvent, Participation,
    ValidationError,
};
use crate::metrics::AdmissionMetrics;
use crate::notify::{Notification, NotificationSink};
use crate::store::AdmissionStore;
use anyhow::anyhow;
use cas::Decision;
use chrono::Duration;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("game aggregate still contended after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("invalid game: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Why a join or hold request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Full,
    CutoffPassed,
    AlreadyParticipant,
    AlreadyWaitlisted,
    NotFound,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Full => "full",
            RejectReason::CutoffPassed => "cutoff_passed",
            RejectReason::AlreadyParticipant => "already_participant",
            RejectReason::AlreadyWaitlisted => "already_waitlisted",
            RejectReason::NotFound => "not_found",
        }
    }
}

/// A waitlisted identity that was handed a hold.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Promotion {
    pub identity: Identity,
    pub hold: Hold,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JoinOutcome {
    /// `already_participant` marks a retried join that changed nothing
    Admitted { already_participant: bool },
    /// 1-based rank in the game's waitlist
    Waitlisted { position: usize },
    Rejected(RejectReason),
}

#[derive(Clone, Debug, PartialEq)]
pub enum LeaveOutcome {
    Removed {
        from: Participation,
        promoted: Vec<Promotion>,
    },
    NotFound,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HoldOutcome {
    /// `renewed` is set when an existing ACTIVE hold got a new expiry
    Issued { hold: Hold, renewed: bool },
    Rejected(RejectReason),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConfirmOutcome {
    Confirmed,
    Expired,
    NotFound,
    IdentityMismatch,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CancelOutcome {
    Cancelled { promoted: Vec<Promotion> },
    NotFound,
    NotActive(HoldStatus),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CapacityOutcome {
    Updated {
        capacity: Option<u32>,
        promoted: Vec<Promotion>,
    },
    /// Confirmed participants plus active holds exceed the requested capacity
    BelowOccupancy { occupied: u32 },
    NotFound,
}

/// Engine tuning derived from [`HuddleConfig`].
#[derive(Clone, Debug)]
pub struct AdmissionSettings {
    pub cas_max_attempts: u32,
    pub default_hold_ttl: Duration,
    pub max_hold_ttl: Duration,
    /// Window before expiry in which the one-time expiring notice is sent
    pub expiring_notice: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            cas_max_attempts: 3,
            default_hold_ttl: Duration::seconds(120),
            max_hold_ttl: Duration::seconds(600),
            expiring_notice: Duration::seconds(30),
        }
    }
}

impl AdmissionSettings {
    pub fn from_config(config: &HuddleConfig) -> Self {
        Self {
            cas_max_attempts: config.admission.cas_max_attempts,
            default_hold_ttl: capped_seconds(config.holds.default_ttl_seconds),
            max_hold_ttl: capped_seconds(config.holds.max_ttl_seconds),
            expiring_notice: capped_seconds(config.holds.expiring_notice_seconds),
        }
    }

    /// Missing or non-positive TTLs fall back to the default; long ones are capped.
    pub fn clamp_ttl(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(ttl) if ttl > Duration::zero() => ttl.min(self.max_hold_ttl),
            _ => self.default_hold_ttl.min(self.max_hold_ttl),
        }
    }
}

/// Capacity manager, waitlist and hold services over one store.
pub struct AdmissionEngine {
    store: Arc<dyn AdmissionStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    locks: EventLocks,
    settings: AdmissionSettings,

    /// Set while a sweep is running
    sweeping: AtomicBool,

    pub metrics: AdmissionMetrics,
}

impl AdmissionEngine {
    pub fn new(
        store: Arc<dyn AdmissionStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        settings: AdmissionSettings,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            locks: EventLocks::new(),
            settings,
            sweeping: AtomicBool::new(false),
            metrics: AdmissionMetrics::new(),
        }
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    /// Publish a new game.
    pub fn create_game(&self, spec: NewEvent) -> Result<Event, AdmissionError> {
        let now = self.clock.now();
        validate_new_event(&spec, now)?;

        let event = Event::new(EventId::generate(), spec, now);
        self.store.insert_event(&event)?;

        info!(
            event_id = %event.id,
            capacity = ?event.capacity,
            waitlist_enabled = event.waitlist_enabled,
            "Game created"
        );
        Ok(event)
    }

    /// Where `identity` stands for one game. `None` if the game does not exist.
    pub fn participation(
        &self,
        event_id: &EventId,
        identity: &Identity,
    ) -> Result<Option<Participation>, AdmissionError> {
        match self.store.load_event(event_id)? {
            Some(event) => Ok(Some(self.participation_of(&event, identity)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn participation_of(
        &self,
        event: &Event,
        identity: &Identity,
    ) -> Result<Participation, AdmissionError> {
        if event.is_participant(identity) {
            return Ok(Participation::Confirmed);
        }
        if self.store.find_active_hold(&event.id, identity)?.is_some() {
            return Ok(Participation::Held);
        }
        let queued = self
            .store
            .load_waitlist(&event.id)?
            .iter()
            .any(|entry| &entry.identity == identity);
        if queued {
            return Ok(Participation::Waitlisted);
        }
        Ok(Participation::None)
    }

    fn load_required(&self, event_id: &EventId) -> anyhow::Result<Event> {
        self.store
            .load_event(event_id)?
            .ok_or_else(|| anyhow!("game {} disappeared during update", event_id))
    }

    /// Writes the aggregate through the CAS driver starting from `initial`.
    pub(crate) fn update_event<T>(
        &self,
        initial: Event,
        decide: impl FnMut(&Event) -> Decision<Event, T>,
    ) -> Result<T, AdmissionError> {
        let event_id = initial.id.clone();
        let result = cas::run(
            self.settings.cas_max_attempts,
            initial,
            || self.load_required(&event_id),
            decide,
            |next, expected| self.store.cas_save_event(next, expected),
        );

        if let Err(AdmissionError::Contention { attempts }) = &result {
            self.metrics.record_contention();
            warn!(event_id = %event_id, attempts, "Gave up on contended game aggregate");
        }
        result
    }

    /// Delivers a notification. Sink failures are logged and swallowed.
    pub(crate) fn notify(&self, notification: Notification) {
        let kind = notification.kind();
        if let Err(e) = self.sink.notify(notification) {
            warn!(error = %e, kind, "Notification sink failed");
        }
    }

    pub(crate) fn notify_capacity(&self, event: &Event) {
        self.notify(Notification::CapacityUpdate {
            event_id: event.id.clone(),
            remaining_slots: event.remaining(),
        });
    }
}
