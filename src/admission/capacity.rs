use super::cas::Decision;
use super::{
    AdmissionEngine, AdmissionError, CapacityOutcome, JoinOutcome, LeaveOutcome, RejectReason,
};
use crate::event::{
    validate_new_event, Event, EventId, HoldStatus, Identity, NewEvent, Participant, Participation,
};
use crate::notify::Notification;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

/// Capacity snapshot of one game.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityStatus {
    pub event_id: EventId,
    pub capacity: Option<u32>,
    pub participants: u32,
    pub held: u32,
    pub remaining_slots: Option<u32>,
    pub waitlist_length: usize,
    pub waitlist_enabled: bool,
    pub rsvp_cutoff: Option<DateTime<Utc>>,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistPosition {
    pub identity: Identity,
    pub position: usize,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistView {
    pub entries: Vec<WaitlistPosition>,
    /// The caller's own rank, if queued
    pub your_position: Option<usize>,
}

enum JoinAttempt {
    Admitted(Event),
    AlreadyParticipant,
    NoRoom,
}

impl AdmissionEngine {
    /// RSVP to a game.
    pub fn join(
        &self,
        event_id: &EventId,
        identity: &Identity,
    ) -> Result<JoinOutcome, AdmissionError> {
        let outcome = self
            .locks
            .with(event_id, || self.join_locked(event_id, identity))?;

        match &outcome {
            JoinOutcome::Admitted {
                already_participant: false,
            } => self.metrics.record_admitted(),
            JoinOutcome::Admitted { .. } => {}
            JoinOutcome::Waitlisted { .. } => self.metrics.record_waitlisted(),
            JoinOutcome::Rejected(_) => self.metrics.record_rejected(),
        }
        debug!(event_id = %event_id, identity = %identity, outcome = ?outcome, "Join handled");
        Ok(outcome)
    }

    fn join_locked(
        &self,
        event_id: &EventId,
        identity: &Identity,
    ) -> Result<JoinOutcome, AdmissionError> {
        let Some(event) = self.store.load_event(event_id)? else {
            return Ok(JoinOutcome::Rejected(RejectReason::NotFound));
        };

        match self.participation_of(&event, identity)? {
            Participation::Confirmed => {
                return Ok(JoinOutcome::Admitted {
                    already_participant: true,
                })
            }
            Participation::Held => {
                return Ok(JoinOutcome::Rejected(RejectReason::AlreadyParticipant))
            }
            Participation::Waitlisted => {
                return Ok(JoinOutcome::Rejected(RejectReason::AlreadyWaitlisted))
            }
            Participation::None => {}
        }

        let now = self.clock.now();
        if event.cutoff_passed(now) {
            return Ok(JoinOutcome::Rejected(RejectReason::CutoffPassed));
        }

        let waitlist_enabled = event.waitlist_enabled;
        let attempt = self.update_event(event, |current| {
            if current.is_participant(identity) {
                return Decision::Abort(JoinAttempt::AlreadyParticipant);
            }
            if !current.has_room() {
                return Decision::Abort(JoinAttempt::NoRoom);
            }
            let mut next = current.clone();
            next.participants.push(Participant {
                identity: identity.clone(),
                joined_at: now,
            });
            Decision::Commit(next.clone(), JoinAttempt::Admitted(next))
        })?;

        match attempt {
            JoinAttempt::Admitted(next) => {
                info!(event_id = %event_id, identity = %identity, "Participant admitted");
                self.notify(Notification::ParticipantJoined {
                    event_id: event_id.clone(),
                    identity: identity.clone(),
                });
                self.notify_capacity(&next);
                return Ok(JoinOutcome::Admitted {
                    already_participant: false,
                });
            }
            JoinAttempt::AlreadyParticipant => {
                return Ok(JoinOutcome::Admitted {
                    already_participant: true,
                })
            }
            JoinAttempt::NoRoom => {}
        }

        if !waitlist_enabled {
            return Ok(JoinOutcome::Rejected(RejectReason::Full));
        }

        let position = match self.enqueue_locked(event_id, identity, now)? {
            Some(position) => position,
            None => return Ok(JoinOutcome::Rejected(RejectReason::AlreadyWaitlisted)),
        };
        Ok(JoinOutcome::Waitlisted { position })
    }

    /// Withdraw from a game in whatever state the identity is in.
    pub fn leave(
        &self,
        event_id: &EventId,
        identity: &Identity,
    ) -> Result<LeaveOutcome, AdmissionError> {
        let outcome = self
            .locks
            .with(event_id, || self.leave_locked(event_id, identity))?;

        if matches!(outcome, LeaveOutcome::Removed { .. }) {
            self.metrics.record_left();
        }
        debug!(event_id = %event_id, identity = %identity, outcome = ?outcome, "Leave handled");
        Ok(outcome)
    }

    fn leave_locked(
        &self,
        event_id: &EventId,
        identity: &Identity,
    ) -> Result<LeaveOutcome, AdmissionError> {
        let Some(event) = self.store.load_event(event_id)? else {
            return Ok(LeaveOutcome::NotFound);
        };

        if event.is_participant(identity) {
            let removed = self.update_event(event, |current| {
                let mut next = current.clone();
                if next.remove_participant(identity) {
                    Decision::Commit(next.clone(), Some(next))
                } else {
                    Decision::Abort(None)
                }
            })?;

            if let Some(next) = removed {
                info!(event_id = %event_id, identity = %identity, "Participant left");
                self.notify(Notification::ParticipantLeft {
                    event_id: event_id.clone(),
                    identity: identity.clone(),
                });
                self.notify_capacity(&next);
                let promoted = self.promote_locked(event_id, 1)?;
                return Ok(LeaveOutcome::Removed {
                    from: Participation::Confirmed,
                    promoted,
                });
            }
        }

        let held = self.store.find_active_hold(event_id, identity)?;
        if let Some(hold) = held {
            // Losing the release means another writer moved the hold first
            if self.release_locked(hold, HoldStatus::Cancelled)? {
                self.metrics.record_hold_cancelled();
                info!(event_id = %event_id, identity = %identity, "Held identity left");
                let promoted = self.promote_locked(event_id, 1)?;
                return Ok(LeaveOutcome::Removed {
                    from: Participation::Held,
                    promoted,
                });
            }
        }

        if self.store.remove_waitlist(event_id, identity)? {
            info!(event_id = %event_id, identity = %identity, "Left waitlist");
            return Ok(LeaveOutcome::Removed {
                from: Participation::Waitlisted,
                promoted: Vec::new(),
            });
        }

        Ok(LeaveOutcome::NotFound)
    }

    /// Change a game's capacity. Raising it promotes from the waitlist.
    pub fn set_capacity(
        &self,
        event_id: &EventId,
        capacity: Option<u32>,
    ) -> Result<CapacityOutcome, AdmissionError> {
        let spec = NewEvent {
            capacity,
            ..NewEvent::default()
        };
        validate_new_event(&spec, self.clock.now())?;

        self.locks.with(event_id, || -> Result<_, AdmissionError> {
            let Some(event) = self.store.load_event(event_id)? else {
                return Ok(CapacityOutcome::NotFound);
            };

            let applied = self.update_event(event, |current| {
                if let Some(requested) = capacity {
                    if requested < current.occupied() {
                        return Decision::Abort(Err(current.occupied()));
                    }
                }
                let mut next = current.clone();
                next.capacity = capacity;
                Decision::Commit(next.clone(), Ok(next))
            })?;

            let next = match applied {
                Ok(next) => next,
                Err(occupied) => return Ok(CapacityOutcome::BelowOccupancy { occupied }),
            };

            info!(event_id = %event_id, capacity = ?capacity, "Capacity changed");
            self.notify_capacity(&next);
            let promoted = self.promote_locked(event_id, usize::MAX)?;
            Ok(CapacityOutcome::Updated { capacity, promoted })
        })
    }

    /// Capacity snapshot, or `None` if the game does not exist.
    pub fn status(&self, event_id: &EventId) -> Result<Option<CapacityStatus>, AdmissionError> {
        let Some(event) = self.store.load_event(event_id)? else {
            return Ok(None);
        };
        let waitlist_length = self.store.load_waitlist(event_id)?.len();
        Ok(Some(status_of(&event, waitlist_length)))
    }

    /// Confirmed participants ordered by join time.
    pub fn participants(
        &self,
        event_id: &EventId,
    ) -> Result<Option<Vec<Participant>>, AdmissionError> {
        let Some(event) = self.store.load_event(event_id)? else {
            return Ok(None);
        };
        let mut participants = event.participants;
        participants.sort_by_key(|p| p.joined_at);
        Ok(Some(participants))
    }

    /// Waitlist in promotion order plus the caller's own position.
    pub fn waitlist(
        &self,
        event_id: &EventId,
        caller: Option<&Identity>,
    ) -> Result<Option<WaitlistView>, AdmissionError> {
        if self.store.load_event(event_id)?.is_none() {
            return Ok(None);
        }

        let entries: Vec<WaitlistPosition> = self
            .store
            .load_waitlist(event_id)?
            .into_iter()
            .enumerate()
            .map(|(i, entry)| WaitlistPosition {
                identity: entry.identity,
                position: i + 1,
                enqueued_at: entry.enqueued_at,
            })
            .collect();

        let your_position = caller.and_then(|identity| {
            entries
                .iter()
                .find(|e| &e.identity == identity)
                .map(|e| e.position)
        });

        Ok(Some(WaitlistView {
            entries,
            your_position,
        }))
    }
}

fn status_of(event: &Event, waitlist_length: usize) -> CapacityStatus {
    CapacityStatus {
        event_id: event.id.clone(),
        capacity: event.capacity,
        participants: event.participant_count(),
        held: event.reserved,
        remaining_slots: event.remaining(),
        waitlist_length,
        waitlist_enabled: event.waitlist_enabled,
        rsvp_cutoff: event.rsvp_cutoff,
        version: event.version,
    }
}
