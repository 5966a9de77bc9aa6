use super::hold::Reservation;
use super::{AdmissionEngine, AdmissionError, Promotion};
use crate::event::{EventId, Identity, Participation, WaitlistEntry};
use crate::notify::Notification;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

impl AdmissionEngine {
    /// Append `identity` to a game's waitlist.
    ///
    /// Returns `None` if the identity is already queued or the game does not exist.
    pub fn enqueue(
        &self,
        event_id: &EventId,
        identity: &Identity,
    ) -> Result<Option<WaitlistEntry>, AdmissionError> {
        self.locks.with(event_id, || -> Result<_, AdmissionError> {
            if self.store.load_event(event_id)?.is_none() {
                return Ok(None);
            }
            let now = self.clock.now();
            let entry = self.store.enqueue_waitlist(event_id, identity, now)?;
            if entry.is_some() {
                self.metrics.record_waitlisted();
            }
            Ok(entry)
        })
    }

    /// Drop `identity` from a game's waitlist. Returns false if it was not queued.
    pub fn remove_from_waitlist(
        &self,
        event_id: &EventId,
        identity: &Identity,
    ) -> Result<bool, AdmissionError> {
        self.locks.with(event_id, || -> Result<_, AdmissionError> {
            Ok(self.store.remove_waitlist(event_id, identity)?)
        })
    }

    /// Promote up to `n` waitlisted identities into holds, in FIFO order.
    pub fn promote_up_to(
        &self,
        event_id: &EventId,
        n: usize,
    ) -> Result<Vec<Promotion>, AdmissionError> {
        self.locks.with(event_id, || -> Result<_, AdmissionError> {
            if self.store.load_event(event_id)?.is_none() {
                return Ok(Vec::new());
            }
            self.promote_locked(event_id, n)
        })
    }

    /// Enqueues and returns the 1-based position, or `None` if already queued.
    pub(crate) fn enqueue_locked(
        &self,
        event_id: &EventId,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, AdmissionError> {
        let Some(entry) = self.store.enqueue_waitlist(event_id, identity, now)? else {
            return Ok(None);
        };

        let position = self
            .store
            .load_waitlist(event_id)?
            .iter()
            .position(|e| e.sequence == entry.sequence)
            .map(|i| i + 1)
            .unwrap_or(1);

        info!(event_id = %event_id, identity = %identity, position, "Added to waitlist");
        self.notify(Notification::WaitlistJoined {
            event_id: event_id.clone(),
            identity: identity.clone(),
            position,
        });
        Ok(Some(position))
    }

    /// One promotion attempt per freed unit, stopping early when the
    /// waitlist empties or no unit is free. Must hold the game's lock.
    pub(crate) fn promote_locked(
        &self,
        event_id: &EventId,
        n: usize,
    ) -> Result<Vec<Promotion>, AdmissionError> {
        let mut promoted = Vec::new();

        while promoted.len() < n {
            let Some(head) = self.store.load_waitlist(event_id)?.into_iter().next() else {
                break;
            };
            let event = self.load_required(event_id)?;

            match self.participation_of(&event, &head.identity)? {
                Participation::Confirmed | Participation::Held => {
                    warn!(
                        event_id = %event_id,
                        identity = %head.identity,
                        "Skipping waitlist entry for identity that already has a place"
                    );
                    self.store.remove_waitlist(event_id, &head.identity)?;
                    self.metrics.record_promotion_skipped();
                    continue;
                }
                Participation::Waitlisted | Participation::None => {}
            }

            let ttl = self.settings.clamp_ttl(None);
            let hold = match self.reserve_locked(event, &head.identity, ttl)? {
                Reservation::Held(hold) => hold,
                Reservation::NoRoom => {
                    debug!(event_id = %event_id, "No free unit, promotion stops");
                    break;
                }
                Reservation::AlreadyHeld => {
                    self.store.remove_waitlist(event_id, &head.identity)?;
                    self.metrics.record_promotion_skipped();
                    continue;
                }
            };

            // The hold is authoritative; a stale entry is skipped next time
            self.store.remove_waitlist(event_id, &head.identity)?;
            self.metrics.record_promotion();

            info!(
                event_id = %event_id,
                identity = %head.identity,
                hold_id = %hold.hold_id,
                "Promoted from waitlist"
            );
            self.notify(Notification::Promoted {
                event_id: event_id.clone(),
                identity: head.identity.clone(),
                hold_id: hold.hold_id,
                expires_at: hold.expires_at,
            });

            promoted.push(Promotion {
                identity: head.identity,
                hold,
            });
        }

        Ok(promoted)
    }
}
