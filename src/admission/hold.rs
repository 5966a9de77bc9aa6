use super::cas::Decision;
use super::{
    AdmissionEngine, AdmissionError, CancelOutcome, ConfirmOutcome, HoldOutcome, RejectReason,
};
use crate::event::{Event, EventId, Hold, HoldId, HoldStatus, Identity, Participant};
use crate::notify::Notification;
use chrono::Duration;
use tracing::{debug, info, warn};

/// Result of taking one unit for an identity.
pub(crate) enum Reservation {
    Held(Hold),
    NoRoom,
    /// Another writer recorded an ACTIVE hold for the identity first.
    AlreadyHeld,
}

impl AdmissionEngine {
    /// Reserve one unit for `identity` until `now + ttl`.
    ///
    /// An identity that already has an ACTIVE hold gets it renewed instead.
    pub fn issue_hold(
        &self,
        event_id: &EventId,
        identity: &Identity,
        ttl: Option<Duration>,
    ) -> Result<HoldOutcome, AdmissionError> {
        let outcome = self.locks.with(event_id, || -> Result<_, AdmissionError> {
            let Some(mut event) = self.store.load_event(event_id)? else {
                return Ok(HoldOutcome::Rejected(RejectReason::NotFound));
            };
            if event.is_participant(identity) {
                return Ok(HoldOutcome::Rejected(RejectReason::AlreadyParticipant));
            }

            let now = self.clock.now();
            if event.cutoff_passed(now) {
                return Ok(HoldOutcome::Rejected(RejectReason::CutoffPassed));
            }
            let ttl = self.settings.clamp_ttl(ttl);

            if let Some(existing) = self.store.find_active_hold(event_id, identity)? {
                if !existing.is_expired_at(now) {
                    let mut renewed = existing;
                    renewed.expires_at = now + ttl;
                    renewed.expiry_notified = false;
                    if self.store.update_hold(&renewed, HoldStatus::Active)? {
                        info!(
                            event_id = %event_id,
                            identity = %identity,
                            hold_id = %renewed.hold_id,
                            expires_at = %renewed.expires_at,
                            "Hold renewed"
                        );
                        return Ok(HoldOutcome::Issued {
                            hold: renewed,
                            renewed: true,
                        });
                    }
                    debug!(
                        event_id = %event_id,
                        hold_id = %renewed.hold_id,
                        "Hold left ACTIVE before renewal, reserving afresh"
                    );
                } else {
                    // Lapsed but not yet swept: the unit goes back to the queue first
                    self.expire_locked(existing)?;
                    self.promote_locked(event_id, 1)?;
                }
                event = self.load_required(event_id)?;
            }

            let hold = match self.reserve_locked(event, identity, ttl)? {
                Reservation::Held(hold) => hold,
                Reservation::NoRoom => return Ok(HoldOutcome::Rejected(RejectReason::Full)),
                Reservation::AlreadyHeld => {
                    return Ok(HoldOutcome::Rejected(RejectReason::AlreadyParticipant))
                }
            };

            // Reserving directly takes the identity off the waitlist
            if self.store.remove_waitlist(event_id, identity)? {
                debug!(event_id = %event_id, identity = %identity, "Waitlist entry superseded by hold");
            }

            info!(
                event_id = %event_id,
                identity = %identity,
                hold_id = %hold.hold_id,
                expires_at = %hold.expires_at,
                "Hold issued"
            );
            Ok(HoldOutcome::Issued {
                hold,
                renewed: false,
            })
        })?;

        if let HoldOutcome::Rejected(_) = outcome {
            self.metrics.record_rejected();
        }
        Ok(outcome)
    }

    /// Turn an ACTIVE hold into a confirmed participation.
    ///
    /// The hold leaves ACTIVE first, so a racing cancel or expiry can never
    /// free the same unit a second time.
    pub fn confirm_hold(
        &self,
        event_id: &EventId,
        hold_id: HoldId,
        identity: &Identity,
    ) -> Result<ConfirmOutcome, AdmissionError> {
        let outcome = self.locks.with(event_id, || -> Result<_, AdmissionError> {
            let Some(hold) = self.store.load_hold(event_id, hold_id)? else {
                return Ok(ConfirmOutcome::NotFound);
            };
            if &hold.identity != identity {
                return Ok(ConfirmOutcome::IdentityMismatch);
            }

            match hold.status {
                HoldStatus::Confirmed => return self.finish_confirmed_locked(hold),
                HoldStatus::Expired | HoldStatus::Cancelled => return Ok(ConfirmOutcome::Expired),
                HoldStatus::Active => {}
            }

            if hold.is_expired_at(self.clock.now()) {
                if self.expire_locked(hold)? {
                    self.promote_locked(event_id, 1)?;
                }
                return Ok(ConfirmOutcome::Expired);
            }

            let mut confirmed = hold;
            confirmed.status = HoldStatus::Confirmed;
            if !self.store.update_hold(&confirmed, HoldStatus::Active)? {
                return match self.store.load_hold(event_id, hold_id)? {
                    Some(current) if current.status == HoldStatus::Confirmed => {
                        self.finish_confirmed_locked(current)
                    }
                    _ => Ok(ConfirmOutcome::Expired),
                };
            }
            self.finish_confirmed_locked(confirmed)
        })?;

        if outcome == ConfirmOutcome::Confirmed {
            self.metrics.record_hold_confirmed();
        }
        Ok(outcome)
    }

    /// Seats the identity behind a CONFIRMED hold.
    ///
    /// A CONFIRMED hold whose identity is already seated is done. Otherwise
    /// its unit is still counted in `reserved` unless the sweep already
    /// reconciled it away, in which case it needs a free seat.
    fn finish_confirmed_locked(&self, hold: Hold) -> Result<ConfirmOutcome, AdmissionError> {
        let event_id = hold.event_id.clone();
        let Some(event) = self.store.load_event(&event_id)? else {
            return Ok(ConfirmOutcome::NotFound);
        };
        if event.is_participant(&hold.identity) {
            return Ok(ConfirmOutcome::Confirmed);
        }

        let active = self.store.active_holds(&event_id)?.len() as u32;
        let now = self.clock.now();
        let seated = self.update_event(event, |current| {
            if current.is_participant(&hold.identity) {
                return Decision::Abort(true);
            }
            let mut next = current.clone();
            if next.reserved > active {
                next.reserved -= 1;
            } else if !next.has_room() {
                return Decision::Abort(false);
            }
            next.participants.push(Participant {
                identity: hold.identity.clone(),
                joined_at: now,
            });
            Decision::Commit(next, true)
        })?;

        if !seated {
            // The unit behind this hold was already given away
            warn!(
                event_id = %event_id,
                hold_id = %hold.hold_id,
                "Hold had no reserved unit left, expiring it"
            );
            let mut expired = hold;
            expired.status = HoldStatus::Expired;
            self.store.update_hold(&expired, HoldStatus::Confirmed)?;
            return Ok(ConfirmOutcome::Expired);
        }

        info!(
            event_id = %event_id,
            identity = %hold.identity,
            hold_id = %hold.hold_id,
            "Hold confirmed"
        );
        self.notify(Notification::ParticipantJoined {
            event_id,
            identity: hold.identity,
        });
        Ok(ConfirmOutcome::Confirmed)
    }

    /// Release an ACTIVE hold and offer its unit to the waitlist.
    pub fn cancel_hold(
        &self,
        event_id: &EventId,
        hold_id: HoldId,
    ) -> Result<CancelOutcome, AdmissionError> {
        self.locks.with(event_id, || -> Result<_, AdmissionError> {
            let Some(hold) = self.store.load_hold(event_id, hold_id)? else {
                return Ok(CancelOutcome::NotFound);
            };
            if !hold.is_active() {
                return Ok(CancelOutcome::NotActive(hold.status));
            }

            if !self.release_locked(hold, HoldStatus::Cancelled)? {
                let status = self
                    .store
                    .load_hold(event_id, hold_id)?
                    .map_or(HoldStatus::Cancelled, |current| current.status);
                return Ok(CancelOutcome::NotActive(status));
            }
            self.metrics.record_hold_cancelled();
            info!(event_id = %event_id, hold_id = %hold_id, "Hold cancelled");

            let promoted = self.promote_locked(event_id, 1)?;
            Ok(CancelOutcome::Cancelled { promoted })
        })
    }

    pub fn hold(&self, event_id: &EventId, hold_id: HoldId) -> Result<Option<Hold>, AdmissionError> {
        Ok(self.store.load_hold(event_id, hold_id)?)
    }

    /// Takes one unit from `event` and records an ACTIVE hold for it.
    ///
    /// The aggregate is written before the hold. When the hold insert loses
    /// to another writer the unit is handed back; any other failed hold
    /// write leaves an over-counted `reserved` for the sweep to reconcile.
    pub(crate) fn reserve_locked(
        &self,
        event: Event,
        identity: &Identity,
        ttl: Duration,
    ) -> Result<Reservation, AdmissionError> {
        let reserved = self.update_event(event, |current| {
            if !current.has_room() {
                return Decision::Abort(None);
            }
            let mut next = current.clone();
            next.reserved += 1;
            Decision::Commit(next.clone(), Some(next))
        })?;
        let Some(next) = reserved else {
            return Ok(Reservation::NoRoom);
        };

        let now = self.clock.now();
        let hold = Hold {
            hold_id: HoldId::generate(),
            event_id: next.id.clone(),
            identity: identity.clone(),
            created_at: now,
            expires_at: now + ttl,
            status: HoldStatus::Active,
            expiry_notified: false,
        };
        if !self.store.insert_hold(&hold)? {
            warn!(
                event_id = %hold.event_id,
                identity = %identity,
                "Identity already holds a unit, returning the reserved one"
            );
            self.return_unit(&hold.event_id)?;
            return Ok(Reservation::AlreadyHeld);
        }
        self.metrics.record_hold_issued();
        self.notify_capacity(&next);

        Ok(Reservation::Held(hold))
    }

    /// Moves an ACTIVE hold to `status` and frees its unit.
    ///
    /// Returns false when the stored hold had already left ACTIVE; nothing
    /// is freed then. The hold is written before the aggregate, so a failed
    /// aggregate write leaves an over-counted `reserved` for the sweep.
    pub(crate) fn release_locked(&self, hold: Hold, status: HoldStatus) -> Result<bool, AdmissionError> {
        let mut hold = hold;
        hold.status = status;
        if !self.store.update_hold(&hold, HoldStatus::Active)? {
            debug!(
                event_id = %hold.event_id,
                hold_id = %hold.hold_id,
                "Hold already left ACTIVE"
            );
            return Ok(false);
        }

        if !self.return_unit(&hold.event_id)? {
            warn!(
                event_id = %hold.event_id,
                hold_id = %hold.hold_id,
                "Released hold had no reserved unit"
            );
        }
        Ok(true)
    }

    /// Gives one reserved unit back to the free pool.
    fn return_unit(&self, event_id: &EventId) -> Result<bool, AdmissionError> {
        let event = self.load_required(event_id)?;
        let released = self.update_event(event, |current| {
            if current.reserved == 0 {
                return Decision::Abort(None);
            }
            let mut next = current.clone();
            next.reserved -= 1;
            Decision::Commit(next.clone(), Some(next))
        })?;

        match released {
            Some(next) => {
                self.notify_capacity(&next);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Marks a lapsed hold EXPIRED and frees its unit. Promotion is up to the caller.
    ///
    /// Returns false when another writer moved the hold first.
    pub(crate) fn expire_locked(&self, hold: Hold) -> Result<bool, AdmissionError> {
        let event_id = hold.event_id.clone();
        let identity = hold.identity.clone();
        let hold_id = hold.hold_id;

        if !self.release_locked(hold, HoldStatus::Expired)? {
            return Ok(false);
        }
        self.metrics.record_hold_expired();

        info!(event_id = %event_id, identity = %identity, hold_id = %hold_id, "Hold expired");
        self.notify(Notification::HoldExpired {
            event_id,
            identity,
            hold_id,
        });
        Ok(true)
    }
}
