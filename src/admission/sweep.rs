use super::cas::Decision;
use super::{AdmissionEngine, AdmissionError};
use crate::config::SweepConfig;
use crate::event::{EventId, HoldId, HoldStatus};
use crate::notify::Notification;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one sweep pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired: usize,
    pub expiring_notices: usize,
    /// Games whose `reserved` count was corrected
    pub reconciled: usize,
    pub promoted: usize,
    /// Games skipped after an error; retried next pass
    pub failed_games: usize,
}

impl SweepReport {
    fn absorb(&mut self, game: SweepReport) {
        self.expired += game.expired;
        self.reconciled += game.reconciled;
        self.promoted += game.promoted;
    }
}

/// Clears the single-flight flag when the sweep ends, including on panic.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AdmissionEngine {
    /// Expire lapsed holds, reconcile reservations and promote into freed units.
    ///
    /// Returns `None` without doing anything if a sweep is already running.
    pub fn sweep(&self) -> Result<Option<SweepReport>, AdmissionError> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sweep already in progress, skipping");
            return Ok(None);
        }
        let _running = Running(&self.sweeping);

        let report = self.sweep_once()?;
        self.metrics.record_sweep();
        Ok(Some(report))
    }

    fn sweep_once(&self) -> Result<SweepReport, AdmissionError> {
        let now = self.clock.now();
        let mut report = SweepReport {
            expiring_notices: self.send_expiring_notices(now)?,
            ..SweepReport::default()
        };

        let mut games: BTreeMap<EventId, Vec<HoldId>> = BTreeMap::new();
        for hold in self.store.active_holds_expiring_before(now)? {
            games.entry(hold.event_id).or_default().push(hold.hold_id);
        }
        for event_id in self.store.reserved_event_ids()? {
            games.entry(event_id).or_default();
        }
        // A unit can free up without a hold lapsing, so queued games are
        // always offered whatever room they have
        for event_id in self.store.waitlisted_event_ids()? {
            games.entry(event_id).or_default();
        }

        for (event_id, hold_ids) in games {
            let result = self
                .locks
                .with(&event_id, || self.sweep_game_locked(&event_id, &hold_ids, now));
            match result {
                Ok(game) => report.absorb(game),
                Err(e) => {
                    error!(event_id = %event_id, error = %e, "Sweep failed for game");
                    report.failed_games += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                notices = report.expiring_notices,
                reconciled = report.reconciled,
                promoted = report.promoted,
                failed = report.failed_games,
                "Sweep complete"
            );
        }
        Ok(report)
    }

    fn sweep_game_locked(
        &self,
        event_id: &EventId,
        hold_ids: &[HoldId],
        now: DateTime<Utc>,
    ) -> Result<SweepReport, AdmissionError> {
        let mut report = SweepReport::default();

        for hold_id in hold_ids {
            let Some(hold) = self.store.load_hold(event_id, *hold_id)? else {
                continue;
            };
            // Confirmed, cancelled or renewed since the scan
            if !hold.is_active() || !hold.is_expired_at(now) {
                continue;
            }
            if self.expire_locked(hold)? {
                report.expired += 1;
            }
        }

        if self.reconcile_locked(event_id)? {
            report.reconciled += 1;
        }

        report.promoted = self.promote_locked(event_id, usize::MAX)?.len();
        Ok(report)
    }

    /// Sets `reserved` to the number of persisted ACTIVE holds, never above
    /// what capacity leaves after confirmed participants.
    fn reconcile_locked(&self, event_id: &EventId) -> Result<bool, AdmissionError> {
        let event = self.load_required(event_id)?;
        let active = self.store.active_holds(event_id)?.len() as u32;

        let corrected = self.update_event(event, |current| {
            let ceiling = current
                .capacity
                .map_or(active, |c| c.saturating_sub(current.participant_count()));
            let target = active.min(ceiling);
            if current.reserved == target {
                return Decision::Abort(None);
            }
            let mut next = current.clone();
            next.reserved = target;
            Decision::Commit(next, Some((current.reserved, target)))
        })?;

        match corrected {
            Some((from, to)) => {
                warn!(event_id = %event_id, from, to, "Reconciled reserved units");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One notice per hold entering the expiring window.
    fn send_expiring_notices(&self, now: DateTime<Utc>) -> Result<usize, AdmissionError> {
        if self.settings.expiring_notice <= chrono::Duration::zero() {
            return Ok(0);
        }

        let horizon = now + self.settings.expiring_notice;
        let mut sent = 0;

        for hold in self.store.active_holds_expiring_before(horizon)? {
            if hold.expiry_notified || hold.is_expired_at(now) {
                continue;
            }

            let result = self.locks.with(&hold.event_id, || -> Result<bool, AdmissionError> {
                let Some(mut current) = self.store.load_hold(&hold.event_id, hold.hold_id)? else {
                    return Ok(false);
                };
                if !current.is_active() || current.expiry_notified || current.expires_at >= horizon {
                    return Ok(false);
                }
                current.expiry_notified = true;
                if !self.store.update_hold(&current, HoldStatus::Active)? {
                    return Ok(false);
                }
                self.notify(Notification::HoldExpiring {
                    event_id: current.event_id.clone(),
                    identity: current.identity.clone(),
                    hold_id: current.hold_id,
                    expires_at: current.expires_at,
                });
                Ok(true)
            });

            match result {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(hold_id = %hold.hold_id, error = %e, "Failed to send expiring notice")
                }
            }
        }

        Ok(sent)
    }
}

/// Drives [`AdmissionEngine::sweep`] on a fixed interval
pub struct HoldSweeper {
    engine: Arc<AdmissionEngine>,
    config: SweepConfig,
}

impl HoldSweeper {
    pub fn new(engine: Arc<AdmissionEngine>, config: SweepConfig) -> Self {
        Self { engine, config }
    }

    /// Run background sweep loop
    ///
    /// Failed passes are logged and retried on the next tick from persisted state.
    /// This function runs indefinitely until the task is cancelled.
    pub async fn run_sweep_loop(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Hold sweeper disabled, exiting loop");
            return Ok(());
        }

        info!(
            interval_seconds = self.config.interval_seconds,
            "Starting hold sweeper"
        );

        let mut timer = interval(Duration::from_secs(self.config.interval_seconds.max(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            timer.tick().await;

            let engine = Arc::clone(&self.engine);
            match tokio::task::spawn_blocking(move || engine.sweep()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Hold sweep failed"),
                Err(e) => error!(error = %e, "Hold sweep task panicked"),
            }
        }
    }
}
