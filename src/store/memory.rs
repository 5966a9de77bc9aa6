use super::AdmissionStore;
use crate::event::{Event, EventId, Hold, HoldId, HoldStatus, Identity, WaitlistEntry};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory store. State resets on restart.
pub struct MemoryStore {
    events: DashMap<EventId, Event>,
    holds: DashMap<HoldId, Hold>,
    /// The one ACTIVE hold per (game, identity)
    active: DashMap<(EventId, Identity), HoldId>,
    waitlists: DashMap<EventId, Vec<WaitlistEntry>>,
    next_sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            holds: DashMap::new(),
            active: DashMap::new(),
            waitlists: DashMap::new(),
            next_sequence: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionStore for MemoryStore {
    fn insert_event(&self, event: &Event) -> Result<()> {
        match self.events.entry(event.id.clone()) {
            Entry::Occupied(_) => bail!("event {} already exists", event.id),
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                Ok(())
            }
        }
    }

    fn load_event(&self, id: &EventId) -> Result<Option<Event>> {
        Ok(self.events.get(id).map(|e| e.clone()))
    }

    fn cas_save_event(&self, event: &Event, expected_version: u64) -> Result<bool> {
        let mut stored = self
            .events
            .get_mut(&event.id)
            .ok_or_else(|| anyhow!("event {} not found", event.id))?;

        if stored.version != expected_version {
            return Ok(false);
        }
        *stored = event.clone();
        Ok(true)
    }

    fn reserved_event_ids(&self) -> Result<Vec<EventId>> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.reserved > 0)
            .map(|e| e.id.clone())
            .collect())
    }

    fn waitlisted_event_ids(&self) -> Result<Vec<EventId>> {
        let mut ids: Vec<EventId> = self
            .waitlists
            .iter()
            .filter(|w| !w.is_empty())
            .map(|w| w.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn insert_hold(&self, hold: &Hold) -> Result<bool> {
        if !hold.is_active() {
            bail!("hold {} must be ACTIVE when inserted", hold.hold_id);
        }
        // The index slot stays locked while the record is written
        match self.active.entry((hold.event_id.clone(), hold.identity.clone())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                self.holds.insert(hold.hold_id, hold.clone());
                slot.insert(hold.hold_id);
                Ok(true)
            }
        }
    }

    fn update_hold(&self, hold: &Hold, expected: HoldStatus) -> Result<bool> {
        if hold.is_active() && expected != HoldStatus::Active {
            bail!("hold {} cannot return to ACTIVE", hold.hold_id);
        }

        let left_active = {
            let Some(mut stored) = self.holds.get_mut(&hold.hold_id) else {
                return Ok(false);
            };
            if stored.event_id != hold.event_id || stored.status != expected {
                return Ok(false);
            }
            stored.expires_at = hold.expires_at;
            stored.status = hold.status;
            stored.expiry_notified = hold.expiry_notified;
            expected == HoldStatus::Active && !stored.is_active()
        };

        if left_active {
            let key = (hold.event_id.clone(), hold.identity.clone());
            self.active.remove_if(&key, |_, id| *id == hold.hold_id);
        }
        Ok(true)
    }

    fn load_hold(&self, event_id: &EventId, hold_id: HoldId) -> Result<Option<Hold>> {
        Ok(self
            .holds
            .get(&hold_id)
            .filter(|h| &h.event_id == event_id)
            .map(|h| h.clone()))
    }

    fn find_active_hold(&self, event_id: &EventId, identity: &Identity) -> Result<Option<Hold>> {
        let key = (event_id.clone(), identity.clone());
        let Some(hold_id) = self.active.get(&key).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self
            .holds
            .get(&hold_id)
            .filter(|h| h.is_active())
            .map(|h| h.clone()))
    }

    fn active_holds(&self, event_id: &EventId) -> Result<Vec<Hold>> {
        let mut holds: Vec<Hold> = self
            .holds
            .iter()
            .filter(|h| h.is_active() && &h.event_id == event_id)
            .map(|h| h.clone())
            .collect();
        holds.sort_by_key(|h| h.hold_id);
        Ok(holds)
    }

    fn active_holds_expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<Hold>> {
        let mut holds: Vec<Hold> = self
            .holds
            .iter()
            .filter(|h| h.is_active() && h.expires_at < before)
            .map(|h| h.clone())
            .collect();
        holds.sort_by_key(|h| h.expires_at);
        Ok(holds)
    }

    fn load_waitlist(&self, event_id: &EventId) -> Result<Vec<WaitlistEntry>> {
        Ok(self
            .waitlists
            .get(event_id)
            .map(|w| w.clone())
            .unwrap_or_default())
    }

    fn enqueue_waitlist(
        &self,
        event_id: &EventId,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<Option<WaitlistEntry>> {
        // Sequence is taken under the shard lock so it is monotonic per game
        let mut queue = self.waitlists.entry(event_id.clone()).or_default();
        if queue.iter().any(|e| &e.identity == identity) {
            return Ok(None);
        }

        let entry = WaitlistEntry {
            event_id: event_id.clone(),
            identity: identity.clone(),
            enqueued_at: at,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
        };
        queue.push(entry.clone());
        Ok(Some(entry))
    }

    fn remove_waitlist(&self, event_id: &EventId, identity: &Identity) -> Result<bool> {
        let Some(mut queue) = self.waitlists.get_mut(event_id) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|e| &e.identity != identity);
        Ok(queue.len() != before)
    }
}
