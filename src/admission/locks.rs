use crate::event::EventId;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

/// One critical section per game.
///
/// Different games never contend. The map shard lock is released before the
/// per-game mutex is taken.
#[derive(Default)]
pub struct EventLocks {
    locks: DashMap<EventId, Arc<Mutex<()>>>,
}

impl EventLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, event_id: &EventId) -> Arc<Mutex<()>> {
        self.locks
            .entry(event_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `f` while holding the game's lock.
    pub fn with<T>(&self, event_id: &EventId, f: impl FnOnce() -> T) -> T {
        let lock = self.handle(event_id);
        // The mutex guards no data, so a poisoned lock is still usable
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
