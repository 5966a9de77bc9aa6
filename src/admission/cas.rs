//! Load-decide-CAS driver.
//!
//! `decide` is a pure function of the aggregate it is handed. On a version
//! conflict the aggregate is reloaded and `decide` runs again, up to
//! `max_attempts` times in total.

use super::AdmissionError;
use crate::event::Event;
use anyhow::Result;
use tracing::debug;

/// Aggregates carrying an optimistic concurrency token.
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

impl Versioned for Event {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// What `decide` wants done with the aggregate it saw.
pub enum Decision<A, T> {
    /// Persist the new aggregate, then return the value
    Commit(A, T),
    /// Return the value without writing
    Abort(T),
}

/// Runs `decide` against `initial`, persisting with `save(next, expected_version)`.
///
/// `save` returns `Ok(false)` when the stored version moved on. After
/// `max_attempts` conflicts the call fails with `AdmissionError::Contention`.
pub fn run<A, T>(
    max_attempts: u32,
    initial: A,
    mut load: impl FnMut() -> Result<A>,
    mut decide: impl FnMut(&A) -> Decision<A, T>,
    mut save: impl FnMut(&A, u64) -> Result<bool>,
) -> Result<T, AdmissionError>
where
    A: Versioned,
{
    let max_attempts = max_attempts.max(1);
    let mut current = initial;

    for attempt in 1..=max_attempts {
        match decide(&current) {
            Decision::Abort(value) => return Ok(value),
            Decision::Commit(mut next, value) => {
                let expected = current.version();
                next.set_version(expected + 1);
                if save(&next, expected)? {
                    return Ok(value);
                }
                debug!(attempt, expected_version = expected, "Version conflict");
                if attempt < max_attempts {
                    current = load()?;
                }
            }
        }
    }

    Err(AdmissionError::Contention {
        attempts: max_attempts,
    })
}
