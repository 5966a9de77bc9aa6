use super::NewEvent;
use chrono::{DateTime, Utc};
use std::fmt;

/// Validation errors for a game publish request
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    ZeroCapacity,
    CutoffInPast(DateTime<Utc>),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::ZeroCapacity => {
                write!(f, "capacity must be at least 1 (omit it for unlimited)")
            }
            ValidationError::CutoffInPast(cutoff) => {
                write!(f, "rsvpCutoff {} is already in the past", cutoff.to_rfc3339())
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a game publish request.
///
/// Rules:
/// - capacity, when present, must be >= 1
/// - rsvpCutoff, when present, must not be before `now`
pub fn validate_new_event(spec: &NewEvent, now: DateTime<Utc>) -> Result<(), ValidationError> {
    if spec.capacity == Some(0) {
        return Err(ValidationError::ZeroCapacity);
    }

    if let Some(cutoff) = spec.rsvp_cutoff {
        if cutoff < now {
            return Err(ValidationError::CutoffInPast(cutoff));
        }
    }

    Ok(())
}
