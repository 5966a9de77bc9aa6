use super::{EventId, Identity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Hold identifier (UUIDv7, time-ordered).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HoldId(Uuid);

impl HoldId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    Active,
    Confirmed,
    Expired,
    Cancelled,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "ACTIVE",
            HoldStatus::Confirmed => "CONFIRMED",
            HoldStatus::Expired => "EXPIRED",
            HoldStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(HoldStatus::Active),
            "CONFIRMED" => Some(HoldStatus::Confirmed),
            "EXPIRED" => Some(HoldStatus::Expired),
            "CANCELLED" => Some(HoldStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-boxed provisional reservation of one capacity unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    #[serde(rename = "holdId")]
    pub hold_id: HoldId,
    #[serde(rename = "eventId")]
    pub event_id: EventId,
    pub identity: Identity,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    pub status: HoldStatus,

    /// Set once the "expiring soon" notice has gone out
    #[serde(rename = "expiryNotified")]
    pub expiry_notified: bool,
}

impl Hold {
    pub fn is_active(&self) -> bool {
        self.status == HoldStatus::Active
    }

    /// A hold may still be confirmed at exactly `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
