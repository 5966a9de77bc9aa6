use crate::event::{EventId, HoldId, Identity};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Admission notifications delivered to users out of band.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Notification {
    /// A waitlisted identity received a hold
    Promoted {
        event_id: EventId,
        identity: Identity,
        hold_id: HoldId,
        expires_at: DateTime<Utc>,
    },
    HoldExpiring {
        event_id: EventId,
        identity: Identity,
        hold_id: HoldId,
        expires_at: DateTime<Utc>,
    },
    HoldExpired {
        event_id: EventId,
        identity: Identity,
        hold_id: HoldId,
    },
    ParticipantJoined {
        event_id: EventId,
        identity: Identity,
    },
    ParticipantLeft {
        event_id: EventId,
        identity: Identity,
    },
    WaitlistJoined {
        event_id: EventId,
        identity: Identity,
        position: usize,
    },
    /// `remaining_slots` is absent for games without a capacity limit
    CapacityUpdate {
        event_id: EventId,
        remaining_slots: Option<u32>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Promoted { .. } => "promoted",
            Notification::HoldExpiring { .. } => "hold_expiring",
            Notification::HoldExpired { .. } => "hold_expired",
            Notification::ParticipantJoined { .. } => "participant_joined",
            Notification::ParticipantLeft { .. } => "participant_left",
            Notification::WaitlistJoined { .. } => "waitlist_joined",
            Notification::CapacityUpdate { .. } => "capacity_update",
        }
    }

    pub fn event_id(&self) -> &EventId {
        match self {
            Notification::Promoted { event_id, .. }
            | Notification::HoldExpiring { event_id, .. }
            | Notification::HoldExpired { event_id, .. }
            | Notification::ParticipantJoined { event_id, .. }
            | Notification::ParticipantLeft { event_id, .. }
            | Notification::WaitlistJoined { event_id, .. }
            | Notification::CapacityUpdate { event_id, .. } => event_id,
        }
    }
}

/// Fire-and-forget delivery. Errors are logged by the caller and never
/// undo admission state.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<()>;
}

/// Sink publishing to an in-process broadcast channel.
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, notification: Notification) -> Result<()> {
        // No subscribers is fine
        let _ = self.tx.send(notification);
        Ok(())
    }
}

/// Logs every notification until the channel closes.
pub async fn run_notification_log(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                info!(
                    kind = notification.kind(),
                    event_id = %notification.event_id(),
                    "Notification dispatched"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Notification log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();

        sink.notify(Notification::ParticipantJoined {
            event_id: EventId::from("game-1"),
            identity: Identity::from("alice"),
        })
        .unwrap();

        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind(), "participant_joined");
        assert_eq!(received.event_id(), &EventId::from("game-1"));
    }

    #[test]
    fn test_broadcast_sink_without_subscribers_is_ok() {
        let sink = BroadcastSink::new(16);
        assert!(sink
            .notify(Notification::CapacityUpdate {
                event_id: EventId::from("game-1"),
                remaining_slots: Some(3),
            })
            .is_ok());
    }

    #[test]
    fn test_notification_wire_format() {
        let json = serde_json::to_value(Notification::CapacityUpdate {
            event_id: EventId::from("game-1"),
            remaining_slots: Some(2),
        })
        .unwrap();

        assert_eq!(json["type"], "capacity_update");
        assert_eq!(json["eventId"], "game-1");
        assert_eq!(json["remainingSlots"], 2);
    }
}
