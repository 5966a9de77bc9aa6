//! Admission persistence using SQLite.
//!
//! Participants are stored as a JSON column on the game row so a single
//! `UPDATE ... WHERE version = ?` covers the whole capacity aggregate.
//! Timestamps are fixed-width RFC 3339 with nanoseconds, so text comparison
//! orders them correctly.

use super::AdmissionStore;
use crate::event::{Event, EventId, Hold, HoldId, HoldStatus, Identity, WaitlistEntry};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Persists games, holds and waitlists in SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

type HoldRow = (String, String, String, String, String, String, bool);

const HOLD_COLUMNS: &str =
    "hold_id, event_id, identity, created_at, expires_at, status, expiry_notified";

impl SqliteStore {
    /// Opens (or creates) the SQLite database and ensures the tables exist.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open admission DB at {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("admission DB connection lock poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id               TEXT PRIMARY KEY,
                capacity         INTEGER,
                rsvp_cutoff      TEXT,
                waitlist_enabled INTEGER NOT NULL,
                participants     TEXT NOT NULL,
                reserved         INTEGER NOT NULL,
                version          INTEGER NOT NULL,
                created_at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS holds (
                hold_id         TEXT PRIMARY KEY,
                event_id        TEXT NOT NULL,
                identity        TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                expires_at      TEXT NOT NULL,
                status          TEXT NOT NULL,
                expiry_notified INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS holds_active
                ON holds (status, expires_at);
            CREATE UNIQUE INDEX IF NOT EXISTS holds_one_active
                ON holds (event_id, identity) WHERE status = 'ACTIVE';
            CREATE TABLE IF NOT EXISTS waitlist (
                sequence    INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id    TEXT NOT NULL,
                identity    TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                UNIQUE (event_id, identity)
            );",
        )
        .context("Failed to create admission tables")?;
        Ok(())
    }

    fn query_holds(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Hold>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("Failed to prepare hold query")?;
        let rows = stmt
            .query_map(args, read_hold_row)
            .context("Failed to query holds")?;

        let mut holds = Vec::new();
        for row in rows {
            holds.push(hold_from_row(row.context("Failed to read hold row")?)?);
        }
        Ok(holds)
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str, what: &str) -> Result<DateTime<Utc>> {
    raw.parse()
        .with_context(|| format!("Failed to parse {} timestamp '{}'", what, raw))
}

fn read_hold_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HoldRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn hold_from_row(row: HoldRow) -> Result<Hold> {
    let (hold_id, event_id, identity, created_at, expires_at, status, expiry_notified) = row;
    let uuid = Uuid::parse_str(&hold_id)
        .with_context(|| format!("Failed to parse hold id '{}'", hold_id))?;
    let status = HoldStatus::parse(&status)
        .ok_or_else(|| anyhow!("Unknown hold status '{}' for hold {}", status, hold_id))?;

    Ok(Hold {
        hold_id: HoldId::from_uuid(uuid),
        event_id: EventId::new(event_id),
        identity: Identity::new(identity),
        created_at: parse_ts(&created_at, "hold created_at")?,
        expires_at: parse_ts(&expires_at, "hold expires_at")?,
        status,
        expiry_notified,
    })
}

impl AdmissionStore for SqliteStore {
    fn insert_event(&self, event: &Event) -> Result<()> {
        let participants =
            serde_json::to_string(&event.participants).context("Failed to encode participants")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events
                (id, capacity, rsvp_cutoff, waitlist_enabled, participants, reserved, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id.as_str(),
                event.capacity,
                event.rsvp_cutoff.map(ts),
                event.waitlist_enabled,
                participants,
                event.reserved,
                event.version as i64,
                ts(event.created_at),
            ],
        )
        .with_context(|| format!("Failed to insert event {}", event.id))?;
        Ok(())
    }

    fn load_event(&self, id: &EventId) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT capacity, rsvp_cutoff, waitlist_enabled, participants, reserved, version, created_at
                   FROM events WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    let capacity: Option<u32> = row.get(0)?;
                    let rsvp_cutoff: Option<String> = row.get(1)?;
                    let waitlist_enabled: bool = row.get(2)?;
                    let participants: String = row.get(3)?;
                    let reserved: u32 = row.get(4)?;
                    let version: i64 = row.get(5)?;
                    let created_at: String = row.get(6)?;
                    Ok((
                        capacity,
                        rsvp_cutoff,
                        waitlist_enabled,
                        participants,
                        reserved,
                        version,
                        created_at,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("Failed to load event {}", id))?;

        let Some((capacity, rsvp_cutoff, waitlist_enabled, participants, reserved, version, created_at)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(Event {
            id: id.clone(),
            capacity,
            rsvp_cutoff: rsvp_cutoff
                .as_deref()
                .map(|raw| parse_ts(raw, "rsvp_cutoff"))
                .transpose()?,
            waitlist_enabled,
            participants: serde_json::from_str(&participants)
                .with_context(|| format!("Failed to decode participants of event {}", id))?,
            reserved,
            version: version as u64,
            created_at: parse_ts(&created_at, "event created_at")?,
        }))
    }

    fn cas_save_event(&self, event: &Event, expected_version: u64) -> Result<bool> {
        let participants =
            serde_json::to_string(&event.participants).context("Failed to encode participants")?;
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE events
                    SET capacity = ?1, rsvp_cutoff = ?2, waitlist_enabled = ?3,
                        participants = ?4, reserved = ?5, version = ?6
                  WHERE id = ?7 AND version = ?8",
                params![
                    event.capacity,
                    event.rsvp_cutoff.map(ts),
                    event.waitlist_enabled,
                    participants,
                    event.reserved,
                    event.version as i64,
                    event.id.as_str(),
                    expected_version as i64,
                ],
            )
            .with_context(|| format!("Failed to save event {}", event.id))?;

        if updated == 1 {
            return Ok(true);
        }

        // Distinguish a version conflict from a missing row
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1)",
                params![event.id.as_str()],
                |row| row.get(0),
            )
            .context("Failed to check event existence")?;
        if !exists {
            return Err(anyhow!("event {} not found", event.id));
        }
        Ok(false)
    }

    fn reserved_event_ids(&self) -> Result<Vec<EventId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM events WHERE reserved > 0 ORDER BY id")
            .context("Failed to prepare reserved events query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query reserved events")?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(EventId::new(row.context("Failed to read event id")?));
        }
        Ok(ids)
    }

    fn waitlisted_event_ids(&self) -> Result<Vec<EventId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT event_id FROM waitlist ORDER BY event_id")
            .context("Failed to prepare waitlisted events query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query waitlisted events")?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(EventId::new(row.context("Failed to read event id")?));
        }
        Ok(ids)
    }

    fn insert_hold(&self, hold: &Hold) -> Result<bool> {
        if !hold.is_active() {
            return Err(anyhow!("hold {} must be ACTIVE when inserted", hold.hold_id));
        }
        let conn = self.conn()?;
        // holds_one_active turns a second ACTIVE hold into a no-op
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO holds
                    (hold_id, event_id, identity, created_at, expires_at, status, expiry_notified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    hold.hold_id.to_string(),
                    hold.event_id.as_str(),
                    hold.identity.as_str(),
                    ts(hold.created_at),
                    ts(hold.expires_at),
                    hold.status.as_str(),
                    hold.expiry_notified,
                ],
            )
            .with_context(|| format!("Failed to insert hold {}", hold.hold_id))?;
        Ok(inserted == 1)
    }

    fn update_hold(&self, hold: &Hold, expected: HoldStatus) -> Result<bool> {
        if hold.is_active() && expected != HoldStatus::Active {
            return Err(anyhow!("hold {} cannot return to ACTIVE", hold.hold_id));
        }
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE holds
                    SET expires_at = ?1, status = ?2, expiry_notified = ?3
                  WHERE hold_id = ?4 AND event_id = ?5 AND status = ?6",
                params![
                    ts(hold.expires_at),
                    hold.status.as_str(),
                    hold.expiry_notified,
                    hold.hold_id.to_string(),
                    hold.event_id.as_str(),
                    expected.as_str(),
                ],
            )
            .with_context(|| format!("Failed to update hold {}", hold.hold_id))?;
        Ok(updated == 1)
    }

    fn load_hold(&self, event_id: &EventId, hold_id: HoldId) -> Result<Option<Hold>> {
        let sql = format!(
            "SELECT {} FROM holds WHERE hold_id = ?1 AND event_id = ?2",
            HOLD_COLUMNS
        );
        let holds = self.query_holds(&sql, &[&hold_id.to_string(), &event_id.as_str()])?;
        Ok(holds.into_iter().next())
    }

    fn find_active_hold(&self, event_id: &EventId, identity: &Identity) -> Result<Option<Hold>> {
        let sql = format!(
            "SELECT {} FROM holds WHERE event_id = ?1 AND identity = ?2 AND status = 'ACTIVE'",
            HOLD_COLUMNS
        );
        let holds = self.query_holds(&sql, &[&event_id.as_str(), &identity.as_str()])?;
        Ok(holds.into_iter().next())
    }

    fn active_holds(&self, event_id: &EventId) -> Result<Vec<Hold>> {
        let sql = format!(
            "SELECT {} FROM holds WHERE event_id = ?1 AND status = 'ACTIVE' ORDER BY hold_id",
            HOLD_COLUMNS
        );
        self.query_holds(&sql, &[&event_id.as_str()])
    }

    fn active_holds_expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<Hold>> {
        let sql = format!(
            "SELECT {} FROM holds WHERE status = 'ACTIVE' AND expires_at < ?1 ORDER BY expires_at",
            HOLD_COLUMNS
        );
        self.query_holds(&sql, &[&ts(before)])
    }

    fn load_waitlist(&self, event_id: &EventId) -> Result<Vec<WaitlistEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT sequence, identity, enqueued_at FROM waitlist
                  WHERE event_id = ?1 ORDER BY sequence ASC",
            )
            .context("Failed to prepare waitlist query")?;
        let rows = stmt
            .query_map(params![event_id.as_str()], |row| {
                let sequence: i64 = row.get(0)?;
                let identity: String = row.get(1)?;
                let enqueued_at: String = row.get(2)?;
                Ok((sequence, identity, enqueued_at))
            })
            .context("Failed to query waitlist")?;

        let mut entries = Vec::new();
        for row in rows {
            let (sequence, identity, enqueued_at) = row.context("Failed to read waitlist row")?;
            entries.push(WaitlistEntry {
                event_id: event_id.clone(),
                identity: Identity::new(identity),
                enqueued_at: parse_ts(&enqueued_at, "waitlist enqueued_at")?,
                sequence: sequence as u64,
            });
        }
        Ok(entries)
    }

    fn enqueue_waitlist(
        &self,
        event_id: &EventId,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<Option<WaitlistEntry>> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO waitlist (event_id, identity, enqueued_at) VALUES (?1, ?2, ?3)",
                params![event_id.as_str(), identity.as_str(), ts(at)],
            )
            .context("Failed to enqueue waitlist entry")?;

        if inserted == 0 {
            return Ok(None);
        }

        Ok(Some(WaitlistEntry {
            event_id: event_id.clone(),
            identity: identity.clone(),
            enqueued_at: at,
            sequence: conn.last_insert_rowid() as u64,
        }))
    }

    fn remove_waitlist(&self, event_id: &EventId, identity: &Identity) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM waitlist WHERE event_id = ?1 AND identity = ?2",
                params![event_id.as_str(), identity.as_str()],
            )
            .context("Failed to remove waitlist entry")?;
        Ok(removed > 0)
    }
}
