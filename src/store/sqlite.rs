//! SQLite-backed appointment store.
//!
//! One database file, two tables: `appointments` and their
//! `appointment_offsets` sub-records. A derived `fires_at` column holds the
//! UTC resolution of the local deadline so `list_future` stays a single
//! indexed query.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{Connection, OptionalExtension, params};

use super::{AppointmentStore, StoreError};
use crate::appointment::{Appointment, AppointmentDraft, AppointmentId};
use crate::recurrence::resolve_local;
use crate::repetition::Repetition;

/// Wire format for local date-times in the `local_date` column.
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Complete DDL for the appointment database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS appointments (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    title      TEXT NOT NULL,
    local_date TEXT NOT NULL,     -- wall clock, %Y-%m-%dT%H:%M:%S
    timezone   TEXT NOT NULL,     -- IANA identifier
    repetition TEXT NOT NULL,     -- compact rule id ("o", "d2", ...)
    community  TEXT NOT NULL,
    fires_at   INTEGER NOT NULL   -- UTC epoch seconds of local_date
);

CREATE INDEX IF NOT EXISTS idx_appointments_fires_at ON appointments(fires_at);

CREATE TABLE IF NOT EXISTS appointment_offsets (
    appointment_id INTEGER NOT NULL,
    offset_secs    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offsets_appointment ON appointment_offsets(appointment_id);
"#;

/// SQLite-backed appointment store.
///
/// Thread-safe via an internal `Mutex<Connection>`; all access is
/// serialized, which also gives the engine the one-writer-per-id guarantee
/// it relies on.
pub struct SqliteAppointmentStore {
    conn: Mutex<Connection>,
}

impl SqliteAppointmentStore {
    /// Open (or create) the database at `path`, applying the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a throwaway in-memory database. For tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Acquire the connection mutex.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }
}

impl AppointmentStore for SqliteAppointmentStore {
    fn create(&self, draft: &AppointmentDraft) -> Result<AppointmentId, StoreError> {
        let fires_at = utc_epoch(draft.date, draft.timezone)?;
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO appointments (title, local_date, timezone, repetition, community, fires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                draft.title,
                draft.date.format(DATE_FORMAT).to_string(),
                draft.timezone.name(),
                draft.repetition.id(),
                draft.community,
                fires_at,
            ],
        )?;
        let id = tx.last_insert_rowid();

        for offset in &draft.offsets {
            tx.execute(
                "INSERT INTO appointment_offsets (appointment_id, offset_secs) VALUES (?1, ?2)",
                params![id, offset.num_seconds()],
            )?;
        }

        tx.commit()?;
        Ok(id)
    }

    fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, local_date, timezone, repetition, community \
             FROM appointments WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_raw)?;

        match rows.next() {
            Some(raw) => {
                let appt = raw?.into_appointment(load_offsets(&conn, id)?)?;
                Ok(Some(appt))
            }
            None => Ok(None),
        }
    }

    fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        self.select_many("SELECT id, title, local_date, timezone, repetition, community \
             FROM appointments ORDER BY fires_at", None)
    }

    fn list_future(&self, now: DateTime<Utc>) -> Result<Vec<Appointment>, StoreError> {
        self.select_many(
            "SELECT id, title, local_date, timezone, repetition, community \
             FROM appointments WHERE fires_at > ?1 ORDER BY fires_at",
            Some(now.timestamp()),
        )
    }

    fn update_date(&self, id: AppointmentId, new_date: NaiveDateTime) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tz_str: Option<String> = conn
            .query_row(
                "SELECT timezone FROM appointments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let tz_str = tz_str.ok_or(StoreError::NotFound(id))?;
        let tz = parse_timezone(&tz_str)?;
        let fires_at = utc_epoch(new_date, tz)?;

        conn.execute(
            "UPDATE appointments SET local_date = ?1, fires_at = ?2 WHERE id = ?3",
            params![new_date.format(DATE_FORMAT).to_string(), fires_at, id],
        )?;
        Ok(())
    }

    fn delete(&self, id: AppointmentId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM appointment_offsets WHERE appointment_id = ?1",
            params![id],
        )?;
        let removed = tx.execute("DELETE FROM appointments WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

impl SqliteAppointmentStore {
    fn select_many(&self, sql: &str, after: Option<i64>) -> Result<Vec<Appointment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;

        let raws: Vec<rusqlite::Result<RawRow>> = match after {
            Some(epoch) => stmt.query_map(params![epoch], row_to_raw)?.collect(),
            None => stmt.query_map([], row_to_raw)?.collect(),
        };

        let mut appointments = Vec::with_capacity(raws.len());
        for raw in raws {
            let raw = raw?;
            let id = raw.id;
            appointments.push(raw.into_appointment(load_offsets(&conn, id)?)?);
        }
        Ok(appointments)
    }
}

/// An `appointments` row before timezone/rule validation.
struct RawRow {
    id: AppointmentId,
    title: String,
    local_date: String,
    timezone: String,
    repetition: String,
    community: String,
}

impl RawRow {
    fn into_appointment(self, offsets: Vec<Duration>) -> Result<Appointment, StoreError> {
        let date = NaiveDateTime::parse_from_str(&self.local_date, DATE_FORMAT)
            .map_err(|e| StoreError::Invalid(format!("bad local_date '{}': {e}", self.local_date)))?;
        let timezone = parse_timezone(&self.timezone)?;
        let repetition: Repetition = self
            .repetition
            .parse()
            .map_err(|e| StoreError::Invalid(format!("bad repetition id '{}': {e}", self.repetition)))?;

        Ok(Appointment {
            id: self.id,
            title: self.title,
            date,
            timezone,
            repetition,
            offsets,
            community: self.community,
        })
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        title: row.get(1)?,
        local_date: row.get(2)?,
        timezone: row.get(3)?,
        repetition: row.get(4)?,
        community: row.get(5)?,
    })
}

fn load_offsets(conn: &Connection, id: AppointmentId) -> Result<Vec<Duration>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT offset_secs FROM appointment_offsets WHERE appointment_id = ?1 \
         ORDER BY offset_secs DESC",
    )?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, i64>(0))?;

    let mut offsets = Vec::new();
    for secs in rows {
        offsets.push(Duration::seconds(secs?));
    }
    Ok(offsets)
}

fn parse_timezone(s: &str) -> Result<Tz, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Invalid(format!("unknown timezone '{s}'")))
}

/// UTC epoch seconds of a local deadline; a DST-gap date is not storable.
fn utc_epoch(date: NaiveDateTime, tz: Tz) -> Result<i64, StoreError> {
    resolve_local(date, tz)
        .map(|t| t.timestamp())
        .ok_or_else(|| StoreError::Invalid(format!("{date} does not exist in {tz}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::repetition::RepeatUnit;
    use chrono::{NaiveDate, TimeZone};

    fn draft(title: &str, date: NaiveDateTime) -> AppointmentDraft {
        AppointmentDraft {
            title: title.to_owned(),
            date,
            timezone: "Europe/Berlin".parse().unwrap(),
            repetition: Repetition::Every { unit: RepeatUnit::Week, interval: 1 },
            offsets: vec![Duration::hours(2), Duration::minutes(30)],
            community: "guild-1".to_owned(),
        }
    }

    fn local(y: i32, mo: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = SqliteAppointmentStore::open_in_memory().unwrap();
        let d = draft("raid night", local(2030, 6, 1, 20));
        let id = store.create(&d).unwrap();

        let appt = store.get(id).unwrap().expect("appointment exists");
        assert_eq!(appt.id, id);
        assert_eq!(appt.title, "raid night");
        assert_eq!(appt.date, d.date);
        assert_eq!(appt.timezone.name(), "Europe/Berlin");
        assert_eq!(appt.repetition, d.repetition);
        assert_eq!(appt.community, "guild-1");
        // Offsets come back furthest-first.
        assert_eq!(appt.offsets, vec![Duration::hours(2), Duration::minutes(30)]);
    }

    #[test]
    fn get_missing_is_none() {
        let store = SqliteAppointmentStore::open_in_memory().unwrap();
        assert!(store.get(999).unwrap().is_none());
    }

    #[test]
    fn list_future_filters_elapsed() {
        let store = SqliteAppointmentStore::open_in_memory().unwrap();
        store.create(&draft("past", local(2020, 1, 1, 10))).unwrap();
        let future_id = store.create(&draft("future", local(2030, 1, 1, 10))).unwrap();

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let future = store.list_future(now).unwrap();
        assert_eq!(future.len(), 1);
        assert_eq!(future[0].id, future_id);

        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn update_date_moves_deadline_and_keeps_offsets() {
        let store = SqliteAppointmentStore::open_in_memory().unwrap();
        let id = store.create(&draft("standup", local(2030, 6, 1, 9))).unwrap();

        store.update_date(id, local(2030, 6, 8, 9)).unwrap();

        let appt = store.get(id).unwrap().unwrap();
        assert_eq!(appt.date, local(2030, 6, 8, 9));
        assert_eq!(appt.offsets.len(), 2);

        // fires_at moved with the date.
        let now = Utc.with_ymd_and_hms(2030, 6, 2, 0, 0, 0).unwrap();
        assert_eq!(store.list_future(now).unwrap().len(), 1);
    }

    #[test]
    fn update_date_unknown_id_is_not_found() {
        let store = SqliteAppointmentStore::open_in_memory().unwrap();
        let err = store.update_date(42, local(2030, 1, 1, 0)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(42)));
    }

    #[test]
    fn delete_removes_appointment_and_offsets() {
        let store = SqliteAppointmentStore::open_in_memory().unwrap();
        let id = store.create(&draft("one", local(2030, 1, 1, 10))).unwrap();
        let keep = store.create(&draft("two", local(2030, 2, 1, 10))).unwrap();

        assert!(store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
        assert!(!store.delete(id).unwrap(), "second delete is a no-op");

        // Unrelated appointment untouched, offsets intact.
        let other = store.get(keep).unwrap().unwrap();
        assert_eq!(other.offsets.len(), 2);
    }

    #[test]
    fn dst_gap_date_is_not_storable() {
        let store = SqliteAppointmentStore::open_in_memory().unwrap();
        let gap = NaiveDate::from_ymd_opt(2022, 3, 27)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();
        assert!(matches!(store.create(&draft("gap", gap)), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agenda.db");

        let id = {
            let store = SqliteAppointmentStore::open(&path).unwrap();
            store.create(&draft("durable", local(2030, 3, 1, 18))).unwrap()
        };

        let store = SqliteAppointmentStore::open(&path).unwrap();
        let appt = store.get(id).unwrap().expect("survives reopen");
        assert_eq!(appt.title, "durable");
    }
}
