//! Durable appointment storage.
//!
//! The engine only talks to [`AppointmentStore`]; the bundled
//! [`SqliteAppointmentStore`] is the default implementation. Timezones and
//! repetition rules cross this boundary as validated strings and nowhere
//! else.

mod sqlite;

pub use sqlite::SqliteAppointmentStore;

use crate::appointment::{Appointment, AppointmentDraft, AppointmentId};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The appointment id does not exist.
    #[error("appointment not found: {0}")]
    NotFound(AppointmentId),

    /// A row or write is not representable: unknown timezone id, malformed
    /// repetition id, or a date with no UTC resolution.
    #[error("invalid appointment data: {0}")]
    Invalid(String),

    /// I/O error while preparing the database location.
    #[error("I/O error: {0}")]
    Io(String),

    /// Connection mutex poisoned.
    #[error("lock poisoned: {0}")]
    Lock(String),
}

/// Durable CRUD over appointments and their reminder-offset sub-records.
pub trait AppointmentStore: Send + Sync {
    /// Persist a new appointment and return its assigned id.
    fn create(&self, draft: &AppointmentDraft) -> Result<AppointmentId, StoreError>;

    /// Fetch one appointment, `None` if absent.
    fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError>;

    /// Every persisted appointment. Recovery walks this at startup.
    fn list_all(&self) -> Result<Vec<Appointment>, StoreError>;

    /// Appointments whose deadline is strictly after `now`.
    fn list_future(&self, now: DateTime<Utc>) -> Result<Vec<Appointment>, StoreError>;

    /// Move an appointment's local deadline (recurring advancement). The
    /// reminder offsets carry over unchanged.
    fn update_date(&self, id: AppointmentId, new_date: NaiveDateTime) -> Result<(), StoreError>;

    /// Remove an appointment and its offset rows. Returns `false` if the id
    /// was already gone.
    fn delete(&self, id: AppointmentId) -> Result<bool, StoreError>;
}
