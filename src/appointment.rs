//! Appointment records.

use crate::recurrence;
use crate::repetition::Repetition;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// Opaque appointment identity, assigned by the store on creation.
pub type AppointmentId = i64;

/// A scheduled appointment as the engine and store see it.
///
/// The date is kept as a local wall-clock time plus its timezone, never as
/// a bare UTC instant: recurrence must run in the local calendar to skip
/// DST-invalid instants and keep "same local time next period" semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    /// Store-assigned identity.
    pub id: AppointmentId,
    /// Non-empty label shown in notifications.
    pub title: String,
    /// Local wall-clock deadline.
    pub date: NaiveDateTime,
    /// Timezone the date is anchored in.
    pub timezone: Tz,
    /// Recurrence rule.
    pub repetition: Repetition,
    /// Reminder offsets before the deadline. Stored as given; use
    /// [`Appointment::reminder_offsets`] for the firing order.
    pub offsets: Vec<Duration>,
    /// Community the appointment belongs to; resolves to the delivery
    /// channel at notification time.
    pub community: String,
}

impl Appointment {
    /// The deadline as a UTC instant, or `None` if the local date falls in
    /// a DST gap (possible only for rows written before validation, or
    /// after a zone database update).
    pub fn fire_instant(&self) -> Option<DateTime<Utc>> {
        recurrence::resolve_local(self.date, self.timezone)
    }

    /// Offsets deduplicated and sorted furthest-first, the order reminders
    /// fire in.
    pub fn reminder_offsets(&self) -> Vec<Duration> {
        let mut offsets = self.offsets.clone();
        offsets.sort_unstable_by(|a, b| b.cmp(a));
        offsets.dedup();
        offsets
    }
}

/// A validated creation request; everything an [`Appointment`] has except
/// the id.
#[derive(Debug, Clone)]
pub struct AppointmentDraft {
    /// Label shown in notifications.
    pub title: String,
    /// Local wall-clock deadline.
    pub date: NaiveDateTime,
    /// Timezone the date is anchored in.
    pub timezone: Tz,
    /// Recurrence rule.
    pub repetition: Repetition,
    /// Reminder offsets before the deadline.
    pub offsets: Vec<Duration>,
    /// Owning community.
    pub community: String,
}

impl AppointmentDraft {
    /// Attach a store-assigned id.
    pub fn into_appointment(self, id: AppointmentId) -> Appointment {
        Appointment {
            id,
            title: self.title,
            date: self.date,
            timezone: self.timezone,
            repetition: self.repetition,
            offsets: self.offsets,
            community: self.community,
        }
    }
}
