//! Next-occurrence calculation for recurring appointments.
//!
//! Recurrence runs in the appointment's local calendar, not in UTC, so
//! "same local time next period" survives DST shifts. Candidates that fall
//! into a spring-forward gap, or whose day-of-month drifted during month or
//! year arithmetic (Jan 30 + 1 month, Feb 29 + 1 year), are rejected and the
//! multiplier advances until a valid instant is found.

use crate::repetition::{RepeatUnit, Repetition};
use chrono::{DateTime, Datelike, Duration, LocalResult, Months, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Resolve a local wall-clock time to a UTC instant.
///
/// Returns `None` for times skipped by a spring-forward transition. An
/// ambiguous time (fall-back hour, occurs twice) resolves to the earlier
/// instant.
pub fn resolve_local(local: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Returns `true` when `local` exists in `tz`'s calendar.
pub fn is_valid_local(local: NaiveDateTime, tz: Tz) -> bool {
    !matches!(tz.from_local_datetime(&local), LocalResult::None)
}

/// Compute the next occurrence of `from` under `rule`, in `tz`'s calendar.
///
/// The result is strictly later than `from` and DST-valid in `tz`.
/// Returns `None` for [`Repetition::Once`] (a once appointment has no next
/// occurrence; callers treat reaching this as a contract violation for the
/// affected waiter) and on calendar overflow in the far future.
pub fn next_occurrence(rule: &Repetition, from: NaiveDateTime, tz: Tz) -> Option<NaiveDateTime> {
    let Repetition::Every { unit, interval } = rule else {
        return None;
    };
    let interval = (*interval).max(1);

    let mut multiplier: u32 = 1;
    loop {
        let steps = u64::from(interval) * u64::from(multiplier);
        let candidate = match unit {
            RepeatUnit::Day => from.checked_add_signed(Duration::days(steps as i64))?,
            RepeatUnit::Week => from.checked_add_signed(Duration::days(steps as i64 * 7))?,
            RepeatUnit::Month => {
                let candidate = from.checked_add_months(Months::new(steps as u32))?;
                // checked_add_months clamps to month end; a clamped candidate
                // is a different day-of-month and must be skipped.
                if candidate.day() != from.day() {
                    multiplier += 1;
                    continue;
                }
                candidate
            }
            RepeatUnit::Year => {
                let candidate = from.checked_add_months(Months::new(steps as u32 * 12))?;
                if candidate.day() != from.day() {
                    multiplier += 1;
                    continue;
                }
                candidate
            }
        };

        if is_valid_local(candidate, tz) {
            return Some(candidate);
        }
        multiplier += 1;
    }
}

/// Advance `from` under `rule` until the occurrence is strictly after
/// `now` in UTC.
///
/// Used by restart recovery: occurrences missed while the process was down
/// are skipped, not fired.
pub fn advance_past(
    rule: &Repetition,
    from: NaiveDateTime,
    tz: Tz,
    now: DateTime<Utc>,
) -> Option<NaiveDateTime> {
    let mut local = from;
    loop {
        local = next_occurrence(rule, local, tz)?;
        match resolve_local(local, tz) {
            Some(instant) if instant > now => return Some(local),
            _ => {}
        }
    }
}
