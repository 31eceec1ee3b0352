//! Scheduling engine.
//!
//! `Agenda` owns the full appointment lifecycle: validate and persist new
//! appointments, arm one waiter per appointment, raise due events, advance
//! recurring appointments, and recover persisted state after a restart.
//!
//! Lifecycle per appointment: pending (persisted, waiter armed) → due
//! (deadline delivered, event raised) → completed (once: record deleted) or
//! rescheduled (recurring: date advanced, waiter re-armed). Cancellation is
//! only reachable while pending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::appointment::{Appointment, AppointmentDraft, AppointmentId};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::AgendaError;
use crate::notify::{
    CompletionAction, MSG_DUE, MSG_REMINDER, MessageKind, Notifier, ScheduledMessage,
    WaiterHandle, format_offset,
};
use crate::recurrence;
use crate::store::AppointmentStore;

/// Default capacity of the due-event broadcast channel.
const DEFAULT_DUE_CAPACITY: usize = 64;

/// Rejection of a plan request.
///
/// Validation failures are ordinary results, not panics: they happen on
/// every malformed user request.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The title was empty or whitespace.
    #[error("appointment title must not be empty")]
    EmptyTitle,

    /// The local date falls into a DST spring-forward gap and does not
    /// exist in the given timezone.
    #[error("{date} does not exist in {timezone}")]
    DateInvalid {
        /// The rejected wall-clock date.
        date: NaiveDateTime,
        /// The timezone it was interpreted in.
        timezone: Tz,
    },

    /// The date is not strictly in the future.
    #[error("appointment date has already passed")]
    DatePassed,

    /// Persistence failed; nothing was armed.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl PlanError {
    /// Stable symbolic code for user-facing mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyTitle => "empty-title",
            Self::DateInvalid { .. } => "date-invalid",
            Self::DatePassed => "date-passed",
            Self::Store(_) => "store",
        }
    }
}

/// Rejection of a cancel request.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    /// No appointment with this id.
    #[error("appointment not found: {0}")]
    NotFound(AppointmentId),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl CancelError {
    /// Stable symbolic code for user-facing mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::Store(_) => "store",
        }
    }
}

/// What startup recovery did with the persisted appointments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Still-future appointments re-armed as planned.
    pub rearmed: usize,
    /// Elapsed recurring appointments advanced to their next occurrence.
    pub advanced: usize,
    /// Elapsed once appointments (and unadvanceable rows) removed.
    pub dropped: usize,
}

/// The appointment scheduling engine.
///
/// One instance per process. Methods that arm waiters take
/// `self: &Arc<Self>` because the waiter completion path needs a weak
/// handle back into the engine; wrap the built engine in an `Arc`.
///
/// Shutdown cancels outstanding waiters rather than draining their
/// remaining sequences: nothing is delivered once shutdown has begun.
pub struct Agenda {
    store: Arc<dyn AppointmentStore>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    /// Live waiters by appointment id. Insert on arm, remove on
    /// cancel/completion; all three paths run on different tasks.
    waiters: Mutex<HashMap<AppointmentId, WaiterHandle>>,
    due_tx: broadcast::Sender<Appointment>,
    closing: AtomicBool,
}

impl Agenda {
    /// Create an engine over the given store and notifier. The clock must
    /// be the same one the notifier reads.
    pub fn new(store: Arc<dyn AppointmentStore>, notifier: Notifier, clock: Arc<dyn Clock>) -> Self {
        let (due_tx, _) = broadcast::channel(DEFAULT_DUE_CAPACITY);
        Self {
            store,
            notifier,
            clock,
            waiters: Mutex::new(HashMap::new()),
            due_tx,
            closing: AtomicBool::new(false),
        }
    }

    /// Apply engine settings from configuration. Call before subscribing;
    /// rebuilding the due-event channel disconnects existing receivers.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        let (due_tx, _) = broadcast::channel(config.notify.due_event_capacity.max(1));
        self.due_tx = due_tx;
        self
    }

    /// Validate, persist, and arm a new appointment.
    ///
    /// Nothing is written and no waiter is created on a validation failure.
    /// Must be called from within a tokio runtime.
    pub fn plan(self: &Arc<Self>, draft: AppointmentDraft) -> Result<Appointment, PlanError> {
        if draft.title.trim().is_empty() {
            return Err(PlanError::EmptyTitle);
        }
        let Some(deadline) = recurrence::resolve_local(draft.date, draft.timezone) else {
            return Err(PlanError::DateInvalid { date: draft.date, timezone: draft.timezone });
        };
        if deadline <= self.clock.now_utc() {
            return Err(PlanError::DatePassed);
        }

        let id = self.store.create(&draft)?;
        let appointment = draft.into_appointment(id);
        self.arm(&appointment, deadline);

        info!(
            "planned appointment {id} '{}' ({}) due {deadline}",
            appointment.title, appointment.repetition
        );
        Ok(appointment)
    }

    /// Cancel an appointment: stop its waiter (if one is live) and delete
    /// the persisted record with its offset rows.
    ///
    /// Safe when no waiter is armed, e.g. right after a restart before
    /// recovery ran; the record is still deleted.
    pub fn cancel(&self, id: AppointmentId) -> Result<(), CancelError> {
        if self.store.get(id)?.is_none() {
            return Err(CancelError::NotFound(id));
        }

        if let Some(handle) = self.waiters().remove(&id) {
            handle.cancel();
        }
        self.store.delete(id)?;

        info!("cancelled appointment {id}");
        Ok(())
    }

    /// Subscribe to due events. Each occurrence of each appointment raises
    /// one event carrying the appointment snapshot; slow subscribers fall
    /// behind independently (bounded per-receiver buffers).
    pub fn subscribe(&self) -> broadcast::Receiver<Appointment> {
        self.due_tx.subscribe()
    }

    /// Number of currently armed waiters.
    pub fn active_waiters(&self) -> usize {
        self.waiters().len()
    }

    /// Re-arm persisted appointments after a process restart.
    ///
    /// Still-future appointments are armed exactly as if freshly planned
    /// (the notifier skips reminders whose fire time already elapsed).
    /// Elapsed once appointments are dropped; elapsed recurring ones are
    /// advanced past now, re-persisted, and armed. Missed occurrences are
    /// skipped, not fired.
    pub fn recover(self: &Arc<Self>) -> Result<RecoveryReport, AgendaError> {
        let now = self.clock.now_utc();
        let mut report = RecoveryReport::default();

        for appointment in self.store.list_all()? {
            match appointment.fire_instant() {
                Some(instant) if instant > now => {
                    self.arm(&appointment, instant);
                    report.rearmed += 1;
                }
                _ => {
                    if appointment.repetition.is_recurring() {
                        self.advance_elapsed(appointment, now, &mut report)?;
                    } else {
                        debug!("dropping elapsed appointment {}", appointment.id);
                        self.store.delete(appointment.id)?;
                        report.dropped += 1;
                    }
                }
            }
        }

        info!(
            "recovery: {} re-armed, {} advanced, {} dropped",
            report.rearmed, report.advanced, report.dropped
        );
        Ok(report)
    }

    /// Cancel all outstanding waiters and wait for their tasks to finish.
    /// Terminal; planned-but-undelivered notifications are not sent.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let handles: Vec<WaiterHandle> = self.waiters().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.cancel();
        }
        self.notifier.drain().await;

        info!("engine shut down, {} waiters cancelled", handles.len());
    }

    /// Acquire the waiter registry, recovering from a poisoned lock.
    fn waiters(&self) -> MutexGuard<'_, HashMap<AppointmentId, WaiterHandle>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the message sequence and register the waiter.
    fn arm(self: &Arc<Self>, appointment: &Appointment, deadline: DateTime<Utc>) {
        let messages = build_messages(appointment, deadline);
        let id = appointment.id;
        let weak = Arc::downgrade(self);
        let on_complete: CompletionAction = Box::new(move || {
            if let Some(agenda) = weak.upgrade() {
                agenda.appointment_due(id);
            }
        });

        let handle = self.notifier.schedule(&appointment.community, messages, on_complete);
        self.waiters().insert(id, handle);
        debug!("armed waiter for appointment {id}, deadline {deadline}");
    }

    /// Deadline reached: raise the due event, then delete (once) or advance
    /// and re-arm (recurring). Runs on the waiter's task.
    fn appointment_due(self: &Arc<Self>, id: AppointmentId) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let appointment = match self.store.get(id) {
            Ok(Some(appointment)) => appointment,
            // Cancelled between the deadline delivery and this callback.
            Ok(None) => {
                self.waiters().remove(&id);
                return;
            }
            Err(e) => {
                error!("cannot load due appointment {id}: {e}");
                self.waiters().remove(&id);
                return;
            }
        };

        let _ = self.due_tx.send(appointment.clone());

        if appointment.repetition.is_recurring() {
            self.reschedule(appointment);
        } else {
            if let Err(e) = self.store.delete(id) {
                error!("cannot remove completed appointment {id}: {e}");
            }
            self.waiters().remove(&id);
        }
    }

    /// Advance a due recurring appointment to its next occurrence and
    /// re-arm. A failure here aborts this appointment's waiter only.
    fn reschedule(self: &Arc<Self>, appointment: Appointment) {
        let now = self.clock.now_utc();
        let next = recurrence::advance_past(
            &appointment.repetition,
            appointment.date,
            appointment.timezone,
            now,
        );
        let Some(next) = next else {
            error!(
                "appointment {} has no next occurrence, dropping waiter",
                appointment.id
            );
            self.waiters().remove(&appointment.id);
            return;
        };

        if let Err(e) = self.store.update_date(appointment.id, next) {
            error!("cannot advance appointment {}: {e}", appointment.id);
            self.waiters().remove(&appointment.id);
            return;
        }

        let mut advanced = appointment;
        advanced.date = next;
        match advanced.fire_instant() {
            Some(instant) => {
                debug!("appointment {} rescheduled for {instant}", advanced.id);
                self.arm(&advanced, instant);
            }
            None => {
                error!(
                    "advanced date {next} for appointment {} is unresolvable",
                    advanced.id
                );
                self.waiters().remove(&advanced.id);
            }
        }
    }

    /// Recovery path for an appointment whose deadline elapsed while the
    /// process was down.
    fn advance_elapsed(
        self: &Arc<Self>,
        appointment: Appointment,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> Result<(), AgendaError> {
        let next = recurrence::advance_past(
            &appointment.repetition,
            appointment.date,
            appointment.timezone,
            now,
        );
        let Some(next) = next else {
            error!(
                "appointment {} cannot be advanced, dropping it",
                appointment.id
            );
            self.store.delete(appointment.id)?;
            report.dropped += 1;
            return Ok(());
        };

        self.store.update_date(appointment.id, next)?;
        let mut advanced = appointment;
        advanced.date = next;
        if let Some(instant) = advanced.fire_instant() {
            debug!(
                "appointment {} advanced past downtime to {instant}",
                advanced.id
            );
            self.arm(&advanced, instant);
            report.advanced += 1;
        }
        Ok(())
    }
}

/// One reminder per deduplicated offset, furthest first, then the deadline.
fn build_messages(appointment: &Appointment, deadline: DateTime<Utc>) -> Vec<ScheduledMessage> {
    let offsets = appointment.reminder_offsets();
    let mut messages = Vec::with_capacity(offsets.len() + 1);

    for offset in offsets {
        messages.push(ScheduledMessage {
            fire_at: deadline - offset,
            kind: MessageKind::Reminder,
            key: MSG_REMINDER.to_owned(),
            context: vec![
                ("title".to_owned(), appointment.title.clone()),
                ("remaining".to_owned(), format_offset(offset)),
            ],
        });
    }

    messages.push(ScheduledMessage {
        fire_at: deadline,
        kind: MessageKind::Deadline,
        key: MSG_DUE.to_owned(),
        context: vec![("title".to_owned(), appointment.title.clone())],
    });

    messages
}
