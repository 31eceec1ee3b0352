//! End-to-end restart recovery.
//!
//! Plans an appointment against an on-disk store, simulates a process
//! restart by shutting the first engine down and building a second one
//! over the same database, then verifies recovery re-arms the deadline
//! without re-delivering reminders whose fire time already elapsed.

use agenda::{
    Agenda, AppointmentDraft, AppointmentStore, DeliveryError, DestinationResolver, Localizer,
    NotificationSink, Notifier, Repetition, SqliteAppointmentStore, SystemClock,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

struct RecordingSink(Mutex<Vec<String>>);

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Vec::new())))
    }

    fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, _channel: &str, message: &str) -> Result<(), DeliveryError> {
        self.0.lock().unwrap().push(message.to_owned());
        Ok(())
    }
}

struct KeyLocalizer;

impl Localizer for KeyLocalizer {
    fn render(&self, key: &str, _context: &[(String, String)]) -> String {
        key.to_owned()
    }
}

struct FixedResolver;

impl DestinationResolver for FixedResolver {
    fn resolve(&self, _community: &str) -> Option<String> {
        Some("#events".to_owned())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn build_engine(db_path: &std::path::Path, sink: Arc<RecordingSink>) -> Arc<Agenda> {
    let store = Arc::new(SqliteAppointmentStore::open(db_path).expect("open store"));
    let clock = Arc::new(SystemClock);
    let notifier = Notifier::new(
        sink,
        Arc::new(KeyLocalizer),
        Arc::new(FixedResolver),
        clock.clone(),
    );
    Arc::new(Agenda::new(store, notifier, clock))
}

#[tokio::test]
async fn recovery_skips_elapsed_reminders_but_delivers_deadline() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("agenda.db");

    // First process: plan an appointment whose only reminder offset is
    // already in the past (one hour before a deadline that is milliseconds
    // away), then go down before anything fires.
    let first_sink = RecordingSink::new();
    let first = build_engine(&db_path, Arc::clone(&first_sink));

    let deadline = Utc::now() + Duration::milliseconds(700);
    let draft = AppointmentDraft {
        title: "launch review".to_owned(),
        date: deadline.naive_utc(),
        timezone: chrono_tz::UTC,
        repetition: Repetition::Once,
        offsets: vec![Duration::hours(1)],
        community: "guild-1".to_owned(),
    };
    let appointment = first.plan(draft).expect("plan succeeds");

    first.shutdown().await;
    assert!(
        first_sink.messages().is_empty(),
        "nothing delivered before the simulated crash"
    );
    drop(first);

    // Second process: recover from the same database.
    let second_sink = RecordingSink::new();
    let second = build_engine(&db_path, Arc::clone(&second_sink));
    let mut due_rx = second.subscribe();

    let report = second.recover().expect("recovery succeeds");
    assert_eq!(report.rearmed, 1);
    assert_eq!(report.advanced, 0);
    assert_eq!(report.dropped, 0);

    let due = tokio::time::timeout(StdDuration::from_secs(5), due_rx.recv())
        .await
        .expect("due event in time")
        .expect("channel open");
    assert_eq!(due.id, appointment.id);

    second.shutdown().await;

    // The elapsed one-hour reminder was skipped; only the deadline message
    // went out.
    assert_eq!(second_sink.messages(), vec!["appointment-due"]);

    // The once appointment is gone after firing.
    let store = SqliteAppointmentStore::open(&db_path).expect("reopen store");
    assert!(store.get(appointment.id).expect("store readable").is_none());
}

#[tokio::test]
async fn recovery_drops_fully_elapsed_once_appointment() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("agenda.db");

    // Write an already-elapsed appointment straight to the store, as if
    // the deadline passed during downtime.
    {
        let store = SqliteAppointmentStore::open(&db_path).expect("open store");
        let draft = AppointmentDraft {
            title: "missed it".to_owned(),
            date: (Utc::now() - Duration::hours(3)).naive_utc(),
            timezone: chrono_tz::UTC,
            repetition: Repetition::Once,
            offsets: vec![Duration::minutes(30)],
            community: "guild-1".to_owned(),
        };
        store.create(&draft).expect("seed store");
    }

    let sink = RecordingSink::new();
    let engine = build_engine(&db_path, Arc::clone(&sink));

    let report = engine.recover().expect("recovery succeeds");
    assert_eq!(report.dropped, 1);
    assert_eq!(report.rearmed, 0);
    assert_eq!(engine.active_waiters(), 0);

    engine.shutdown().await;
    assert!(sink.messages().is_empty(), "nothing fires for a missed once");
}
