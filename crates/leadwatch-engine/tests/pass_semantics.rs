use chrono::{DateTime, Duration, TimeZone, Utc};
use leadwatch_core::{
    CollaboratorError, FieldUpdates, FieldValue, LeadField, LeadRepository, LeadSnapshot,
    LeadStatus, NotificationChannel, RecipientId, ReminderKind, ReminderSchedule,
};
use leadwatch_engine::{EngineConfig, EngineError, LeadWatchEngine, RetryPolicy};
use leadwatch_storage::{LedgerStore, RegisteredUser, ReminderStatus, UserRole};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

const SELLER: RecipientId = 501;
const ADMIN: RecipientId = 900;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

#[derive(Default)]
struct ScriptedSheet {
    leads: Mutex<Vec<LeadSnapshot>>,
    failing_ids: Mutex<BTreeSet<String>>,
    fail_updates: AtomicBool,
    fail_fetches: AtomicBool,
    fetches: AtomicUsize,
    updates: Mutex<Vec<(String, FieldUpdates)>>,
}

impl ScriptedSheet {
    fn with(leads: Vec<LeadSnapshot>) -> Arc<Self> {
        let sheet = Self::default();
        *sheet.leads.lock().expect("leads lock") = leads;
        Arc::new(sheet)
    }

    fn edit(&self, lead_id: &str, edit: impl FnOnce(&mut LeadSnapshot)) {
        let mut leads = self.leads.lock().expect("leads lock");
        let lead = leads
            .iter_mut()
            .find(|lead| lead.id == lead_id)
            .expect("known lead");
        edit(lead);
    }

    fn lead(&self, lead_id: &str) -> LeadSnapshot {
        self.leads
            .lock()
            .expect("leads lock")
            .iter()
            .find(|lead| lead.id == lead_id)
            .cloned()
            .expect("known lead")
    }

    fn updates_for(&self, lead_id: &str) -> Vec<FieldUpdates> {
        self.updates
            .lock()
            .expect("updates lock")
            .iter()
            .filter(|(id, _)| id == lead_id)
            .map(|(_, updates)| updates.clone())
            .collect()
    }
}

impl LeadRepository for ScriptedSheet {
    fn fetch_all(&self) -> Result<Vec<LeadSnapshot>, CollaboratorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(CollaboratorError::lead_source("sheet unavailable"));
        }
        Ok(self.leads.lock().expect("leads lock").clone())
    }

    fn update(&self, target: &LeadSnapshot, updates: &FieldUpdates) -> Result<bool, CollaboratorError> {
        let lead_id = target.id.as_str();
        if self.fail_updates.load(Ordering::SeqCst)
            || self.failing_ids.lock().expect("fail lock").contains(lead_id)
        {
            return Err(CollaboratorError::lead_source("write quota exceeded"));
        }

        let mut leads = self.leads.lock().expect("leads lock");
        let Some(lead) = leads.iter_mut().find(|lead| lead.id == lead_id) else {
            return Ok(false);
        };
        for (field, value) in updates {
            let parsed = FieldValue::<DateTime<Utc>>::parse(value);
            match field {
                LeadField::Status => lead.status = FieldValue::<LeadStatus>::parse(value),
                LeadField::CreatedAt => lead.created_at = parsed,
                LeadField::Call1Time => lead.call_1_time = parsed,
                LeadField::Call2Time => lead.call_2_time = parsed,
                LeadField::Call3Time => lead.call_3_time = parsed,
                LeadField::NextFollowup => lead.next_followup = parsed,
                LeadField::FirstClassDate => lead.first_class_date = parsed,
                LeadField::Comment => lead.comment = value.clone(),
                LeadField::LastUpdate => {}
            }
        }
        self.updates
            .lock()
            .expect("updates lock")
            .push((lead_id.to_string(), updates.clone()));
        Ok(true)
    }
}

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<(RecipientId, String)>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingChannel {
    fn messages_to(&self, recipient: RecipientId) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .filter(|(to, _)| *to == recipient)
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn count_containing(&self, needle: &str) -> usize {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .filter(|(_, text)| text.contains(needle))
            .count()
    }

    fn total(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

impl NotificationChannel for RecordingChannel {
    fn send(&self, recipient: RecipientId, text: &str) -> Result<(), CollaboratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::notifications("bot blocked"));
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((recipient, text.to_string()));
        Ok(())
    }
}

fn register_seller(store: &LedgerStore) {
    store
        .upsert_user(&RegisteredUser {
            telegram_id: SELLER,
            username: Some("madina_sales".to_string()),
            full_name: Some("Madina Yusupova".to_string()),
            role: UserRole::Seller,
            created_at: t0(),
            updated_at: t0(),
        })
        .expect("register seller");
}

fn engine(sheet: &Arc<ScriptedSheet>, channel: &Arc<RecordingChannel>) -> LeadWatchEngine {
    LeadWatchEngine::new(
        sheet.clone(),
        channel.clone(),
        EngineConfig {
            static_admins: vec![ADMIN],
            retry: RetryPolicy::immediate(2),
            ..EngineConfig::default()
        },
    )
}

fn lead(id: &str, status: &str, created: DateTime<Utc>) -> LeadSnapshot {
    LeadSnapshot {
        name: format!("Customer {id}"),
        phone: "+998 90 123 45 67".to_string(),
        seller: "madina yusupova".to_string(),
        status: FieldValue::<LeadStatus>::parse(status),
        created_at: FieldValue::Value(created),
        ..LeadSnapshot::new(id)
    }
}

#[test]
fn new_lead_is_announced_and_bootstrapped_exactly_once() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let sheet = ScriptedSheet::with(vec![lead("L-1", "", t0())]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    let mut new_leads = 0;
    let mut bootstrap_writes = 0;
    for minute in [1, 3, 5, 7] {
        let report = engine
            .run_pass(&store, t0() + Duration::minutes(minute))
            .expect("pass");
        new_leads += report.changes.new_leads;
        bootstrap_writes += report.changes.bootstrap_writes;
    }

    assert_eq!(new_leads, 1);
    assert_eq!(bootstrap_writes, 1);
    assert_eq!(sheet.updates_for("L-1").len(), 1);
    assert_eq!(
        sheet.lead("L-1").status,
        FieldValue::Value(LeadStatus::Call1Needed)
    );
    assert_eq!(channel.count_containing("New lead assigned"), 1);
    assert_eq!(
        store
            .lead_state("L-1")
            .expect("query")
            .expect("state")
            .last_status,
        "Call #1 Needed"
    );
}

#[test]
fn call1_reminders_follow_creation_time_thresholds() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let sheet = ScriptedSheet::with(vec![lead("L-1", "Call #1 Needed", t0())]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    engine
        .run_pass(&store, t0() + Duration::minutes(30))
        .expect("observe");

    let at = |minutes: i64| {
        engine
            .run_pass(&store, t0() + Duration::minutes(minutes))
            .expect("pass")
            .reminders
            .reminders_sent
    };
    assert_eq!(at(61), 1);
    assert_eq!(at(65), 0);
    assert_eq!(at(121), 1);
    assert_eq!(at(12 * 60 + 5), 1);

    assert_eq!(channel.messages_to(SELLER).len(), 3);
    let escalations = channel.messages_to(ADMIN);
    assert_eq!(escalations.len(), 1);
    assert!(escalations[0].contains("Escalation: call #1 overdue"));

    let entry = store
        .reminder_entry(
            "L-1",
            ReminderKind::Call1Escalation,
            &ReminderSchedule::At(t0() + Duration::hours(12)),
        )
        .expect("query")
        .expect("ledger row");
    assert_eq!(entry.status, ReminderStatus::Sent);
}

#[test]
fn skipped_status_transition_fires_no_stale_call1_reminders() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let sheet = ScriptedSheet::with(vec![lead("L-1", "Call #1 Needed", t0())]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    engine
        .run_pass(&store, t0() + Duration::minutes(30))
        .expect("observe");
    sheet.edit("L-1", |lead| {
        lead.status = FieldValue::Value(LeadStatus::Call1Done);
    });

    let report = engine
        .run_pass(&store, t0() + Duration::hours(13))
        .expect("pass");
    assert_eq!(report.changes.status_changes, 1);
    assert_eq!(report.changes.call_time_writes, 1);
    assert_eq!(report.reminders.reminders_sent, 0);
    assert_eq!(channel.count_containing("Lead status changed"), 1);
    assert!(store
        .reminder_entries_for_lead("L-1")
        .expect("entries")
        .is_empty());

    // The next pass sees the stamped call #1 time and schedules call #2 from it.
    let report = engine
        .run_pass(&store, t0() + Duration::hours(13) + Duration::minutes(2))
        .expect("pass");
    assert_eq!(report.changes.status_changes, 0);
    assert_eq!(report.reminders.reminders_sent, 1);
    assert_eq!(
        sheet.lead("L-1").call_2_time,
        FieldValue::Value(t0() + Duration::hours(15))
    );
    let kinds = store
        .reminder_entries_for_lead("L-1")
        .expect("entries")
        .into_iter()
        .map(|entry| entry.kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds, vec![ReminderKind::Call2Scheduled]);
}

#[test]
fn call2_is_scheduled_once_then_reminded_when_due() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let mut done = lead("L-1", "Call #1 Done", t0());
    done.call_1_time = FieldValue::Value(t0() + Duration::hours(1));
    let sheet = ScriptedSheet::with(vec![done]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    engine
        .run_pass(&store, t0() + Duration::hours(1) + Duration::minutes(1))
        .expect("observe");
    for minutes in [3, 5, 7] {
        engine
            .run_pass(&store, t0() + Duration::hours(1) + Duration::minutes(minutes))
            .expect("pass");
    }
    assert_eq!(channel.count_containing("Call #2 scheduled"), 1);
    assert_eq!(sheet.updates_for("L-1").len(), 1);

    for minutes in [181, 183] {
        engine
            .run_pass(&store, t0() + Duration::minutes(minutes))
            .expect("pass");
    }
    assert_eq!(channel.count_containing("Reminder: call #2 is due"), 1);
}

#[test]
fn failed_schedule_write_leaves_no_claim_and_retries_next_pass() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let mut done = lead("L-1", "Call #2 Done", t0());
    done.call_2_time = FieldValue::Value(t0());
    let sheet = ScriptedSheet::with(vec![done]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    engine.run_pass(&store, t0()).expect("observe");
    sheet.fail_updates.store(true, Ordering::SeqCst);

    let report = engine
        .run_pass(&store, t0() + Duration::minutes(2))
        .expect("pass");
    assert_eq!(report.reminders.lead_errors, 1);
    assert_eq!(store.reminder_count().expect("count"), 0);
    assert_eq!(channel.count_containing("Call #3 scheduled"), 0);

    sheet.fail_updates.store(false, Ordering::SeqCst);
    let report = engine
        .run_pass(&store, t0() + Duration::minutes(4))
        .expect("pass");
    assert_eq!(report.reminders.reminders_sent, 1);
    assert_eq!(
        sheet.lead("L-1").call_3_time,
        FieldValue::Value(t0() + Duration::hours(24))
    );
}

#[test]
fn first_class_reminders_fire_inside_their_windows_only() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let class_at = t0() + Duration::days(2);
    let mut pending = lead("L-1", "First Class Pending Confirmation", t0());
    pending.first_class_date = FieldValue::Value(class_at);
    let sheet = ScriptedSheet::with(vec![pending]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    engine
        .run_pass(&store, class_at - Duration::hours(30))
        .expect("observe");
    let sent_at = |before_minutes: i64| {
        engine
            .run_pass(&store, class_at - Duration::minutes(before_minutes))
            .expect("pass")
            .reminders
            .reminders_sent
    };

    assert_eq!(sent_at(25 * 60 + 5), 0);
    assert_eq!(sent_at(24 * 60 + 30), 1);
    assert_eq!(sent_at(23 * 60 + 10), 0);
    assert_eq!(sent_at(22 * 60), 0);
    assert_eq!(sent_at(150), 1);
    assert_eq!(sent_at(95), 0);
    assert_eq!(sent_at(60), 0);
    assert_eq!(channel.count_containing("First class reminder"), 2);
}

#[test]
fn did_not_attend_notifies_once_ever() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let sheet = ScriptedSheet::with(vec![lead("L-1", "Did Not Attend First Class", t0())]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    engine.run_pass(&store, t0()).expect("observe");
    for day in 0..5 {
        engine
            .run_pass(&store, t0() + Duration::days(day) + Duration::minutes(2))
            .expect("pass");
    }
    assert_eq!(channel.count_containing("did not attend"), 1);
}

#[test]
fn failed_dispatch_is_not_retried() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let sheet = ScriptedSheet::with(vec![lead("L-1", "Call #1 Needed", t0())]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    engine
        .run_pass(&store, t0() + Duration::minutes(30))
        .expect("observe");
    channel.failing.store(true, Ordering::SeqCst);
    let report = engine
        .run_pass(&store, t0() + Duration::minutes(61))
        .expect("pass");
    assert_eq!(report.reminders.delivery_failures, 1);

    channel.failing.store(false, Ordering::SeqCst);
    let report = engine
        .run_pass(&store, t0() + Duration::minutes(63))
        .expect("pass");
    assert_eq!(report.reminders.reminders_sent, 0);
    assert_eq!(report.reminders.reminders_skipped, 1);

    let undelivered = store.undelivered_reminders().expect("undelivered");
    assert_eq!(undelivered.len(), 1);
    assert_eq!(undelivered[0].kind, ReminderKind::Call1After1h);
}

#[test]
fn unregistered_seller_drops_the_reminder() {
    let store = LedgerStore::open_in_memory().expect("open db");
    let mut orphan = lead("L-1", "Call #1 Needed", t0());
    orphan.seller = "Nobody Known".to_string();
    let sheet = ScriptedSheet::with(vec![orphan]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    engine
        .run_pass(&store, t0() + Duration::minutes(30))
        .expect("observe");
    let report = engine
        .run_pass(&store, t0() + Duration::minutes(61))
        .expect("pass");
    assert_eq!(report.reminders.reminders_dropped, 1);
    assert_eq!(channel.total(), 0);
    assert_eq!(store.reminder_count().expect("count"), 1);
}

#[test]
fn one_failing_lead_does_not_abort_the_batch() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let sheet = ScriptedSheet::with(vec![
        lead("L-1", "New Lead", t0()),
        lead("L-2", "", t0()),
        lead("L-3", "Call #3 Done", t0()),
    ]);
    sheet
        .failing_ids
        .lock()
        .expect("fail lock")
        .insert("L-2".to_string());
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    let report = engine
        .detect_changes(&store, t0() + Duration::minutes(1))
        .expect("detect");
    assert_eq!(report.new_leads, 2);
    assert_eq!(report.lead_errors, 1);
    assert!(store.lead_state("L-2").expect("query").is_none());
    assert!(store.lead_state("L-3").expect("query").is_some());

    sheet.failing_ids.lock().expect("fail lock").clear();
    let report = engine
        .detect_changes(&store, t0() + Duration::minutes(3))
        .expect("detect");
    assert_eq!(report.new_leads, 1);
    assert_eq!(report.bootstrap_writes, 1);
    assert_eq!(report.lead_errors, 0);
}

#[test]
fn concurrent_passes_on_separate_connections_send_each_reminder_once() {
    let db = NamedTempFile::new().expect("temp db");
    {
        let store = LedgerStore::open(db.path()).expect("open db");
        register_seller(&store);
    }
    let sheet = ScriptedSheet::with(vec![
        lead("L-1", "Call #1 Needed", t0()),
        lead("L-2", "Call #1 Needed", t0()),
    ]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = Arc::new(engine(&sheet, &channel));
    {
        let store = LedgerStore::open(db.path()).expect("open db");
        engine
            .detect_changes(&store, t0() + Duration::minutes(30))
            .expect("observe");
    }

    let now = t0() + Duration::minutes(12 * 60 + 5);
    let handles = (0..6)
        .map(|_| {
            let engine = engine.clone();
            let path = db.path().to_path_buf();
            std::thread::spawn(move || {
                let store = LedgerStore::open(&path).expect("open per thread");
                engine.process_reminders(&store, now).expect("reminders")
            })
        })
        .collect::<Vec<_>>();

    let sent = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread").reminders_sent)
        .sum::<usize>();

    // Three thresholds for each of two leads.
    assert_eq!(sent, 6);
    assert_eq!(channel.count_containing("Reminder: call #1 needed"), 4);
    assert_eq!(channel.messages_to(ADMIN).len(), 2);
    let store = LedgerStore::open(db.path()).expect("reopen");
    assert_eq!(store.reminder_count().expect("count"), 6);
}

#[test]
fn aggregate_reports_go_to_every_admin() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    store
        .upsert_user(&RegisteredUser {
            telegram_id: 77,
            username: Some("ops".to_string()),
            full_name: None,
            role: UserRole::Admin,
            created_at: t0(),
            updated_at: t0(),
        })
        .expect("register admin");
    let sheet = ScriptedSheet::with(vec![
        lead("L-1", "Call #1 Needed", t0() - Duration::hours(20)),
        lead("L-2", "Completed", t0() - Duration::hours(1)),
    ]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    let daily = engine.send_daily_report(&store, t0()).expect("daily");
    assert_eq!(daily.recipients, 2);
    assert_eq!(daily.delivered, 2);
    let text = &channel.messages_to(77)[0];
    assert!(text.contains("Total leads: 2"));
    assert!(text.contains("Overdue call #1 (>12h): 1"));

    let weekly = engine.send_weekly_report(&store, t0()).expect("weekly");
    assert_eq!(weekly.delivered, 2);
    assert!(channel.messages_to(ADMIN)[1].contains("Conversion: 50.0%"));
    assert!(channel.attempts.load(Ordering::SeqCst) >= 4);
}

#[test]
fn exhausted_fetch_fails_only_that_pass() {
    let store = LedgerStore::open_in_memory().expect("open db");
    register_seller(&store);
    let sheet = ScriptedSheet::with(vec![lead("L-1", "", t0())]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);
    sheet.fail_fetches.store(true, Ordering::SeqCst);

    let err = engine
        .run_pass(&store, t0() + Duration::minutes(1))
        .expect_err("fetch exhausted");
    assert!(matches!(err, EngineError::Collaborator(_)), "got {err:?}");
    assert_eq!(sheet.fetches.load(Ordering::SeqCst), 2);

    assert!(engine.detect_changes(&store, t0() + Duration::minutes(2)).is_err());
    assert!(engine.process_reminders(&store, t0() + Duration::minutes(2)).is_err());
    assert_eq!(sheet.fetches.load(Ordering::SeqCst), 6);

    assert!(store.lead_states().expect("states").is_empty());
    assert_eq!(store.reminder_count().expect("count"), 0);
    assert!(sheet.updates_for("L-1").is_empty());
    assert_eq!(channel.total(), 0);

    sheet.fail_fetches.store(false, Ordering::SeqCst);
    let report = engine
        .run_pass(&store, t0() + Duration::minutes(3))
        .expect("next pass");
    assert_eq!(report.changes.new_leads, 1);
    assert_eq!(channel.count_containing("New lead assigned"), 1);
    assert!(store.lead_state("L-1").expect("query").is_some());
}

#[test]
fn failed_state_save_does_not_announce_the_lead_twice() {
    let db = NamedTempFile::new().expect("temp db");
    let store = LedgerStore::open(db.path()).expect("open db");
    register_seller(&store);
    let sheet = ScriptedSheet::with(vec![lead("L-1", "", t0())]);
    let channel = Arc::new(RecordingChannel::default());
    let engine = engine(&sheet, &channel);

    let admin = rusqlite::Connection::open(db.path()).expect("second connection");
    admin
        .execute_batch(
            "CREATE TRIGGER reject_state BEFORE INSERT ON lead_state
             BEGIN SELECT RAISE(ABORT, 'database is locked'); END;",
        )
        .expect("install trigger");

    let first = engine
        .run_pass(&store, t0() + Duration::minutes(1))
        .expect("pass");
    assert_eq!(first.changes.lead_errors, 1);
    assert_eq!(first.changes.new_leads, 0);
    assert_eq!(channel.count_containing("New lead assigned"), 0);

    admin
        .execute_batch("DROP TRIGGER reject_state;")
        .expect("drop trigger");
    for minute in [3, 5] {
        engine
            .run_pass(&store, t0() + Duration::minutes(minute))
            .expect("pass");
    }

    assert_eq!(channel.count_containing("New lead assigned"), 1);
    assert_eq!(sheet.updates_for("L-1").len(), 1);
    assert_eq!(
        store
            .lead_state("L-1")
            .expect("query")
            .expect("state")
            .last_status,
        "Call #1 Needed"
    );
}
