//! Poll scheduler: two interval jobs over the lead sheet and two calendar
//! jobs for the admin reports.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use leadwatch_engine::LeadWatchEngine;
use leadwatch_storage::LedgerStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    DetectChanges,
    ProcessReminders,
    DailyReport,
    WeeklyReport,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DetectChanges => "detect_changes",
            JobKind::ProcessReminders => "process_reminders",
            JobKind::DailyReport => "daily_report",
            JobKind::WeeklyReport => "weekly_report",
        }
    }
}

/// Allows at most one running invocation of a job. A second caller is
/// turned away instead of waiting.
#[derive(Debug, Default)]
pub struct JobGuard {
    running: AtomicBool,
}

impl JobGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<JobPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| JobPermit {
                guard: Arc::clone(self),
            })
    }
}

pub struct JobPermit {
    guard: Arc<JobGuard>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Everything a job invocation needs. Each invocation opens its own ledger
/// connection so jobs never share one across threads.
pub struct JobContext {
    engine: Arc<LeadWatchEngine>,
    database_path: PathBuf,
}

impl JobContext {
    pub fn new(engine: Arc<LeadWatchEngine>, database_path: PathBuf) -> Self {
        Self {
            engine,
            database_path,
        }
    }

    pub fn run(&self, kind: JobKind, now: DateTime<Utc>) -> Result<()> {
        let store = LedgerStore::open(&self.database_path)
            .with_context(|| format!("failed to open ledger {}", self.database_path.display()))?;
        match kind {
            JobKind::DetectChanges => {
                self.engine.detect_changes(&store, now)?;
            }
            JobKind::ProcessReminders => {
                self.engine.process_reminders(&store, now)?;
            }
            JobKind::DailyReport => {
                self.engine.send_daily_report(&store, now)?;
            }
            JobKind::WeeklyReport => {
                self.engine.send_weekly_report(&store, now)?;
            }
        }
        Ok(())
    }

    /// Runs a job and logs instead of propagating a failure.
    pub fn execute(&self, kind: JobKind) {
        if let Err(err) = self.run(kind, Utc::now()) {
            error!(event = "job_failed", job = kind.as_str(), error = %format!("{err:#}"));
        }
    }
}

/// Starts `kind` on the blocking pool unless its previous invocation is still
/// running. Returns whether the job was started.
pub fn spawn_job(context: &Arc<JobContext>, guard: &Arc<JobGuard>, kind: JobKind) -> bool {
    let Some(permit) = guard.try_acquire() else {
        debug!(event = "job_skipped", job = kind.as_str(), "previous run still in progress");
        return false;
    };
    let context = Arc::clone(context);
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        context.execute(kind);
    });
    true
}

pub fn next_daily_fire(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = at_hour(now.date_naive(), hour);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub fn next_weekly_fire(now: DateTime<Utc>, weekday: Weekday, hour: u32) -> DateTime<Utc> {
    let days_ahead = (7 + weekday.num_days_from_monday() as i64
        - now.weekday().num_days_from_monday() as i64)
        % 7;
    let candidate = at_hour(now.date_naive(), hour) + ChronoDuration::days(days_ahead);
    if candidate > now {
        candidate
    } else {
        candidate + ChronoDuration::days(7)
    }
}

fn at_hour(date: chrono::NaiveDate, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(time))
}

pub struct Scheduler {
    context: Arc<JobContext>,
    poll_interval: Duration,
    report_hour: u32,
}

impl Scheduler {
    pub fn new(context: JobContext, poll_interval: Duration, report_hour: u32) -> Self {
        Self {
            context: Arc::new(context),
            poll_interval,
            report_hour,
        }
    }

    /// Runs every job until Ctrl-C. Jobs already on the blocking pool are
    /// left to finish.
    pub async fn run_until_shutdown(self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            self.spawn_interval(JobKind::DetectChanges, shutdown_rx.clone()),
            self.spawn_interval(JobKind::ProcessReminders, shutdown_rx.clone()),
            self.spawn_calendar(JobKind::DailyReport, shutdown_rx.clone()),
            self.spawn_calendar(JobKind::WeeklyReport, shutdown_rx),
        ];
        info!(
            event = "scheduler_started",
            poll_interval_secs = self.poll_interval.as_secs(),
            report_hour = self.report_hour
        );

        if let Err(err) = tokio::signal::ctrl_c().await {
            // Without a signal handler there is no shutdown trigger; keep serving.
            error!(event = "signal_handler_failed", error = %err);
            std::future::pending::<()>().await;
        }
        info!(event = "scheduler_shutdown");
        let _ = shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
    }

    fn spawn_interval(&self, kind: JobKind, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let context = Arc::clone(&self.context);
        let guard = JobGuard::new();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        spawn_job(&context, &guard, kind);
                    }
                }
            }
        })
    }

    fn spawn_calendar(&self, kind: JobKind, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let context = Arc::clone(&self.context);
        let guard = JobGuard::new();
        let hour = self.report_hour;
        tokio::spawn(async move {
            let mut last_fire: Option<DateTime<Utc>> = None;
            loop {
                // Wall clock may lag the timer slightly; never re-fire the same slot.
                let now = last_fire.map_or_else(Utc::now, |fired| Utc::now().max(fired));
                let fire_at = match kind {
                    JobKind::WeeklyReport => next_weekly_fire(now, Weekday::Mon, hour),
                    _ => next_daily_fire(now, hour),
                };
                let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
                debug!(event = "report_scheduled", job = kind.as_str(), fire_at = %fire_at);
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(wait) => {
                        last_fire = Some(fire_at);
                        spawn_job(&context, &guard, kind);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{OutboxFile, OutboxMessage};
    use crate::sheet_file::SheetFile;
    use leadwatch_engine::{EngineConfig, RetryPolicy};
    use leadwatch_storage::{RegisteredUser, UserRole};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn guard_turns_away_a_second_invocation() {
        let guard = JobGuard::new();
        let permit = guard.try_acquire().expect("first acquire");
        assert!(guard.try_acquire().is_none());

        drop(permit);
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn busy_job_is_skipped_without_spawning() {
        let dir = tempfile::tempdir().expect("temp dir");
        let engine = LeadWatchEngine::new(
            Arc::new(SheetFile::new(dir.path().join("leads.json"))),
            Arc::new(OutboxFile::new(dir.path().join("outbox.jsonl"))),
            EngineConfig::default(),
        );
        let context = Arc::new(JobContext::new(Arc::new(engine), dir.path().join("ledger.db")));
        let guard = JobGuard::new();
        let _held = guard.try_acquire().expect("hold guard");

        assert!(!spawn_job(&context, &guard, JobKind::DetectChanges));
    }

    #[test]
    fn daily_fire_is_today_or_tomorrow() {
        assert_eq!(next_daily_fire(at(2026, 3, 4, 8, 59), 9), at(2026, 3, 4, 9, 0));
        assert_eq!(next_daily_fire(at(2026, 3, 4, 9, 0), 9), at(2026, 3, 5, 9, 0));
        assert_eq!(next_daily_fire(at(2026, 12, 31, 23, 30), 0), at(2027, 1, 1, 0, 0));
    }

    #[test]
    fn weekly_fire_lands_on_the_next_monday() {
        // 2026-03-04 is a Wednesday.
        assert_eq!(
            next_weekly_fire(at(2026, 3, 4, 12, 0), Weekday::Mon, 9),
            at(2026, 3, 9, 9, 0)
        );
        // Monday before and after the hour.
        assert_eq!(
            next_weekly_fire(at(2026, 3, 9, 8, 0), Weekday::Mon, 9),
            at(2026, 3, 9, 9, 0)
        );
        assert_eq!(
            next_weekly_fire(at(2026, 3, 9, 9, 0), Weekday::Mon, 9),
            at(2026, 3, 16, 9, 0)
        );
    }

    #[test]
    fn detect_job_runs_against_file_adapters() {
        let dir = tempfile::tempdir().expect("temp dir");
        let leads = dir.path().join("leads.json");
        let outbox = dir.path().join("outbox.jsonl");
        let database = dir.path().join("ledger.db");
        std::fs::write(
            &leads,
            r#"[{"ID": "L-1", "Name": "Jasur", "Seller": "Madina", "Status": "",
                 "Created_At": "2026-03-04 09:00:00"}]"#,
        )
        .expect("write sheet");

        let now = at(2026, 3, 4, 9, 5);
        let store = LedgerStore::open(&database).expect("open ledger");
        store
            .upsert_user(&RegisteredUser {
                telegram_id: 501,
                username: None,
                full_name: Some("Madina".to_string()),
                role: UserRole::Seller,
                created_at: now,
                updated_at: now,
            })
            .expect("register seller");
        drop(store);

        let engine = LeadWatchEngine::new(
            Arc::new(SheetFile::new(&leads)),
            Arc::new(OutboxFile::new(&outbox)),
            EngineConfig::default(),
        );
        let context = JobContext::new(Arc::new(engine), database.clone());
        context.run(JobKind::DetectChanges, now).expect("detect job");
        context.run(JobKind::DetectChanges, now).expect("second detect job");

        let sent = std::fs::read_to_string(&outbox)
            .expect("read outbox")
            .lines()
            .map(|line| serde_json::from_str::<OutboxMessage>(line).expect("json line"))
            .collect::<Vec<_>>();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, 501);
        assert!(sent[0].text.contains("New lead assigned"));

        let sheet = std::fs::read_to_string(&leads).expect("read sheet");
        assert!(sheet.contains("Call #1 Needed"));
        assert!(sheet.contains("2026-03-04 09:05:00"));

        let store = LedgerStore::open(&database).expect("reopen ledger");
        assert!(store.lead_state("L-1").expect("state").is_some());
    }

    #[test]
    fn unreadable_sheet_fails_the_job_without_touching_the_ledger() {
        let dir = tempfile::tempdir().expect("temp dir");
        let leads = dir.path().join("leads.json");
        let database = dir.path().join("ledger.db");
        std::fs::write(&leads, "not a sheet").expect("write sheet");

        let engine = LeadWatchEngine::new(
            Arc::new(SheetFile::new(&leads)),
            Arc::new(OutboxFile::new(dir.path().join("outbox.jsonl"))),
            EngineConfig {
                retry: RetryPolicy::immediate(1),
                ..EngineConfig::default()
            },
        );
        let context = JobContext::new(Arc::new(engine), database.clone());
        let now = at(2026, 3, 4, 9, 5);
        assert!(context.run(JobKind::DetectChanges, now).is_err());
        assert!(context.run(JobKind::ProcessReminders, now).is_err());

        // Logged, not raised.
        context.execute(JobKind::DetectChanges);

        let store = LedgerStore::open(&database).expect("open ledger");
        assert!(store.lead_states().expect("states").is_empty());
        assert_eq!(store.reminder_count().expect("count"), 0);
        drop(store);

        std::fs::write(
            &leads,
            r#"[{"ID": "L-1", "Seller": "Madina", "Status": "Call #1 Needed",
                 "Created_At": "2026-03-04 09:00:00"}]"#,
        )
        .expect("repair sheet");
        context.run(JobKind::DetectChanges, now).expect("detect after repair");
        let store = LedgerStore::open(&database).expect("reopen ledger");
        assert!(store.lead_state("L-1").expect("state").is_some());
    }
}
