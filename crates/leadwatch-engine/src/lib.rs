use chrono::{DateTime, Utc};
use leadwatch_core::{
    CollaboratorError, FieldUpdates, LeadDataError, LeadRepository, LeadSnapshot,
    NotificationChannel, RecipientId,
};
use leadwatch_storage::{LedgerStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod change_detector;
pub mod escalation;
pub mod messages;
pub mod reminder_rules;
pub mod reports;
pub mod retry;

pub use change_detector::{ChangeDetector, ChangePlan, ChangeReport, LeadChange, LeadEvent};
pub use escalation::{EscalationRouter, Route};
pub use reminder_rules::{ReminderAction, ReminderEngine, ReminderReport, ReminderRules};
pub use reports::{DailySummary, SellerPerformance, WeeklySummary};
pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Data(#[from] LeadDataError),
    #[error("lead {0} no longer exists in the lead source")]
    MissingLead(String),
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Administrators from static configuration, merged with the registry.
    pub static_admins: Vec<RecipientId>,
    pub retry: RetryPolicy,
    pub rules: ReminderRules,
}

/// Borrowed collaborators for one pass over the lead sheet.
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub store: &'a LedgerStore,
    pub repository: &'a dyn LeadRepository,
    pub channel: &'a dyn NotificationChannel,
    pub router: &'a EscalationRouter,
    pub retry: &'a RetryPolicy,
}

impl PassContext<'_> {
    /// Sends `text` to every recipient, one attempt each. Returns how many
    /// deliveries succeeded; failures are logged and otherwise dropped.
    pub fn deliver(&self, subject: &str, recipients: &[RecipientId], text: &str) -> usize {
        let mut delivered = 0;
        for recipient in recipients {
            match self.channel.send(*recipient, text) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    event = "notification_failed",
                    subject,
                    recipient = *recipient,
                    error = %err
                ),
            }
        }
        delivered
    }

    pub fn update_lead(
        &self,
        lead: &LeadSnapshot,
        updates: &FieldUpdates,
    ) -> Result<(), EngineError> {
        let found = self
            .retry
            .run("update_lead", || self.repository.update(lead, updates))?;
        if found {
            Ok(())
        } else {
            Err(EngineError::MissingLead(lead.id.trim().to_string()))
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub leads_fetched: usize,
    pub changes: ChangeReport,
    pub reminders: ReminderReport,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReportDelivery {
    pub recipients: usize,
    pub delivered: usize,
}

/// Entry point for schedulers: change detection, reminders and admin reports.
pub struct LeadWatchEngine {
    repository: Arc<dyn LeadRepository>,
    channel: Arc<dyn NotificationChannel>,
    router: EscalationRouter,
    retry: RetryPolicy,
    rules: ReminderRules,
}

impl LeadWatchEngine {
    pub fn new(
        repository: Arc<dyn LeadRepository>,
        channel: Arc<dyn NotificationChannel>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            channel,
            router: EscalationRouter::new(config.static_admins),
            retry: config.retry,
            rules: config.rules,
        }
    }

    fn context<'a>(&'a self, store: &'a LedgerStore) -> PassContext<'a> {
        PassContext {
            store,
            repository: self.repository.as_ref(),
            channel: self.channel.as_ref(),
            router: &self.router,
            retry: &self.retry,
        }
    }

    pub fn fetch_snapshot(&self) -> Result<Vec<LeadSnapshot>, EngineError> {
        Ok(self
            .retry
            .run("fetch_all", || self.repository.fetch_all())?)
    }

    pub fn detect_changes(
        &self,
        store: &LedgerStore,
        now: DateTime<Utc>,
    ) -> Result<ChangeReport, EngineError> {
        let snapshot = self.fetch_snapshot()?;
        let report = ChangeDetector::new(self.context(store)).run(&snapshot, now)?;
        info!(
            event = "changes_detected",
            leads = snapshot.len(),
            new_leads = report.new_leads,
            status_changes = report.status_changes,
            lead_errors = report.lead_errors
        );
        Ok(report)
    }

    /// Remembered states are read before the fetch so a transition the
    /// detector has already recorded is never paired with an older row.
    pub fn process_reminders(
        &self,
        store: &LedgerStore,
        now: DateTime<Utc>,
    ) -> Result<ReminderReport, EngineError> {
        let observed = store.lead_states()?;
        let snapshot = self.fetch_snapshot()?;
        let report =
            ReminderEngine::new(self.context(store), &self.rules).run(&snapshot, &observed, now);
        info!(
            event = "reminders_processed",
            leads = snapshot.len(),
            sent = report.reminders_sent,
            skipped = report.reminders_skipped,
            lead_errors = report.lead_errors
        );
        Ok(report)
    }

    /// One detection and reminder pass over a single fetch.
    ///
    /// Leads that changed in this pass are left for the next reminder pass,
    /// when the sheet reflects the detector's writes.
    pub fn run_pass(&self, store: &LedgerStore, now: DateTime<Utc>) -> Result<PassReport, EngineError> {
        let observed = store.lead_states()?;
        let snapshot = self.fetch_snapshot()?;
        let context = self.context(store);

        let changes = ChangeDetector::new(context).apply(
            &snapshot,
            ChangeDetector::plan(&observed, &snapshot, now),
            now,
        );
        let reminders = ReminderEngine::new(context, &self.rules).run(&snapshot, &observed, now);

        let report = PassReport {
            leads_fetched: snapshot.len(),
            changes,
            reminders,
        };
        info!(
            event = "pass_completed",
            leads = report.leads_fetched,
            new_leads = report.changes.new_leads,
            status_changes = report.changes.status_changes,
            reminders_sent = report.reminders.reminders_sent,
            lead_errors = report.changes.lead_errors + report.reminders.lead_errors
        );
        Ok(report)
    }

    pub fn send_daily_report(
        &self,
        store: &LedgerStore,
        now: DateTime<Utc>,
    ) -> Result<ReportDelivery, EngineError> {
        let snapshot = self.fetch_snapshot()?;
        let text = messages::daily_report(&DailySummary::from_leads(&snapshot, now));
        self.broadcast(store, "daily_report", &text)
    }

    pub fn send_weekly_report(
        &self,
        store: &LedgerStore,
        now: DateTime<Utc>,
    ) -> Result<ReportDelivery, EngineError> {
        let snapshot = self.fetch_snapshot()?;
        let text = messages::weekly_report(&WeeklySummary::from_leads(&snapshot, now));
        self.broadcast(store, "weekly_report", &text)
    }

    fn broadcast(
        &self,
        store: &LedgerStore,
        report: &str,
        text: &str,
    ) -> Result<ReportDelivery, EngineError> {
        let admins = self.router.admins(store)?;
        if admins.is_empty() {
            warn!(event = "report_unroutable", report, "no administrators configured");
            return Ok(ReportDelivery::default());
        }
        let delivered = self.context(store).deliver(report, &admins, text);
        info!(event = "report_sent", report, recipients = admins.len(), delivered);
        Ok(ReportDelivery {
            recipients: admins.len(),
            delivered,
        })
    }
}
