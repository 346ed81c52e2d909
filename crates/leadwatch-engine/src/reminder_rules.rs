//! Time-threshold reminders keyed by a lead's current status.
//!
//! Planning is pure. Sending goes through the ledger claim: a reminder is
//! dispatched only by the caller whose insert created the ledger row.

use crate::escalation::Route;
use crate::{messages, EngineError, PassContext};
use chrono::{DateTime, Duration, Utc};
use leadwatch_core::time::{format_timestamp, within_window};
use leadwatch_core::{
    FieldUpdates, FieldValue, LeadDataError, LeadField, LeadSnapshot, LeadStatus, ReminderKind,
    ReminderSchedule,
};
use leadwatch_storage::LeadStateRecord;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderRules {
    /// Half-width of the window around 24 hours before the first class.
    pub first_class_24h_tolerance: Duration,
    /// Half-width of the window around 2 hours before the first class.
    pub first_class_2h_tolerance: Duration,
}

impl Default for ReminderRules {
    fn default() -> Self {
        Self {
            first_class_24h_tolerance: Duration::hours(1),
            first_class_2h_tolerance: Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderAction {
    /// Write the next call time to the sheet, then tell the seller once.
    ScheduleCall {
        kind: ReminderKind,
        scheduled_for: DateTime<Utc>,
        updates: FieldUpdates,
    },
    Remind {
        kind: ReminderKind,
        schedule: ReminderSchedule,
    },
}

impl ReminderAction {
    pub fn kind(&self) -> ReminderKind {
        match self {
            ReminderAction::ScheduleCall { kind, .. } | ReminderAction::Remind { kind, .. } => *kind,
        }
    }
}

struct CallStep {
    basis_field: LeadField,
    next_call: u8,
    scheduled: ReminderKind,
    due: ReminderKind,
}

const CALL2_STEP: CallStep = CallStep {
    basis_field: LeadField::Call1Time,
    next_call: 2,
    scheduled: ReminderKind::Call2Scheduled,
    due: ReminderKind::Call2Due,
};

const CALL3_STEP: CallStep = CallStep {
    basis_field: LeadField::Call2Time,
    next_call: 3,
    scheduled: ReminderKind::Call3Scheduled,
    due: ReminderKind::Call3Due,
};

impl ReminderRules {
    pub fn plan(&self, lead: &LeadSnapshot, now: DateTime<Utc>) -> Result<Vec<ReminderAction>, LeadDataError> {
        let Some(status) = lead.status.checked(&lead.id, LeadField::Status)? else {
            return Ok(Vec::new());
        };

        match status {
            LeadStatus::Call1Needed => self.call1_needed(lead, now),
            LeadStatus::Call1Done => self.call_done(lead, &CALL2_STEP, now),
            LeadStatus::Call2Done => self.call_done(lead, &CALL3_STEP, now),
            LeadStatus::FirstClassPending => self.first_class(lead, now),
            LeadStatus::DidNotAttend => Ok(vec![ReminderAction::Remind {
                kind: ReminderKind::DidNotAttend,
                schedule: ReminderSchedule::Once,
            }]),
            _ => Ok(Vec::new()),
        }
    }

    /// Every threshold already passed fires, oldest first. The bootstrap call
    /// stamp stands in when the sheet has no creation time.
    fn call1_needed(&self, lead: &LeadSnapshot, now: DateTime<Utc>) -> Result<Vec<ReminderAction>, LeadDataError> {
        let created = match lead.created_at.checked(&lead.id, LeadField::CreatedAt)? {
            Some(created) => *created,
            None => match lead.call_1_time.checked(&lead.id, LeadField::Call1Time)? {
                Some(stamped) => *stamped,
                None => return Ok(Vec::new()),
            },
        };

        Ok([
            ReminderKind::Call1After1h,
            ReminderKind::Call1After2h,
            ReminderKind::Call1Escalation,
        ]
        .into_iter()
        .filter_map(|kind| {
            let at = created + kind.offset()?;
            (now >= at).then_some(ReminderAction::Remind {
                kind,
                schedule: ReminderSchedule::At(at),
            })
        })
        .collect())
    }

    fn call_done(
        &self,
        lead: &LeadSnapshot,
        step: &CallStep,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReminderAction>, LeadDataError> {
        let next_field = LeadField::call_time(step.next_call).unwrap_or(LeadField::Call3Time);
        let next_value = lead
            .call_time(step.next_call)
            .map(|value| value.checked(&lead.id, next_field))
            .transpose()?
            .flatten();

        if let Some(next_at) = next_value {
            return Ok(if now >= *next_at {
                vec![ReminderAction::Remind {
                    kind: step.due,
                    schedule: ReminderSchedule::At(*next_at),
                }]
            } else {
                Vec::new()
            });
        }

        let basis_value = lead
            .call_time(step.next_call - 1)
            .map(|value| value.checked(&lead.id, step.basis_field))
            .transpose()?
            .flatten()
            .copied();

        let mut updates = FieldUpdates::new();
        let basis = match basis_value {
            Some(basis) => basis,
            None => {
                updates.insert(step.basis_field, format_timestamp(now));
                now
            }
        };
        let offset = step.scheduled.offset().unwrap_or_else(Duration::zero);
        let scheduled_for = basis + offset;
        updates.insert(next_field, format_timestamp(scheduled_for));

        Ok(vec![ReminderAction::ScheduleCall {
            kind: step.scheduled,
            scheduled_for,
            updates,
        }])
    }

    fn first_class(&self, lead: &LeadSnapshot, now: DateTime<Utc>) -> Result<Vec<ReminderAction>, LeadDataError> {
        let Some(class_at) = lead
            .first_class_date
            .checked(&lead.id, LeadField::FirstClassDate)?
            .copied()
        else {
            return Ok(Vec::new());
        };

        let windows = [
            (ReminderKind::FirstClass24h, self.first_class_24h_tolerance),
            (ReminderKind::FirstClass2h, self.first_class_2h_tolerance),
        ];
        Ok(windows
            .into_iter()
            .filter_map(|(kind, tolerance)| {
                let lead_time = -kind.offset()?;
                within_window(now, class_at, lead_time, tolerance).then_some(ReminderAction::Remind {
                    kind,
                    schedule: ReminderSchedule::At(class_at - lead_time),
                })
            })
            .collect())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReminderReport {
    pub leads_evaluated: usize,
    /// Leads whose current status the change detector has not recorded yet.
    pub leads_deferred: usize,
    pub call_writes: usize,
    pub reminders_sent: usize,
    /// Claim already held by an earlier or concurrent pass.
    pub reminders_skipped: usize,
    pub reminders_dropped: usize,
    pub delivery_failures: usize,
    pub lead_errors: usize,
}

pub struct ReminderEngine<'a> {
    ctx: PassContext<'a>,
    rules: &'a ReminderRules,
}

impl<'a> ReminderEngine<'a> {
    pub fn new(ctx: PassContext<'a>, rules: &'a ReminderRules) -> Self {
        Self { ctx, rules }
    }

    /// Evaluates every lead whose current status matches `observed`.
    pub fn run(
        &self,
        snapshot: &[LeadSnapshot],
        observed: &BTreeMap<String, LeadStateRecord>,
        now: DateTime<Utc>,
    ) -> ReminderReport {
        let mut report = ReminderReport::default();
        let mut seen = BTreeSet::new();

        for lead in snapshot {
            let lead_id = lead.id.trim();
            if lead_id.is_empty() || !seen.insert(lead_id) {
                continue;
            }

            let recorded = observed
                .get(lead_id)
                .is_some_and(|record| record.last_status == lead.status_text());
            if !recorded {
                report.leads_deferred += 1;
                debug!(event = "reminders_deferred", lead_id);
                continue;
            }

            report.leads_evaluated += 1;
            if let Err(err) = self.process_lead(lead, now, &mut report) {
                report.lead_errors += 1;
                warn!(event = "lead_reminders_failed", lead_id, error = %err);
            }
        }

        report
    }

    pub fn process_lead(
        &self,
        lead: &LeadSnapshot,
        now: DateTime<Utc>,
        report: &mut ReminderReport,
    ) -> Result<(), EngineError> {
        let lead_id = lead.id.trim();
        for action in self.rules.plan(lead, now)? {
            match action {
                ReminderAction::ScheduleCall {
                    kind,
                    scheduled_for,
                    updates,
                } => {
                    self.ctx.update_lead(lead, &updates)?;
                    report.call_writes += 1;
                    info!(
                        event = "call_scheduled",
                        lead_id,
                        kind = %kind,
                        at = %format_timestamp(scheduled_for)
                    );
                    self.remind(lead, kind, ReminderSchedule::At(scheduled_for), now, report)?;
                }
                ReminderAction::Remind { kind, schedule } => {
                    self.remind(lead, kind, schedule, now, report)?;
                }
            }
        }

        self.ctx.store.touch_lead_state(lead_id, now)?;
        Ok(())
    }

    fn remind(
        &self,
        lead: &LeadSnapshot,
        kind: ReminderKind,
        schedule: ReminderSchedule,
        now: DateTime<Utc>,
        report: &mut ReminderReport,
    ) -> Result<(), EngineError> {
        let lead_id = lead.id.trim();
        if !self.ctx.store.claim_reminder(lead_id, kind, &schedule, now)? {
            report.reminders_skipped += 1;
            debug!(event = "reminder_already_claimed", lead_id, kind = %kind, schedule = %schedule);
            return Ok(());
        }

        let recipients = match self.ctx.router.route(self.ctx.store, kind, lead)? {
            Route::Recipients(recipients) => recipients,
            Route::Unroutable(reason) => {
                report.reminders_dropped += 1;
                warn!(event = "reminder_unroutable", lead_id, kind = %kind, reason = %reason);
                return Ok(());
            }
        };

        let text = messages::reminder(kind, lead, schedule.at(), now);
        if self.ctx.deliver(lead_id, &recipients, &text) == 0 {
            report.delivery_failures += 1;
            return Ok(());
        }

        self.ctx.store.mark_reminder_sent(lead_id, kind, &schedule, now)?;
        report.reminders_sent += 1;
        info!(
            event = "reminder_sent",
            lead_id,
            kind = %kind,
            schedule = %schedule,
            recipients = recipients.len()
        );
        Ok(())
    }
}
