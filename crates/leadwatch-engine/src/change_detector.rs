use crate::escalation::Route;
use crate::{messages, EngineError, PassContext};
use chrono::{DateTime, Utc};
use leadwatch_core::time::format_timestamp;
use leadwatch_core::{FieldUpdates, FieldValue, LeadField, LeadSnapshot, LeadStatus};
use leadwatch_storage::LeadStateRecord;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadEvent {
    NewLead {
        lead_id: String,
        needs_bootstrap: bool,
    },
    StatusChanged {
        lead_id: String,
        old: String,
        new: String,
        significant: bool,
    },
}

impl LeadEvent {
    pub fn lead_id(&self) -> &str {
        match self {
            LeadEvent::NewLead { lead_id, .. } | LeadEvent::StatusChanged { lead_id, .. } => lead_id,
        }
    }
}

/// What one lead needs after diffing against its remembered state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadChange {
    /// Position of the lead in the snapshot the plan was built from.
    pub index: usize,
    pub event: Option<LeadEvent>,
    /// Write back to the sheet that must succeed before anything else.
    pub write: Option<FieldUpdates>,
    pub state: LeadStateRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePlan {
    pub changes: Vec<LeadChange>,
    pub duplicate_ids: Vec<String>,
    pub blank_ids: usize,
}

impl ChangePlan {
    pub fn events(&self) -> impl Iterator<Item = &LeadEvent> {
        self.changes.iter().filter_map(|change| change.event.as_ref())
    }

    pub fn states(&self) -> impl Iterator<Item = &LeadStateRecord> {
        self.changes.iter().map(|change| &change.state)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeReport {
    pub leads_processed: usize,
    pub new_leads: usize,
    pub status_changes: usize,
    pub bootstrap_writes: usize,
    pub call_time_writes: usize,
    pub notifications_sent: usize,
    pub lead_errors: usize,
}

/// Call time column stamped when a lead is first seen in a call-done status.
fn call_stamp(status: &FieldValue<LeadStatus>) -> Option<LeadField> {
    match status {
        FieldValue::Value(LeadStatus::Call1Done) => Some(LeadField::Call1Time),
        FieldValue::Value(LeadStatus::Call2Done) => Some(LeadField::Call2Time),
        FieldValue::Value(LeadStatus::Call3Done) => Some(LeadField::Call3Time),
        _ => None,
    }
}

pub struct ChangeDetector<'a> {
    ctx: PassContext<'a>,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(ctx: PassContext<'a>) -> Self {
        Self { ctx }
    }

    /// Diffs `snapshot` against `previous`. Pure: no I/O happens here.
    pub fn plan(
        previous: &BTreeMap<String, LeadStateRecord>,
        snapshot: &[LeadSnapshot],
        now: DateTime<Utc>,
    ) -> ChangePlan {
        let mut plan = ChangePlan::default();
        let mut seen = BTreeSet::new();

        for (index, lead) in snapshot.iter().enumerate() {
            let lead_id = lead.id.trim();
            if lead_id.is_empty() {
                plan.blank_ids += 1;
                continue;
            }
            if !seen.insert(lead_id) {
                plan.duplicate_ids.push(lead_id.to_string());
                continue;
            }

            let current = lead.status_text();
            let change = match previous.get(lead_id) {
                None => {
                    let needs_bootstrap =
                        matches!(lead.status, FieldValue::Empty | FieldValue::Value(LeadStatus::NewLead));
                    let (status, write) = if needs_bootstrap {
                        let mut updates = FieldUpdates::new();
                        updates.insert(LeadField::Status, LeadStatus::Call1Needed.to_string());
                        updates.insert(LeadField::Call1Time, format_timestamp(now));
                        (LeadStatus::Call1Needed.as_str(), Some(updates))
                    } else {
                        (current, None)
                    };
                    LeadChange {
                        index,
                        event: Some(LeadEvent::NewLead {
                            lead_id: lead_id.to_string(),
                            needs_bootstrap,
                        }),
                        write,
                        state: LeadStateRecord::observed(lead_id, status, now),
                    }
                }
                Some(record) if record.last_status != current => {
                    let write = call_stamp(&lead.status).map(|field| {
                        let mut updates = FieldUpdates::new();
                        updates.insert(field, format_timestamp(now));
                        updates
                    });
                    LeadChange {
                        index,
                        event: Some(LeadEvent::StatusChanged {
                            lead_id: lead_id.to_string(),
                            old: record.last_status.clone(),
                            new: current.to_string(),
                            significant: matches!(&lead.status, FieldValue::Value(status) if status.is_significant()),
                        }),
                        write,
                        state: LeadStateRecord::observed(lead_id, current, now),
                    }
                }
                Some(record) => LeadChange {
                    index,
                    event: None,
                    write: None,
                    state: LeadStateRecord {
                        last_checked: now,
                        ..record.clone()
                    },
                },
            };
            plan.changes.push(change);
        }

        plan
    }

    /// Loads remembered states from the ledger, then plans and applies.
    pub fn run(&self, snapshot: &[LeadSnapshot], now: DateTime<Utc>) -> Result<ChangeReport, EngineError> {
        let previous = self.ctx.store.lead_states()?;
        Ok(self.apply(snapshot, Self::plan(&previous, snapshot, now), now))
    }

    /// Performs the plan lead by lead. A failing lead keeps its old state and
    /// is picked up again on the next pass.
    pub fn apply(&self, snapshot: &[LeadSnapshot], plan: ChangePlan, now: DateTime<Utc>) -> ChangeReport {
        for lead_id in &plan.duplicate_ids {
            warn!(event = "duplicate_lead_id", lead_id = %lead_id, "later rows ignored");
        }
        if plan.blank_ids > 0 {
            debug!(event = "blank_lead_ids", rows = plan.blank_ids);
        }

        let mut report = ChangeReport::default();
        for change in plan.changes {
            let Some(lead) = snapshot.get(change.index) else {
                continue;
            };
            match self.apply_change(lead, &change, now, &mut report) {
                Ok(()) => report.leads_processed += 1,
                Err(err) => {
                    report.lead_errors += 1;
                    warn!(
                        event = "lead_change_failed",
                        lead_id = %change.state.lead_id,
                        error = %err
                    );
                }
            }
        }
        report
    }

    fn apply_change(
        &self,
        lead: &LeadSnapshot,
        change: &LeadChange,
        now: DateTime<Utc>,
        report: &mut ChangeReport,
    ) -> Result<(), EngineError> {
        let lead_id = change.state.lead_id.as_str();
        if let FieldValue::Invalid(raw) = &lead.status {
            warn!(event = "lead_status_invalid", lead_id, status = %raw);
        }

        if let Some(updates) = &change.write {
            self.ctx.update_lead(lead, updates)?;
        }
        // Recorded before notifying: a lead whose state could not be saved is
        // seen as new again next pass and must not have been announced yet.
        self.ctx.store.upsert_lead_state(&change.state)?;

        match &change.event {
            Some(LeadEvent::NewLead { needs_bootstrap, .. }) => {
                if *needs_bootstrap {
                    report.bootstrap_writes += 1;
                }
                report.new_leads += 1;
                info!(
                    event = "new_lead",
                    lead_id,
                    status = %change.state.last_status,
                    bootstrapped = *needs_bootstrap
                );
                let text = messages::new_lead(lead, &change.state.last_status);
                report.notifications_sent += self.notify_seller(lead, &text)?;
            }
            Some(LeadEvent::StatusChanged {
                old,
                new,
                significant,
                ..
            }) => {
                if change.write.is_some() {
                    report.call_time_writes += 1;
                }
                report.status_changes += 1;
                info!(event = "status_changed", lead_id, old = %old, new = %new);
                if *significant {
                    let text = messages::status_changed(lead, old, new);
                    report.notifications_sent += self.notify_seller(lead, &text)?;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn notify_seller(&self, lead: &LeadSnapshot, text: &str) -> Result<usize, EngineError> {
        match self.ctx.router.seller(self.ctx.store, lead)? {
            Route::Recipients(recipients) => Ok(self.ctx.deliver(&lead.id, &recipients, text)),
            Route::Unroutable(reason) => {
                warn!(event = "seller_unroutable", lead_id = %lead.id, reason = %reason);
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn lead(id: &str, status: &str) -> LeadSnapshot {
        LeadSnapshot {
            status: FieldValue::<LeadStatus>::parse(status),
            ..LeadSnapshot::new(id)
        }
    }

    fn remembered(id: &str, status: &str) -> (String, LeadStateRecord) {
        (
            id.to_string(),
            LeadStateRecord::observed(id, status, now() - Duration::hours(1)),
        )
    }

    #[test]
    fn unseen_blank_lead_is_bootstrapped_to_call1_needed() {
        let plan = ChangeDetector::plan(&BTreeMap::new(), &[lead("L-1", "")], now());

        let change = &plan.changes[0];
        assert_eq!(
            change.event,
            Some(LeadEvent::NewLead {
                lead_id: "L-1".to_string(),
                needs_bootstrap: true
            })
        );
        let write = change.write.as_ref().expect("bootstrap write");
        assert_eq!(write.get(&LeadField::Status).map(String::as_str), Some("Call #1 Needed"));
        assert_eq!(
            write.get(&LeadField::Call1Time).map(String::as_str),
            Some("2026-03-04 10:00:00")
        );
        assert_eq!(change.state.last_status, "Call #1 Needed");
    }

    #[test]
    fn unseen_lead_with_working_status_is_not_rewritten() {
        let plan = ChangeDetector::plan(&BTreeMap::new(), &[lead("L-1", "Call #2 Done")], now());
        assert_eq!(plan.changes[0].write, None);
        assert_eq!(plan.changes[0].state.last_status, "Call #2 Done");
    }

    #[test]
    fn transition_into_call_done_stamps_the_call_time() {
        let previous = BTreeMap::from([remembered("L-1", "Call #1 Needed")]);
        let plan = ChangeDetector::plan(&previous, &[lead("L-1", "call #1 done")], now());

        let change = &plan.changes[0];
        assert_eq!(
            change.event,
            Some(LeadEvent::StatusChanged {
                lead_id: "L-1".to_string(),
                old: "Call #1 Needed".to_string(),
                new: "Call #1 Done".to_string(),
                significant: true
            })
        );
        assert!(change
            .write
            .as_ref()
            .expect("stamp")
            .contains_key(&LeadField::Call1Time));
        assert_eq!(change.state.last_updated, now());
    }

    #[test]
    fn silent_transitions_and_unchanged_leads() {
        let previous = BTreeMap::from([
            remembered("L-1", "Call #3 Done"),
            remembered("L-2", "First Class Confirmed"),
        ]);
        let snapshot = [lead("L-1", "Lost"), lead("L-2", "First Class Confirmed")];
        let plan = ChangeDetector::plan(&previous, &snapshot, now());

        assert!(matches!(
            plan.changes[0].event,
            Some(LeadEvent::StatusChanged { significant: false, .. })
        ));
        assert_eq!(plan.changes[0].write, None);

        assert_eq!(plan.changes[1].event, None);
        assert_eq!(plan.changes[1].state.last_checked, now());
        assert_eq!(plan.changes[1].state.last_updated, now() - Duration::hours(1));
        assert_eq!(plan.events().count(), 1);
        assert_eq!(plan.states().count(), 2);
    }

    #[test]
    fn duplicate_and_blank_ids_are_set_aside() {
        let snapshot = [
            lead("L-1", "Call #1 Needed"),
            lead(" ", "Call #1 Needed"),
            lead("L-1", "Lost"),
        ];
        let plan = ChangeDetector::plan(&BTreeMap::new(), &snapshot, now());

        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].index, 0);
        assert_eq!(plan.duplicate_ids, vec!["L-1".to_string()]);
        assert_eq!(plan.blank_ids, 1);
    }

    #[test]
    fn invalid_status_text_is_compared_verbatim() {
        let previous = BTreeMap::from([remembered("L-1", "Paused")]);
        let plan = ChangeDetector::plan(&previous, &[lead("L-1", "Paused")], now());
        assert_eq!(plan.changes[0].event, None);
    }
}
