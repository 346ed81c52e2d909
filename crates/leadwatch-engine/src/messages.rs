//! Notification text. One function per message so wording stays in one place.

use crate::reports::{DailySummary, WeeklySummary};
use chrono::{DateTime, Utc};
use leadwatch_core::time::{format_timestamp, hours_between};
use leadwatch_core::{FieldValue, LeadSnapshot, LeadStatus, ReminderKind};

fn or_na(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        "N/A"
    } else {
        trimmed
    }
}

fn header(title: &str, lead: &LeadSnapshot) -> String {
    format!(
        "{title}\n\nLead ID: {}\nName: {}\n",
        lead.id,
        or_na(&lead.name)
    )
}

fn elapsed_label(hours: f64) -> String {
    if hours < 1.0 {
        format!("{} min", (hours * 60.0).round() as i64)
    } else {
        format!("{hours:.1} h")
    }
}

pub fn new_lead(lead: &LeadSnapshot, status: &str) -> String {
    let mut text = header("New lead assigned", lead);
    text.push_str(&format!("Phone: {}\n", or_na(&lead.phone)));
    if !lead.source.trim().is_empty() {
        text.push_str(&format!("Source: {}\n", lead.source.trim()));
    }
    text.push_str(&format!("Status: {}\n\nPlease make the first call.", or_na(status)));
    text
}

pub fn status_changed(lead: &LeadSnapshot, old: &str, new: &str) -> String {
    let mut text = header("Lead status changed", lead);
    text.push_str(&format!("Was: {}\nNow: {}\n", or_na(old), or_na(new)));

    let hint = match &lead.status {
        FieldValue::Value(LeadStatus::Call1Done) => Some("Call #2 will be scheduled 2 hours after call #1."),
        FieldValue::Value(LeadStatus::Call2Done) => Some("Call #3 will be scheduled 24 hours after call #2."),
        FieldValue::Value(LeadStatus::FirstClassScheduled) => {
            Some("First class is scheduled. Reminders will follow.")
        }
        FieldValue::Value(LeadStatus::FollowUpNeeded) => Some("A follow-up is needed. Please take the next step."),
        _ => None,
    };
    if let Some(hint) = hint {
        text.push('\n');
        text.push_str(hint);
    }
    text
}

pub fn reminder(
    kind: ReminderKind,
    lead: &LeadSnapshot,
    scheduled_for: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    match kind {
        ReminderKind::Call1After1h | ReminderKind::Call1After2h => {
            let mut text = header("Reminder: call #1 needed", lead);
            text.push_str(&format!("Phone: {}\n", or_na(&lead.phone)));
            if let Some(created) = lead.created_at.value() {
                text.push_str(&format!(
                    "Waiting since creation: {}\n",
                    elapsed_label(hours_between(*created, now))
                ));
            }
            text.push_str("\nPlease make the first call.");
            text
        }
        ReminderKind::Call1Escalation => {
            let mut text = header("Escalation: call #1 overdue", lead);
            text.push_str(&format!(
                "Seller: {}\nStatus: {}\n\nCall #1 has been pending for more than 12 hours.",
                or_na(&lead.seller),
                or_na(lead.status_text())
            ));
            text
        }
        ReminderKind::Call2Scheduled | ReminderKind::Call3Scheduled => {
            let (call, gap) = if kind == ReminderKind::Call2Scheduled {
                (2, "2 hours")
            } else {
                (3, "24 hours")
            };
            let mut text = header(&format!("Call #{call} scheduled"), lead);
            if let Some(at) = scheduled_for {
                text.push_str(&format!("Scheduled for: {}\n", format_timestamp(at)));
            }
            text.push_str(&format!(
                "\nCall #{} is done. Call #{call} is set {gap} later.",
                call - 1
            ));
            text
        }
        ReminderKind::Call2Due | ReminderKind::Call3Due => {
            let call = if kind == ReminderKind::Call2Due { 2 } else { 3 };
            let mut text = header(&format!("Reminder: call #{call} is due"), lead);
            text.push_str(&format!("Phone: {}\n\nTime for call #{call}.", or_na(&lead.phone)));
            text
        }
        ReminderKind::FirstClass24h | ReminderKind::FirstClass2h => {
            let mut text = header("First class reminder", lead);
            if let Some(class) = lead.first_class_date.value() {
                text.push_str(&format!(
                    "First class: {}\nTime left: {}\n",
                    format_timestamp(*class),
                    elapsed_label(hours_between(now, *class))
                ));
            }
            text.push_str("\nPlease confirm attendance.");
            text
        }
        ReminderKind::DidNotAttend => {
            let mut text = header("Next step needed", lead);
            text.push_str("\nThe lead did not attend the first class. Please follow up.");
            text
        }
    }
}

pub fn daily_report(summary: &DailySummary) -> String {
    let mut text = format!(
        "Daily report {}\n\nTotal leads: {}\nActive: {}\nOverdue call #1 (>12h): {}\nCreated today: {}\nCreated this week: {}\n",
        summary.date.format("%Y-%m-%d"),
        summary.total,
        summary.active,
        summary.overdue,
        summary.created_today,
        summary.created_this_week,
    );
    if !summary.top_sellers.is_empty() {
        text.push_str("\nTop sellers this week:\n");
        for (name, count) in &summary.top_sellers {
            text.push_str(&format!("- {name}: {count}\n"));
        }
    }
    if !summary.overdue_leads.is_empty() {
        text.push_str("\nOverdue:\n");
        for line in &summary.overdue_leads {
            text.push_str(&format!("- {line}\n"));
        }
    }
    text.trim_end().to_string()
}

pub fn weekly_report(summary: &WeeklySummary) -> String {
    let mut text = format!(
        "Weekly report from {}\n\nLeads: {}\nCall #1 completion: {:.1}%\nCall #2 completion: {:.1}%\nCall #3 completion: {:.1}%\nConversion: {:.1}%\n",
        summary.week_start.format("%Y-%m-%d"),
        summary.total,
        summary.call1_rate,
        summary.call2_rate,
        summary.call3_rate,
        summary.conversion_rate,
    );
    if !summary.top_sellers.is_empty() {
        text.push_str("\nTop sellers by conversion:\n");
        for (index, seller) in summary.top_sellers.iter().enumerate() {
            text.push_str(&format!(
                "{}. {}: {:.1}% of {} leads\n",
                index + 1,
                seller.name,
                seller.conversion_rate,
                seller.total
            ));
        }
    }
    text.trim_end().to_string()
}
