use crate::time::format_timestamp;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger key used for reminders that fire once per lead.
pub const ONCE_SCHEDULE: &str = "once";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    #[serde(rename = "call1_1h")]
    Call1After1h,
    #[serde(rename = "call1_2h")]
    Call1After2h,
    #[serde(rename = "call1_12h")]
    Call1Escalation,
    Call2Scheduled,
    Call2Due,
    Call3Scheduled,
    Call3Due,
    #[serde(rename = "first_class_24h")]
    FirstClass24h,
    #[serde(rename = "first_class_2h")]
    FirstClass2h,
    DidNotAttend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Seller,
    Admins,
}

impl ReminderKind {
    pub const ALL: [ReminderKind; 10] = [
        ReminderKind::Call1After1h,
        ReminderKind::Call1After2h,
        ReminderKind::Call1Escalation,
        ReminderKind::Call2Scheduled,
        ReminderKind::Call2Due,
        ReminderKind::Call3Scheduled,
        ReminderKind::Call3Due,
        ReminderKind::FirstClass24h,
        ReminderKind::FirstClass2h,
        ReminderKind::DidNotAttend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderKind::Call1After1h => "call1_1h",
            ReminderKind::Call1After2h => "call1_2h",
            ReminderKind::Call1Escalation => "call1_12h",
            ReminderKind::Call2Scheduled => "call2_scheduled",
            ReminderKind::Call2Due => "call2_due",
            ReminderKind::Call3Scheduled => "call3_scheduled",
            ReminderKind::Call3Due => "call3_due",
            ReminderKind::FirstClass24h => "first_class_24h",
            ReminderKind::FirstClass2h => "first_class_2h",
            ReminderKind::DidNotAttend => "did_not_attend",
        }
    }

    pub fn audience(&self) -> Audience {
        match self {
            ReminderKind::Call1Escalation => Audience::Admins,
            _ => Audience::Seller,
        }
    }

    /// Offset from the rule's basis timestamp to its scheduled time.
    ///
    /// `None` for kinds whose schedule is not a fixed offset.
    pub fn offset(&self) -> Option<Duration> {
        match self {
            ReminderKind::Call1After1h => Some(Duration::hours(1)),
            ReminderKind::Call1After2h => Some(Duration::hours(2)),
            ReminderKind::Call1Escalation => Some(Duration::hours(12)),
            ReminderKind::Call2Scheduled | ReminderKind::Call2Due => Some(Duration::hours(2)),
            ReminderKind::Call3Scheduled | ReminderKind::Call3Due => Some(Duration::hours(24)),
            ReminderKind::FirstClass24h => Some(-Duration::hours(24)),
            ReminderKind::FirstClass2h => Some(-Duration::hours(2)),
            ReminderKind::DidNotAttend => None,
        }
    }
}

impl fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim();
        ReminderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown reminder kind: {normalized}"))
    }
}

/// The logical time a reminder belongs to; part of the ledger key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReminderSchedule {
    At(DateTime<Utc>),
    Once,
}

impl ReminderSchedule {
    /// Second-granular key text, so late polls map to the same ledger row.
    pub fn key(&self) -> String {
        match self {
            ReminderSchedule::At(ts) => format_timestamp(*ts),
            ReminderSchedule::Once => ONCE_SCHEDULE.to_string(),
        }
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            ReminderSchedule::At(ts) => Some(*ts),
            ReminderSchedule::Once => None,
        }
    }
}

impl fmt::Display for ReminderSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn kinds_roundtrip_through_ledger_text() {
        for kind in ReminderKind::ALL {
            assert_eq!(kind.as_str().parse::<ReminderKind>(), Ok(kind));
        }
        assert_eq!(
            serde_json::to_string(&ReminderKind::Call1Escalation).expect("serialize"),
            "\"call1_12h\""
        );
        assert_eq!(
            serde_json::to_string(&ReminderKind::Call2Due).expect("serialize"),
            "\"call2_due\""
        );
    }

    #[test]
    fn only_the_twelve_hour_escalation_goes_to_admins() {
        let admin_kinds = ReminderKind::ALL
            .into_iter()
            .filter(|kind| kind.audience() == Audience::Admins)
            .collect::<Vec<_>>();
        assert_eq!(admin_kinds, vec![ReminderKind::Call1Escalation]);
    }

    #[test]
    fn schedule_key_drops_subseconds() {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 4, 10, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::milliseconds(999);
        assert_eq!(ReminderSchedule::At(at).key(), "2026-03-04 10:00:00");
        assert_eq!(ReminderSchedule::Once.key(), "once");
    }
}
