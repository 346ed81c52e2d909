use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod collaborators;
pub mod reminders;
pub mod time;

pub use collaborators::{CollaboratorError, LeadRepository, NotificationChannel, RecipientId};
pub use reminders::{Audience, ReminderKind, ReminderSchedule};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub enum LeadStatus {
    NewLead,
    Call1Needed,
    Call1Done,
    Call2Done,
    Call3Done,
    FollowUpNeeded,
    FirstClassScheduled,
    FirstClassPending,
    FirstClassConfirmed,
    DidNotAttend,
    Completed,
    Lost,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 12] = [
        LeadStatus::NewLead,
        LeadStatus::Call1Needed,
        LeadStatus::Call1Done,
        LeadStatus::Call2Done,
        LeadStatus::Call3Done,
        LeadStatus::FollowUpNeeded,
        LeadStatus::FirstClassScheduled,
        LeadStatus::FirstClassPending,
        LeadStatus::FirstClassConfirmed,
        LeadStatus::DidNotAttend,
        LeadStatus::Completed,
        LeadStatus::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::NewLead => "New Lead",
            LeadStatus::Call1Needed => "Call #1 Needed",
            LeadStatus::Call1Done => "Call #1 Done",
            LeadStatus::Call2Done => "Call #2 Done",
            LeadStatus::Call3Done => "Call #3 Done",
            LeadStatus::FollowUpNeeded => "Follow-up Needed",
            LeadStatus::FirstClassScheduled => "First Class Scheduled",
            LeadStatus::FirstClassPending => "First Class Pending Confirmation",
            LeadStatus::FirstClassConfirmed => "First Class Confirmed",
            LeadStatus::DidNotAttend => "Did Not Attend First Class",
            LeadStatus::Completed => "Completed",
            LeadStatus::Lost => "Lost",
        }
    }

    /// Transitions into these statuses are reported to the assigned seller.
    pub fn is_significant(&self) -> bool {
        matches!(
            self,
            LeadStatus::Call1Done
                | LeadStatus::Call2Done
                | LeadStatus::Call3Done
                | LeadStatus::FirstClassScheduled
                | LeadStatus::FirstClassConfirmed
                | LeadStatus::FollowUpNeeded
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, LeadStatus::Completed | LeadStatus::Lost)
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        LeadStatus::ALL
            .into_iter()
            .find(|status| status.as_str().to_lowercase() == normalized)
            .ok_or_else(|| format!("Unknown status: {}", input.trim()))
    }
}

impl TryFrom<String> for LeadStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LeadStatus> for String {
    fn from(status: LeadStatus) -> Self {
        status.as_str().to_string()
    }
}

/// A cell as read from the external sheet.
///
/// Values that fail to parse are kept verbatim so callers can report them as
/// data errors instead of mistaking them for blank cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<T> {
    Empty,
    Value(T),
    Invalid(String),
}

impl<T> Default for FieldValue<T> {
    fn default() -> Self {
        FieldValue::Empty
    }
}

impl<T> FieldValue<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Empty)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            FieldValue::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Treats blank cells as `None` and unparsable ones as a data error.
    pub fn checked(&self, lead_id: &str, field: LeadField) -> Result<Option<&T>, LeadDataError> {
        match self {
            FieldValue::Empty => Ok(None),
            FieldValue::Value(value) => Ok(Some(value)),
            FieldValue::Invalid(raw) => Err(LeadDataError::InvalidField {
                lead_id: lead_id.to_string(),
                field,
                raw: raw.clone(),
            }),
        }
    }
}

impl FieldValue<LeadStatus> {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return FieldValue::Empty;
        }
        match raw.parse() {
            Ok(status) => FieldValue::Value(status),
            Err(_) => FieldValue::Invalid(raw.to_string()),
        }
    }
}

impl FieldValue<DateTime<Utc>> {
    pub fn parse(raw: &str) -> Self {
        match time::parse_timestamp(raw) {
            Ok(None) => FieldValue::Empty,
            Ok(Some(value)) => FieldValue::Value(value),
            Err(_) => FieldValue::Invalid(raw.trim().to_string()),
        }
    }
}

/// Writable columns of the external lead sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeadField {
    Status,
    CreatedAt,
    Call1Time,
    Call2Time,
    Call3Time,
    NextFollowup,
    FirstClassDate,
    Comment,
    LastUpdate,
}

impl LeadField {
    /// Column header used by the sheet.
    pub fn column(&self) -> &'static str {
        match self {
            LeadField::Status => "Status",
            LeadField::CreatedAt => "Created_At",
            LeadField::Call1Time => "Call_1_Time",
            LeadField::Call2Time => "Call_2_Time",
            LeadField::Call3Time => "Call_3_Time",
            LeadField::NextFollowup => "Next_Followup",
            LeadField::FirstClassDate => "First_Class_Date",
            LeadField::Comment => "Comment",
            LeadField::LastUpdate => "Last_Update",
        }
    }

    pub fn call_time(call: u8) -> Option<LeadField> {
        match call {
            1 => Some(LeadField::Call1Time),
            2 => Some(LeadField::Call2Time),
            3 => Some(LeadField::Call3Time),
            _ => None,
        }
    }
}

impl fmt::Display for LeadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

pub type FieldUpdates = BTreeMap<LeadField, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeadDataError {
    #[error("lead {lead_id}: invalid {field} value {raw:?}")]
    InvalidField {
        lead_id: String,
        field: LeadField,
        raw: String,
    },
}

/// Read-only projection of one external lead row at fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeadSnapshot {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub source: String,
    pub seller: String,
    pub status: FieldValue<LeadStatus>,
    pub created_at: FieldValue<DateTime<Utc>>,
    pub call_1_time: FieldValue<DateTime<Utc>>,
    pub call_2_time: FieldValue<DateTime<Utc>>,
    pub call_3_time: FieldValue<DateTime<Utc>>,
    pub next_followup: FieldValue<DateTime<Utc>>,
    pub first_class_date: FieldValue<DateTime<Utc>>,
    pub comment: String,
    /// Source-specific row handle, only meaningful to the repository.
    pub position: Option<u64>,
}

impl LeadSnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Text persisted as `last_status` for this snapshot.
    pub fn status_text(&self) -> &str {
        match &self.status {
            FieldValue::Empty => "",
            FieldValue::Value(status) => status.as_str(),
            FieldValue::Invalid(raw) => raw.as_str(),
        }
    }

    pub fn seller_name(&self) -> Option<&str> {
        let trimmed = self.seller.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn call_time(&self, call: u8) -> Option<&FieldValue<DateTime<Utc>>> {
        match call {
            1 => Some(&self.call_1_time),
            2 => Some(&self.call_2_time),
            3 => Some(&self.call_3_time),
            _ => None,
        }
    }
}
