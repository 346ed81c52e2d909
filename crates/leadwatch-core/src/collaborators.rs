use crate::{FieldUpdates, LeadSnapshot};
use std::fmt;
use thiserror::Error;

/// Chat identifier a notification is delivered to.
pub type RecipientId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorKind {
    LeadSource,
    Notifications,
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CollaboratorKind::LeadSource => "lead source",
            CollaboratorKind::Notifications => "notifications",
        })
    }
}

/// A failed call into an external collaborator. Always treated as transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct CollaboratorError {
    pub kind: CollaboratorKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn lead_source(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorKind::LeadSource,
            message: message.into(),
        }
    }

    pub fn notifications(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorKind::Notifications,
            message: message.into(),
        }
    }
}

/// The external lead sheet. Read-all and point-update only; no change feed.
pub trait LeadRepository: Send + Sync {
    fn fetch_all(&self) -> Result<Vec<LeadSnapshot>, CollaboratorError>;

    /// Writes `updates` to the row of `lead` and stamps its last-update
    /// column. `lead.position` is a hint from the fetch that produced `lead`;
    /// the id decides. Returns `Ok(false)` when the lead no longer exists.
    fn update(&self, lead: &LeadSnapshot, updates: &FieldUpdates) -> Result<bool, CollaboratorError>;
}

/// Best-effort message delivery.
pub trait NotificationChannel: Send + Sync {
    fn send(&self, recipient: RecipientId, text: &str) -> Result<(), CollaboratorError>;
}
