use crate::locked_file::LockedFile;
use chrono::{DateTime, Utc};
use leadwatch_core::{CollaboratorError, NotificationChannel, RecipientId};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub recipient: RecipientId,
    pub text: String,
    pub queued_at: DateTime<Utc>,
}

/// Notification channel that appends one JSON line per message for a
/// delivery worker to pick up.
pub struct OutboxFile {
    path: PathBuf,
}

impl OutboxFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, message: &OutboxMessage) -> Result<(), CollaboratorError> {
        let mut line = serde_json::to_string(message)
            .map_err(|err| CollaboratorError::notifications(err.to_string()))?;
        line.push('\n');

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        let mut locked = LockedFile::exclusive(&self.path, &options)
            .map_err(|err| CollaboratorError::notifications(err.to_string()))?;
        locked
            .file
            .write_all(line.as_bytes())
            .map_err(|err| CollaboratorError::notifications(err.to_string()))
    }
}

impl NotificationChannel for OutboxFile {
    fn send(&self, recipient: RecipientId, text: &str) -> Result<(), CollaboratorError> {
        self.append(&OutboxMessage {
            recipient,
            text: text.to_string(),
            queued_at: Utc::now(),
        })
    }
}
