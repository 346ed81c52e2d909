use chrono::{DateTime, Utc};
use leadwatch_core::{RecipientId, ReminderKind, ReminderSchedule};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const LEDGER_SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Last observed status of one lead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadStateRecord {
    pub lead_id: String,
    pub last_status: String,
    /// When `last_status` last changed.
    pub last_updated: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
}

impl LeadStateRecord {
    pub fn observed(lead_id: impl Into<String>, status: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            lead_id: lead_id.into(),
            last_status: status.into(),
            last_updated: now,
            last_checked: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderStatus {
    Pending,
    Sent,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Pending => "pending",
            ReminderStatus::Sent => "sent",
        }
    }
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "pending" => Ok(ReminderStatus::Pending),
            "sent" => Ok(ReminderStatus::Sent),
            other => Err(format!("Unknown reminder status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderEntry {
    pub lead_id: String,
    pub kind: ReminderKind,
    pub scheduled_time: String,
    pub sent_time: Option<DateTime<Utc>>,
    pub status: ReminderStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Seller,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Seller => "seller",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "seller" => Ok(UserRole::Seller),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredUser {
    pub telegram_id: RecipientId,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegisteredUser {
    fn answers_to(&self, normalized_name: &str) -> bool {
        [self.full_name.as_deref(), self.username.as_deref()]
            .into_iter()
            .flatten()
            .any(|candidate| normalize_name(candidate) == normalized_name)
    }
}

/// Idempotency ledger, lead state table and seller/admin registry.
///
/// Each instance owns one connection. Several instances may point at the same
/// database file; the `reminders` uniqueness constraint is what keeps them
/// from double-sending.
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > LEDGER_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: LEDGER_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_ledger_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_reminder_status_index.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn lead_state(&self, lead_id: &str) -> Result<Option<LeadStateRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "
                SELECT lead_id, last_status, last_updated, last_checked
                FROM lead_state
                WHERE lead_id = ?1
                ",
                [lead_id],
                lead_state_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn lead_states(&self) -> Result<BTreeMap<String, LeadStateRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT lead_id, last_status, last_updated, last_checked
            FROM lead_state
            ORDER BY lead_id ASC
            ",
        )?;

        let rows = statement.query_map([], lead_state_from_row)?;
        let mut states = BTreeMap::new();
        for row in rows {
            let record = row?;
            states.insert(record.lead_id.clone(), record);
        }
        Ok(states)
    }

    /// Overwrites the record. `last_updated` only moves when the status text
    /// actually changes.
    pub fn upsert_lead_state(&self, record: &LeadStateRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO lead_state (
                lead_id,
                last_status,
                last_updated,
                last_checked
            ) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(lead_id) DO UPDATE SET
                last_updated = CASE
                    WHEN lead_state.last_status = excluded.last_status THEN lead_state.last_updated
                    ELSE excluded.last_updated
                END,
                last_status = excluded.last_status,
                last_checked = excluded.last_checked
            ",
            params![
                record.lead_id,
                record.last_status,
                record.last_updated.to_rfc3339(),
                record.last_checked.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Freshness heartbeat. Never creates a record and never changes the
    /// remembered status, so change detection still sees every transition.
    pub fn touch_lead_state(&self, lead_id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "UPDATE lead_state SET last_checked = ?2 WHERE lead_id = ?1",
            params![lead_id, now.to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    /// Claims the right to send one reminder.
    ///
    /// Returns `true` exactly once per `(lead, kind, schedule)` across every
    /// connection to this database; the unique constraint decides.
    pub fn claim_reminder(
        &self,
        lead_id: &str,
        kind: ReminderKind,
        schedule: &ReminderSchedule,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO reminders (
                lead_id,
                reminder_type,
                scheduled_time,
                sent_time,
                status,
                created_at
            ) VALUES (?1, ?2, ?3, NULL, 'pending', ?4)
            ",
            params![lead_id, kind.as_str(), schedule.key(), now.to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    pub fn mark_reminder_sent(
        &self,
        lead_id: &str,
        kind: ReminderKind,
        schedule: &ReminderSchedule,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE reminders
            SET status = 'sent', sent_time = ?4
            WHERE lead_id = ?1 AND reminder_type = ?2 AND scheduled_time = ?3 AND status = 'pending'
            ",
            params![lead_id, kind.as_str(), schedule.key(), now.to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    pub fn reminder_entry(
        &self,
        lead_id: &str,
        kind: ReminderKind,
        schedule: &ReminderSchedule,
    ) -> Result<Option<ReminderEntry>, StorageError> {
        let entry = self
            .conn
            .query_row(
                "
                SELECT lead_id, reminder_type, scheduled_time, sent_time, status, created_at
                FROM reminders
                WHERE lead_id = ?1 AND reminder_type = ?2 AND scheduled_time = ?3
                ",
                params![lead_id, kind.as_str(), schedule.key()],
                reminder_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn reminder_entries_for_lead(&self, lead_id: &str) -> Result<Vec<ReminderEntry>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT lead_id, reminder_type, scheduled_time, sent_time, status, created_at
            FROM reminders
            WHERE lead_id = ?1
            ORDER BY id ASC
            ",
        )?;

        let rows = statement.query_map([lead_id], reminder_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Claimed reminders whose delivery never succeeded.
    pub fn undelivered_reminders(&self) -> Result<Vec<ReminderEntry>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT lead_id, reminder_type, scheduled_time, sent_time, status, created_at
            FROM reminders
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            ",
        )?;

        let rows = statement.query_map([], reminder_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn reminder_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM reminders", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Inserts or updates a registry entry, keeping the original `created_at`.
    pub fn upsert_user(&self, user: &RegisteredUser) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO users (
                telegram_id,
                username,
                full_name,
                role,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(telegram_id) DO UPDATE SET
                username = excluded.username,
                full_name = excluded.full_name,
                role = excluded.role,
                updated_at = excluded.updated_at
            ",
            params![
                user.telegram_id,
                user.username,
                user.full_name,
                user.role.as_str(),
                user.created_at.to_rfc3339(),
                user.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn users(&self) -> Result<Vec<RegisteredUser>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT telegram_id, username, full_name, role, created_at, updated_at
            FROM users
            ORDER BY telegram_id ASC
            ",
        )?;

        let rows = statement.query_map([], user_from_row)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Resolves a seller name from the sheet to a recipient.
    ///
    /// Matches full name or username, trimmed and case-insensitive. Admins can
    /// own leads too. Sellers win over admins on a tie, then the lowest id.
    pub fn find_seller_recipient(&self, name: &str) -> Result<Option<RecipientId>, StorageError> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Ok(None);
        }

        let mut matches = self
            .users()?
            .into_iter()
            .filter(|user| user.answers_to(&normalized))
            .collect::<Vec<_>>();
        matches.sort_by_key(|user| (user.role == UserRole::Admin, user.telegram_id));
        Ok(matches.first().map(|user| user.telegram_id))
    }

    pub fn admin_recipients(&self) -> Result<Vec<RecipientId>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT telegram_id FROM users WHERE role = 'admin' ORDER BY telegram_id ASC",
        )?;
        let rows = statement.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = BTreeSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids.into_iter().collect())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn lead_state_from_row(row: &Row<'_>) -> rusqlite::Result<LeadStateRecord> {
    Ok(LeadStateRecord {
        lead_id: row.get(0)?,
        last_status: row.get(1)?,
        last_updated: timestamp_column(row, 2)?,
        last_checked: timestamp_column(row, 3)?,
    })
}

fn reminder_from_row(row: &Row<'_>) -> rusqlite::Result<ReminderEntry> {
    let kind_raw: String = row.get(1)?;
    let kind = kind_raw
        .parse::<ReminderKind>()
        .map_err(|err| invalid_column(1, err))?;
    let status_raw: String = row.get(4)?;
    let status = status_raw
        .parse::<ReminderStatus>()
        .map_err(|err| invalid_column(4, err))?;
    let sent_time = row
        .get::<_, Option<String>>(3)?
        .map(parse_timestamp)
        .transpose()
        .map_err(|err| conversion_failure(3, err))?;

    Ok(ReminderEntry {
        lead_id: row.get(0)?,
        kind,
        scheduled_time: row.get(2)?,
        sent_time,
        status,
        created_at: timestamp_column(row, 5)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<RegisteredUser> {
    let role_raw: String = row.get(3)?;
    let role = role_raw
        .parse::<UserRole>()
        .map_err(|err| invalid_column(3, err))?;

    Ok(RegisteredUser {
        telegram_id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        role,
        created_at: timestamp_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get::<_, String>(index)?).map_err(|err| conversion_failure(index, err))
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    conversion_failure(index, StorageError::InvalidValue(message))
}

fn conversion_failure(index: usize, err: StorageError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
