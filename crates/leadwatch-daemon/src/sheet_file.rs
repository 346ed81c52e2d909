//! Lead sheet stored as a JSON array of rows keyed by column header.

use crate::locked_file::LockedFile;
use chrono::{DateTime, Utc};
use leadwatch_core::time::format_timestamp;
use leadwatch_core::{
    CollaboratorError, FieldUpdates, FieldValue, LeadField, LeadRepository, LeadSnapshot,
    LeadStatus,
};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

type Row = Map<String, Value>;

/// Readers and writers coordinate through a `.lock` sidecar; the sheet itself
/// is only ever replaced by renaming a fully written `.tmp` file over it.
pub struct SheetFile {
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
}

impl SheetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock_path: sidecar(&path, "lock"),
            tmp_path: sidecar(&path, "tmp"),
            path,
        }
    }

    fn read_rows(&self) -> Result<Vec<Row>, CollaboratorError> {
        let _lock = LockedFile::shared(&self.lock_path, &lock_options()).map_err(io_error)?;
        self.load_rows()
    }

    fn load_rows(&self) -> Result<Vec<Row>, CollaboratorError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => parse_rows(&contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(io_error(err)),
        }
    }

    fn write_update(
        &self,
        lead: &LeadSnapshot,
        updates: &FieldUpdates,
        now: DateTime<Utc>,
    ) -> Result<bool, CollaboratorError> {
        let _lock = LockedFile::exclusive(&self.lock_path, &lock_options()).map_err(io_error)?;
        let mut rows = self.load_rows()?;

        let Some(index) = locate(&rows, lead) else {
            return Ok(false);
        };
        let row = &mut rows[index];
        for (field, value) in updates {
            row.insert(field.column().to_string(), Value::String(value.clone()));
        }
        row.insert(
            LeadField::LastUpdate.column().to_string(),
            Value::String(format_timestamp(now)),
        );

        let rendered = serde_json::to_string_pretty(&rows)
            .map_err(|err| CollaboratorError::lead_source(err.to_string()))?;
        self.replace_contents(&rendered)?;
        Ok(true)
    }

    fn replace_contents(&self, contents: &str) -> Result<(), CollaboratorError> {
        if let Err(err) = fs::write(&self.tmp_path, contents) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(io_error(err));
        }
        fs::rename(&self.tmp_path, &self.path).map_err(io_error)
    }
}

impl LeadRepository for SheetFile {
    fn fetch_all(&self) -> Result<Vec<LeadSnapshot>, CollaboratorError> {
        Ok(self
            .read_rows()?
            .iter()
            .enumerate()
            .filter_map(|(index, row)| snapshot_from_row(index, row))
            .collect())
    }

    fn update(&self, lead: &LeadSnapshot, updates: &FieldUpdates) -> Result<bool, CollaboratorError> {
        self.write_update(lead, updates, Utc::now())
    }
}

fn lock_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    options
}

/// `leads.json` -> `leads.json.<suffix>` in the same directory.
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("leads"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Row index for `lead`: the fetched position when it still holds the same
/// id, otherwise the first row with that id.
fn locate(rows: &[Row], lead: &LeadSnapshot) -> Option<usize> {
    let lead_id = lead.id.trim();
    let matches = |row: &Row| cell(row, "ID").trim() == lead_id;
    lead.position
        .and_then(|position| usize::try_from(position).ok())
        .filter(|&index| rows.get(index).is_some_and(matches))
        .or_else(|| rows.iter().position(matches))
}

fn io_error(err: std::io::Error) -> CollaboratorError {
    CollaboratorError::lead_source(err.to_string())
}

fn parse_rows(contents: &str) -> Result<Vec<Row>, CollaboratorError> {
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(contents)
        .map_err(|err| CollaboratorError::lead_source(format!("invalid lead sheet: {err}")))
}

/// Cell text as the sheet would display it.
fn cell(row: &Row, column: &str) -> String {
    match row.get(column) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn snapshot_from_row(index: usize, row: &Row) -> Option<LeadSnapshot> {
    let id = cell(row, "ID").trim().to_string();
    if id.is_empty() {
        return None;
    }
    let time = |column: &str| FieldValue::<DateTime<Utc>>::parse(&cell(row, column));

    Some(LeadSnapshot {
        id,
        name: cell(row, "Name"),
        phone: cell(row, "Phone"),
        source: cell(row, "Lead_Source"),
        seller: cell(row, "Seller"),
        status: FieldValue::<LeadStatus>::parse(&cell(row, LeadField::Status.column())),
        created_at: time(LeadField::CreatedAt.column()),
        call_1_time: time(LeadField::Call1Time.column()),
        call_2_time: time(LeadField::Call2Time.column()),
        call_3_time: time(LeadField::Call3Time.column()),
        next_followup: time(LeadField::NextFollowup.column()),
        first_class_date: time(LeadField::FirstClassDate.column()),
        comment: cell(row, LeadField::Comment.column()),
        position: Some(index as u64),
    })
}
