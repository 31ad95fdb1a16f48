//! Core types for calendar/sheet synchronization.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the two stores kept consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Calendar,
    Sheet,
}

impl Side {
    /// The opposite side.
    pub fn other(self) -> Side {
        match self {
            Side::Calendar => Side::Sheet,
            Side::Sheet => Side::Calendar,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Calendar => "calendar",
            Side::Sheet => "sheet",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "calendar" | "cal" => Ok(Side::Calendar),
            "sheet" | "sheets" => Ok(Side::Sheet),
            other => Err(format!("unknown side: {other} (expected calendar or sheet)")),
        }
    }
}

/// Record-level sync status, stored verbatim in the sheet's `SyncStatus` column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Synced,
    Pending,
    Conflict,
    Error,
    Deleted,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Pending => "PENDING",
            SyncStatus::Conflict => "CONFLICT",
            SyncStatus::Error => "ERROR",
            SyncStatus::Deleted => "DELETED",
        }
    }

    /// Parse a status cell. Case-insensitive; surrounding whitespace ignored.
    pub fn parse(s: &str) -> Option<SyncStatus> {
        match s.trim().to_uppercase().as_str() {
            "SYNCED" => Some(SyncStatus::Synced),
            "PENDING" => Some(SyncStatus::Pending),
            "CONFLICT" => Some(SyncStatus::Conflict),
            "ERROR" => Some(SyncStatus::Error),
            "DELETED" => Some(SyncStatus::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start or end of a record: a bare date for all-day records, an instant otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTime {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl EventTime {
    pub fn is_date(&self) -> bool {
        matches!(self, EventTime::Date(_))
    }

    /// Calendar date of this time (UTC for instants).
    pub fn date(&self) -> NaiveDate {
        match self {
            EventTime::Date(d) => *d,
            EventTime::DateTime(dt) => dt.date_naive(),
        }
    }

    /// Instant used for window checks; dates start at UTC midnight.
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            EventTime::Date(d) => d.and_time(NaiveTime::MIN).and_utc(),
            EventTime::DateTime(dt) => *dt,
        }
    }
}

/// Validated value of an extension field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Cell/property text for this value. Whole numbers render without a fraction.
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Number(n) => format!("{n}"),
            FieldValue::Text(s) => s.clone(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cell())
    }
}

/// The common normalized representation of one logical event/row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Stable identifier shared by both sides.
    pub id: String,
    pub title: String,
    pub description: String,
    pub location: String,
    pub start_at: EventTime,
    pub end_at: EventTime,
    pub all_day: bool,
    /// Participant identifiers, duplicates removed, order preserved.
    pub attendees: Vec<String>,
    pub recurrence_rule: Option<String>,
    /// Registered extension fields by name.
    pub extensions: BTreeMap<String, FieldValue>,
    pub last_modified_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

impl SyncRecord {
    /// Compare everything except bookkeeping (timestamp and status).
    pub fn same_content(&self, other: &SyncRecord) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.description == other.description
            && self.location == other.location
            && self.start_at == other.start_at
            && self.end_at == other.end_at
            && self.all_day == other.all_day
            && self.attendees == other.attendees
            && self.recurrence_rule == other.recurrence_rule
            && self.extensions == other.extensions
    }

    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = status;
        self
    }
}

/// Physical position of a record on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locator {
    /// 1-based sheet row (row 1 is the header).
    Row(u32),
    /// Native calendar event reference.
    Event(String),
}

/// One entry of the persisted id → locator association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub sheet_row: Option<u32>,
    pub calendar_ref: Option<String>,
    /// `last_modified_at` seen on the calendar side when last synced.
    pub calendar_modified_at: DateTime<Utc>,
    /// `last_modified_at` seen on the sheet side when last synced.
    pub sheet_modified_at: DateTime<Utc>,
    pub status: SyncStatus,
}

impl MappingEntry {
    pub fn synced_at(&self, side: Side) -> DateTime<Utc> {
        match side {
            Side::Calendar => self.calendar_modified_at,
            Side::Sheet => self.sheet_modified_at,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.status == SyncStatus::Deleted
    }
}

/// Persisted bijection between record ids and their physical locators.
///
/// Keyed by id, so at most one entry per id exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncMapping {
    entries: BTreeMap<String, MappingEntry>,
}

impl SyncMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&MappingEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert or replace the entry for `id`.
    pub fn upsert(&mut self, id: impl Into<String>, entry: MappingEntry) {
        self.entries.insert(id.into(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<MappingEntry> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MappingEntry)> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

/// Per-pass counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCounters {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl PassCounters {
    /// True when the pass changed nothing on either side.
    pub fn is_quiet(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0 && self.conflicts == 0
    }
}

/// Bookkeeping for the last committed pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_run: PassCounters,
    pub passes_committed: u64,
}

/// Mapping and cursor, loaded and saved as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub mapping: SyncMapping,
    pub cursor: SyncCursor,
}

/// What a change operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    CreateOnSheet,
    CreateOnCalendar,
    Update { toward: Side },
    DeleteOnSheet,
    DeleteOnCalendar,
    /// Changed on both sides; must go through the resolver before writing.
    Conflict,
}

impl ChangeKind {
    /// Side the op writes to. `None` for unresolved conflicts.
    pub fn target_side(&self) -> Option<Side> {
        match self {
            ChangeKind::CreateOnSheet | ChangeKind::DeleteOnSheet => Some(Side::Sheet),
            ChangeKind::CreateOnCalendar | ChangeKind::DeleteOnCalendar => Some(Side::Calendar),
            ChangeKind::Update { toward } => Some(*toward),
            ChangeKind::Conflict => None,
        }
    }

    /// Side whose change produced the op.
    pub fn origin(&self) -> Option<Side> {
        self.target_side().map(Side::other)
    }

    pub fn is_create(&self) -> bool {
        matches!(self, ChangeKind::CreateOnSheet | ChangeKind::CreateOnCalendar)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeKind::DeleteOnSheet | ChangeKind::DeleteOnCalendar)
    }
}

/// A single proposed action for one id.
///
/// `source` carries the content to write and `target` the record currently on
/// the target side. For a conflict, `source` is the calendar record and
/// `target` the sheet record; either is absent when that side deleted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOp {
    pub id: String,
    pub kind: ChangeKind,
    pub source: Option<SyncRecord>,
    pub target: Option<SyncRecord>,
}

impl ChangeOp {
    pub fn create(toward: Side, record: SyncRecord) -> Self {
        let kind = match toward {
            Side::Sheet => ChangeKind::CreateOnSheet,
            Side::Calendar => ChangeKind::CreateOnCalendar,
        };
        Self {
            id: record.id.clone(),
            kind,
            source: Some(record),
            target: None,
        }
    }

    pub fn update(toward: Side, record: SyncRecord, current: Option<SyncRecord>) -> Self {
        Self {
            id: record.id.clone(),
            kind: ChangeKind::Update { toward },
            source: Some(record),
            target: current,
        }
    }

    /// Remove `existing` from `toward`.
    pub fn delete(toward: Side, existing: SyncRecord) -> Self {
        let kind = match toward {
            Side::Sheet => ChangeKind::DeleteOnSheet,
            Side::Calendar => ChangeKind::DeleteOnCalendar,
        };
        Self {
            id: existing.id.clone(),
            kind,
            source: None,
            target: Some(existing),
        }
    }

    pub fn conflict(
        id: impl Into<String>,
        calendar: Option<SyncRecord>,
        sheet: Option<SyncRecord>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ChangeKind::Conflict,
            source: calendar,
            target: sheet,
        }
    }

    pub fn target_side(&self) -> Option<Side> {
        self.kind.target_side()
    }
}

/// Acknowledgement returned by a store after a successful write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Where the record now lives; `None` after a removal.
    pub locator: Option<Locator>,
    /// Native modification time assigned by the store, if it sets its own.
    pub modified_at: Option<DateTime<Utc>>,
}

impl WriteAck {
    pub fn row(position: u32) -> Self {
        Self {
            locator: Some(Locator::Row(position)),
            modified_at: None,
        }
    }

    pub fn event(native_ref: impl Into<String>, modified_at: Option<DateTime<Utc>>) -> Self {
        Self {
            locator: Some(Locator::Event(native_ref.into())),
            modified_at,
        }
    }

    pub fn removed() -> Self {
        Self::default()
    }
}

/// Half-open window `[start, end)` used when listing calendar events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn around(now: DateTime<Utc>, lookback_days: u32, lookahead_days: u32) -> Self {
        Self {
            start: now - Duration::days(i64::from(lookback_days)),
            end: now + Duration::days(i64::from(lookahead_days)),
        }
    }

    pub fn contains(&self, time: &EventTime) -> bool {
        let at = time.instant();
        at >= self.start && at < self.end
    }
}

/// Per-record problem collected during a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordIssue {
    pub id: Option<String>,
    pub side: Side,
    pub message: String,
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassOutcome {
    Completed,
    /// Committed, but some ops failed or were deferred.
    Partial,
    SkippedConcurrentRun,
    Failed { cause: String },
}

/// Result of one pass, handed to reporting collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassSummary {
    pub outcome: PassOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: PassCounters,
    /// Ops left unattempted because the time budget ran out.
    pub deferred: u64,
    pub conflict_ids: Vec<String>,
    pub issues: Vec<RecordIssue>,
}

impl PassSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            outcome: PassOutcome::Completed,
            started_at,
            finished_at: started_at,
            counters: PassCounters::default(),
            deferred: 0,
            conflict_ids: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn skipped_concurrent(at: DateTime<Utc>) -> Self {
        Self {
            outcome: PassOutcome::SkippedConcurrentRun,
            ..Self::new(at)
        }
    }

    pub fn failed(started_at: DateTime<Utc>, cause: impl Into<String>) -> Self {
        Self {
            outcome: PassOutcome::Failed {
                cause: cause.into(),
            },
            finished_at: Utc::now(),
            ..Self::new(started_at)
        }
    }

    /// Whether this pass persisted new state.
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, PassOutcome::Completed | PassOutcome::Partial)
    }
}

/// Sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Malformed record: field '{field}' {reason}")]
    MalformedRecord {
        id: Option<String>,
        field: String,
        reason: String,
    },

    #[error("Validation error for '{field}': {message}")]
    Validation {
        id: Option<String>,
        field: String,
        message: String,
    },

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Permanent I/O error: {0}")]
    PermanentIo(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync lock is held by another run")]
    LockUnavailable,

    #[error("Invalid field configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::MalformedRecord {
            id: None,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Validation {
            id: None,
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the Batch Writer may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientIo(_) | SyncError::RateLimited)
    }

    /// Per-record errors are skipped and reported instead of failing the pass.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedRecord { .. } | SyncError::Validation { .. }
        )
    }

    /// Id of the offending record, when the error is record-level and it is known.
    pub fn record_id(&self) -> Option<&str> {
        match self {
            SyncError::MalformedRecord { id, .. } | SyncError::Validation { id, .. } => {
                id.as_deref()
            }
            _ => None,
        }
    }

    /// Attach the record id to a record-level error.
    pub fn for_record(self, record_id: &str) -> Self {
        if record_id.is_empty() {
            return self;
        }
        match self {
            SyncError::MalformedRecord { field, reason, .. } => SyncError::MalformedRecord {
                id: Some(record_id.to_string()),
                field,
                reason,
            },
            SyncError::Validation { field, message, .. } => SyncError::Validation {
                id: Some(record_id.to_string()),
                field,
                message,
            },
            other => other,
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
