//! Encoding/decoding between native calendar events, sheet rows and [`SyncRecord`].
//!
//! Both directions are pure. Missing required fields raise
//! [`SyncError::MalformedRecord`]; nothing is coerced silently.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::fields::FieldValidator;
use crate::sync::types::{EventTime, SyncError, SyncRecord, SyncResult, SyncStatus};

/// Private property carrying the sync id when it differs from the native event id.
pub const SYNC_ID_PROPERTY: &str = "calsync_id";

/// Prefix of private properties carrying extension values.
pub const EXTENSION_PROPERTY_PREFIX: &str = "calsync_";

/// Header row of the sheet. Order and text are a compatibility contract.
pub const SHEET_HEADERS: [&str; 15] = [
    "EventID",
    "Title",
    "StartDate",
    "StartTime",
    "EndDate",
    "EndTime",
    "AllDay",
    "Description",
    "Location",
    "Attendees",
    "Recurrence",
    "Priority",
    "LastModified",
    "SyncStatus",
    "Notes",
];

/// Columns available as extension-field slots.
pub const EXTENSION_COLUMNS: [&str; 2] = ["Priority", "Notes"];

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Sheet column positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    EventId,
    Title,
    StartDate,
    StartTime,
    EndDate,
    EndTime,
    AllDay,
    Description,
    Location,
    Attendees,
    Recurrence,
    Priority,
    LastModified,
    SyncStatus,
    Notes,
}

impl Column {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn header(self) -> &'static str {
        SHEET_HEADERS[self.index()]
    }
}

/// Position of a header in the fixed schema.
pub fn column_index(header: &str) -> Option<usize> {
    SHEET_HEADERS.iter().position(|h| *h == header)
}

// ============================================================================
// Native calendar event
// ============================================================================

/// Calendar event as exchanged with the calendar store (Google Calendar shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    /// Native event reference. Empty for events not yet created.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: EventDateTime,
    pub end: EventDateTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<Attendee>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "ExtendedProperties::is_empty")]
    pub extended_properties: ExtendedProperties,
}

impl CalendarEvent {
    /// Start time, timed taking precedence. `None` when neither is set.
    pub fn start_time(&self) -> Option<EventTime> {
        match (self.start.date, self.start.date_time) {
            (_, Some(dt)) => Some(EventTime::DateTime(dt)),
            (Some(d), None) => Some(EventTime::Date(d)),
            (None, None) => None,
        }
    }
}

/// Either `date` (all-day) or `dateTime` (timed) is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<Utc>>,
}

impl EventDateTime {
    pub fn from_time(time: &EventTime) -> Self {
        match time {
            EventTime::Date(d) => Self {
                date: Some(*d),
                date_time: None,
            },
            EventTime::DateTime(dt) => Self {
                date: None,
                date_time: Some(*dt),
            },
        }
    }

    fn to_time(&self, field: &str) -> SyncResult<EventTime> {
        match (self.date, self.date_time) {
            (Some(d), None) => Ok(EventTime::Date(d)),
            (None, Some(dt)) => Ok(EventTime::DateTime(dt)),
            (Some(_), Some(_)) => Err(SyncError::malformed(field, "has both date and dateTime")),
            (None, None) => Err(SyncError::malformed(field, "has neither date nor dateTime")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedProperties {
    #[serde(default)]
    pub private: BTreeMap<String, String>,
}

impl ExtendedProperties {
    pub fn is_empty(&self) -> bool {
        self.private.is_empty()
    }
}

// ============================================================================
// Native sheet row
// ============================================================================

/// One data row of the sheet, cells in [`SHEET_HEADERS`] order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    /// 1-based row number; `None` for rows not yet written.
    pub position: Option<u32>,
    pub cells: Vec<String>,
}

impl SheetRow {
    pub fn new(position: Option<u32>, cells: Vec<String>) -> Self {
        Self { position, cells }
    }

    pub fn empty(position: Option<u32>) -> Self {
        Self::new(position, vec![String::new(); SHEET_HEADERS.len()])
    }

    /// Cell text; missing trailing cells read as empty.
    pub fn cell(&self, column: Column) -> &str {
        self.cell_at(column.index())
    }

    pub fn cell_at(&self, index: usize) -> &str {
        self.cells.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, column: Column, value: impl Into<String>) {
        let index = column.index();
        if self.cells.len() <= index {
            self.cells.resize(SHEET_HEADERS.len().max(index + 1), String::new());
        }
        self.cells[index] = value.into();
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.trim().is_empty())
    }
}

// ============================================================================
// Calendar <-> record
// ============================================================================

/// Convert a native calendar event to a record.
pub fn calendar_event_to_record(
    event: &CalendarEvent,
    validator: &FieldValidator,
) -> SyncResult<SyncRecord> {
    let props = &event.extended_properties.private;
    let id = event_sync_id(event).to_string();
    if id.trim().is_empty() {
        return Err(SyncError::malformed("id", "event has no identifier"));
    }

    let start_at = event.start.to_time("start").map_err(|e| e.for_record(&id))?;
    let end_at = event.end.to_time("end").map_err(|e| e.for_record(&id))?;
    let all_day = check_span(&start_at, &end_at).map_err(|e| e.for_record(&id))?;

    let mut extensions = BTreeMap::new();
    for def in validator.definitions() {
        let key = extension_property(&def.name);
        let value = validator
            .validate(&def.name, props.get(&key).map(String::as_str))
            .map_err(|e| e.for_record(&id))?;
        extensions.insert(def.name.clone(), value);
    }

    Ok(SyncRecord {
        id,
        title: event.summary.clone(),
        description: event.description.clone().unwrap_or_default(),
        location: event.location.clone().unwrap_or_default(),
        start_at,
        end_at,
        all_day,
        attendees: dedup_attendees(event.attendees.iter().map(|a| a.email.as_str())),
        recurrence_rule: if event.recurrence.is_empty() {
            None
        } else {
            Some(event.recurrence.join("\n"))
        },
        extensions,
        last_modified_at: event.updated,
        sync_status: SyncStatus::Synced,
    })
}

/// Project a record onto a native calendar event.
///
/// `native_ref` is the existing event's id; `None` produces an event the
/// store has yet to create.
pub fn record_to_calendar_event(record: &SyncRecord, native_ref: Option<&str>) -> CalendarEvent {
    let mut private = BTreeMap::new();
    if native_ref != Some(record.id.as_str()) {
        private.insert(SYNC_ID_PROPERTY.to_string(), record.id.clone());
    }
    for (name, value) in &record.extensions {
        private.insert(extension_property(name), value.to_cell());
    }

    CalendarEvent {
        id: native_ref.unwrap_or_default().to_string(),
        summary: record.title.clone(),
        description: non_empty(&record.description),
        location: non_empty(&record.location),
        start: EventDateTime::from_time(&record.start_at),
        end: EventDateTime::from_time(&record.end_at),
        attendees: record
            .attendees
            .iter()
            .map(|email| Attendee {
                email: email.clone(),
            })
            .collect(),
        recurrence: record
            .recurrence_rule
            .as_deref()
            .map(|r| r.lines().map(str::to_string).collect())
            .unwrap_or_default(),
        updated: record.last_modified_at,
        extended_properties: ExtendedProperties { private },
    }
}

// ============================================================================
// Sheet <-> record
// ============================================================================

/// Convert a sheet row to a record.
pub fn sheet_row_to_record(row: &SheetRow, validator: &FieldValidator) -> SyncResult<SyncRecord> {
    let id = row.cell(Column::EventId).trim().to_string();
    if id.is_empty() {
        return Err(SyncError::malformed(Column::EventId.header(), "is empty"));
    }
    let tag = |e: SyncError| e.for_record(&id);

    let all_day = parse_bool(row.cell(Column::AllDay)).map_err(tag)?;
    let start_at = parse_sheet_time(row, Column::StartDate, Column::StartTime, all_day).map_err(tag)?;
    let end_at = parse_sheet_time(row, Column::EndDate, Column::EndTime, all_day).map_err(tag)?;
    check_span(&start_at, &end_at).map_err(tag)?;

    let mut extensions = BTreeMap::new();
    for def in validator.definitions() {
        let raw = column_index(&def.slot).map(|i| row.cell_at(i));
        let value = validator.validate(&def.name, raw).map_err(tag)?;
        extensions.insert(def.name.clone(), value);
    }

    let modified = row.cell(Column::LastModified).trim();
    if modified.is_empty() {
        return Err(tag(SyncError::malformed(Column::LastModified.header(), "is empty")));
    }
    let last_modified_at = DateTime::parse_from_rfc3339(modified)
        .map_err(|e| {
            tag(SyncError::malformed(
                Column::LastModified.header(),
                format!("is not an RFC 3339 timestamp: {e}"),
            ))
        })?
        .with_timezone(&Utc);

    let status_cell = row.cell(Column::SyncStatus);
    let sync_status = if status_cell.trim().is_empty() {
        SyncStatus::Pending
    } else {
        SyncStatus::parse(status_cell).ok_or_else(|| {
            tag(SyncError::malformed(
                Column::SyncStatus.header(),
                format!("has unknown value '{status_cell}'"),
            ))
        })?
    };

    let recurrence = row.cell(Column::Recurrence);

    Ok(SyncRecord {
        id,
        title: row.cell(Column::Title).to_string(),
        description: row.cell(Column::Description).to_string(),
        location: row.cell(Column::Location).to_string(),
        start_at,
        end_at,
        all_day,
        attendees: dedup_attendees(row.cell(Column::Attendees).split(',')),
        recurrence_rule: non_empty(recurrence),
        extensions,
        last_modified_at,
        sync_status,
    })
}

/// Project a record onto a sheet row at `position` (`None` appends).
///
/// Extension values land in the column named by their definition's slot.
pub fn record_to_sheet_row(
    record: &SyncRecord,
    position: Option<u32>,
    validator: &FieldValidator,
) -> SheetRow {
    let mut row = SheetRow::empty(position);
    let (start_date, start_time) = sheet_cells(&record.start_at);
    let (end_date, end_time) = sheet_cells(&record.end_at);

    row.set(Column::EventId, record.id.clone());
    row.set(Column::Title, record.title.clone());
    row.set(Column::StartDate, start_date);
    row.set(Column::StartTime, start_time);
    row.set(Column::EndDate, end_date);
    row.set(Column::EndTime, end_time);
    row.set(Column::AllDay, if record.all_day { "TRUE" } else { "FALSE" });
    row.set(Column::Description, record.description.clone());
    row.set(Column::Location, record.location.clone());
    row.set(Column::Attendees, record.attendees.join(", "));
    row.set(Column::Recurrence, record.recurrence_rule.clone().unwrap_or_default());
    row.set(
        Column::LastModified,
        record.last_modified_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    );
    row.set(Column::SyncStatus, record.sync_status.as_str());

    for (name, value) in &record.extensions {
        let slot = validator
            .definition(name)
            .and_then(|def| column_index(&def.slot));
        if let Some(index) = slot {
            row.cells[index] = value.to_cell();
        }
    }
    row
}

// ============================================================================
// Helpers
// ============================================================================

/// Sync id of a native event: the private property if set, else its native id.
pub fn event_sync_id(event: &CalendarEvent) -> &str {
    event
        .extended_properties
        .private
        .get(SYNC_ID_PROPERTY)
        .map(String::as_str)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(&event.id)
}

pub fn extension_property(field_name: &str) -> String {
    format!("{EXTENSION_PROPERTY_PREFIX}{field_name}")
}

/// Both ends must agree on all-day vs timed, and the end must not precede the start.
fn check_span(start: &EventTime, end: &EventTime) -> SyncResult<bool> {
    if start.is_date() != end.is_date() {
        return Err(SyncError::malformed("end", "mixes all-day and timed values"));
    }
    if end.instant() < start.instant() {
        return Err(SyncError::malformed("end", "is before start"));
    }
    Ok(start.is_date())
}

fn dedup_attendees<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for email in raw.map(str::trim).filter(|e| !e.is_empty()) {
        if !out.iter().any(|seen| seen == email) {
            out.push(email.to_string());
        }
    }
    out
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_bool(cell: &str) -> SyncResult<bool> {
    match cell.trim().to_uppercase().as_str() {
        "TRUE" | "YES" | "1" => Ok(true),
        "FALSE" | "NO" | "0" | "" => Ok(false),
        other => Err(SyncError::malformed(
            Column::AllDay.header(),
            format!("has non-boolean value '{other}'"),
        )),
    }
}

fn parse_sheet_time(
    row: &SheetRow,
    date_col: Column,
    time_col: Column,
    all_day: bool,
) -> SyncResult<EventTime> {
    let date_cell = row.cell(date_col).trim();
    if date_cell.is_empty() {
        return Err(SyncError::malformed(date_col.header(), "is empty"));
    }
    let date = NaiveDate::parse_from_str(date_cell, DATE_FORMAT).map_err(|_| {
        SyncError::malformed(date_col.header(), format!("'{date_cell}' is not YYYY-MM-DD"))
    })?;

    let time_cell = row.cell(time_col).trim();
    if all_day {
        if !time_cell.is_empty() {
            return Err(SyncError::malformed(time_col.header(), "must be empty on all-day rows"));
        }
        return Ok(EventTime::Date(date));
    }

    if time_cell.is_empty() {
        return Err(SyncError::malformed(time_col.header(), "is empty on a timed row"));
    }
    let time = NaiveTime::parse_from_str(time_cell, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time_cell, "%H:%M:%S"))
        .map_err(|_| {
            SyncError::malformed(time_col.header(), format!("'{time_cell}' is not HH:MM"))
        })?;
    Ok(EventTime::DateTime(date.and_time(time).and_utc()))
}

fn sheet_cells(time: &EventTime) -> (String, String) {
    match time {
        EventTime::Date(d) => (d.format(DATE_FORMAT).to_string(), String::new()),
        EventTime::DateTime(dt) => {
            let clock = if dt.second() == 0 {
                dt.format("%H:%M")
            } else {
                dt.format("%H:%M:%S")
            };
            (dt.format(DATE_FORMAT).to_string(), clock.to_string())
        }
    }
}
