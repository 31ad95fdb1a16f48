//! JSON-file backends for the calendar and the sheet.
//!
//! These give the CLI something concrete to sync between without network
//! access: an event list in the calendar's wire shape and a header-plus-rows
//! grid in the sheet's. Both are rewritten whole on every write via a
//! temporary file and a rename.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::memory::FIRST_DATA_ROW;
use crate::sync::{
    CalendarEvent, CalendarStore, SheetRow, SheetStore, SyncError, SyncResult, TimeRange,
    WriteAck, SHEET_HEADERS,
};

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> SyncResult<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SyncError::PermanentIo(format!(
                "{what} file {} does not exist; run `calsync setup`",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_str(&content)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> SyncResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn guard<'a>(mutex: &'a Mutex<()>, path: &Path) -> SyncResult<MutexGuard<'a, ()>> {
    mutex
        .lock()
        .map_err(|e| SyncError::Store(format!("Failed to lock {}: {e}", path.display())))
}

// ============================================================================
// Calendar
// ============================================================================

/// Calendar stored as a JSON array of events.
///
/// Created events get a UUID native id. Every write stamps `updated`.
#[derive(Debug)]
pub struct JsonCalendarFile {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl JsonCalendarFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty calendar file unless one exists. Returns whether it was created.
    pub fn init(&self) -> SyncResult<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        write_json(&self.path, &Vec::<CalendarEvent>::new())?;
        Ok(true)
    }

    fn read_all(&self) -> SyncResult<Vec<CalendarEvent>> {
        read_json(&self.path, "calendar")
    }
}

impl CalendarStore for JsonCalendarFile {
    fn list_events(&self, range: &TimeRange) -> SyncResult<Vec<CalendarEvent>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.start_time().is_some_and(|t| range.contains(&t)))
            .collect())
    }

    fn get_event(&self, native_ref: &str) -> SyncResult<Option<CalendarEvent>> {
        Ok(self.read_all()?.into_iter().find(|e| e.id == native_ref))
    }

    fn create_event(&self, event: &CalendarEvent) -> SyncResult<WriteAck> {
        let _guard = guard(&self.write_guard, &self.path)?;
        let mut events = self.read_all()?;
        let mut stored = event.clone();
        stored.id = Uuid::new_v4().to_string();
        stored.updated = Utc::now();
        let ack = WriteAck::event(stored.id.clone(), Some(stored.updated));
        events.push(stored);
        write_json(&self.path, &events)?;
        Ok(ack)
    }

    fn update_event(&self, native_ref: &str, event: &CalendarEvent) -> SyncResult<WriteAck> {
        let _guard = guard(&self.write_guard, &self.path)?;
        let mut events = self.read_all()?;
        let slot = events
            .iter_mut()
            .find(|e| e.id == native_ref)
            .ok_or_else(|| SyncError::NotFound(format!("event {native_ref}")))?;
        *slot = event.clone();
        slot.id = native_ref.to_string();
        slot.updated = Utc::now();
        let ack = WriteAck::event(native_ref, Some(slot.updated));
        write_json(&self.path, &events)?;
        Ok(ack)
    }

    fn delete_event(&self, native_ref: &str) -> SyncResult<()> {
        let _guard = guard(&self.write_guard, &self.path)?;
        let mut events = self.read_all()?;
        let before = events.len();
        events.retain(|e| e.id != native_ref);
        if events.len() == before {
            return Err(SyncError::NotFound(format!("event {native_ref}")));
        }
        write_json(&self.path, &events)
    }
}

// ============================================================================
// Sheet
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SheetDocument {
    header: Vec<String>,
    /// `rows[i]` is sheet row `i + 2`. Cleared rows are empty.
    #[serde(default)]
    rows: Vec<Vec<String>>,
}

impl SheetDocument {
    fn empty() -> Self {
        Self {
            header: SHEET_HEADERS.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    fn index_of(position: u32) -> SyncResult<usize> {
        if position < FIRST_DATA_ROW {
            return Err(SyncError::PermanentIo(format!(
                "row {position} is not a data row"
            )));
        }
        Ok((position - FIRST_DATA_ROW) as usize)
    }

    fn position_of(index: usize) -> u32 {
        u32::try_from(index).unwrap_or(u32::MAX - FIRST_DATA_ROW) + FIRST_DATA_ROW
    }
}

/// Sheet stored as a JSON document with a header row and data rows.
#[derive(Debug)]
pub struct JsonSheetFile {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl JsonSheetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a sheet holding only the header row unless one exists.
    pub fn init(&self) -> SyncResult<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        write_json(&self.path, &SheetDocument::empty())?;
        Ok(true)
    }

    fn read_doc(&self) -> SyncResult<SheetDocument> {
        let doc: SheetDocument = read_json(&self.path, "sheet")?;
        if doc.header.iter().map(String::as_str).ne(SHEET_HEADERS.iter().copied()) {
            return Err(SyncError::PermanentIo(format!(
                "sheet {} has an unexpected header row",
                self.path.display()
            )));
        }
        Ok(doc)
    }
}

impl SheetStore for JsonSheetFile {
    fn list_rows(&self) -> SyncResult<Vec<SheetRow>> {
        let doc = self.read_doc()?;
        Ok(doc
            .rows
            .into_iter()
            .enumerate()
            .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()))
            .map(|(index, cells)| SheetRow::new(Some(SheetDocument::position_of(index)), cells))
            .collect())
    }

    fn write_row(&self, row: &SheetRow) -> SyncResult<WriteAck> {
        let _guard = guard(&self.write_guard, &self.path)?;
        let mut doc = self.read_doc()?;
        let index = match row.position {
            Some(position) => SheetDocument::index_of(position)?,
            None => doc.rows.len(),
        };
        if index >= doc.rows.len() {
            doc.rows.resize(index + 1, Vec::new());
        }
        doc.rows[index] = row.cells.clone();
        write_json(&self.path, &doc)?;
        Ok(WriteAck::row(SheetDocument::position_of(index)))
    }

    fn clear_row(&self, position: u32) -> SyncResult<()> {
        let _guard = guard(&self.write_guard, &self.path)?;
        let mut doc = self.read_doc()?;
        let index = SheetDocument::index_of(position)?;
        match doc.rows.get_mut(index) {
            Some(cells) if !cells.is_empty() => cells.clear(),
            _ => return Err(SyncError::NotFound(format!("row {position}"))),
        }
        write_json(&self.path, &doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Column, EventTime, Locator};
    use chrono::TimeZone;

    fn window() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn standup() -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        serde_json::from_value(serde_json::json!({
            "summary": "Standup",
            "start": { "dateTime": start },
            "end": { "dateTime": start + chrono::Duration::minutes(15) },
            "updated": start,
        }))
        .unwrap()
    }

    fn row_with_id(position: Option<u32>, id: &str) -> SheetRow {
        let mut row = SheetRow::empty(position);
        row.set(Column::EventId, id);
        row
    }

    #[test]
    fn calendar_listing_before_setup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let calendar = JsonCalendarFile::new(dir.path().join("calendar.json"));
        let err = calendar.list_events(&window()).unwrap_err();
        assert!(matches!(err, SyncError::PermanentIo(_)));
    }

    #[test]
    fn calendar_create_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let calendar = JsonCalendarFile::new(dir.path().join("calendar.json"));
        assert!(calendar.init().unwrap());
        assert!(!calendar.init().unwrap());

        let ack = calendar.create_event(&standup()).unwrap();
        let Some(Locator::Event(native)) = ack.locator.clone() else {
            panic!("expected event locator");
        };
        assert!(ack.modified_at.is_some());

        let mut renamed = standup();
        renamed.summary = "Daily standup".into();
        calendar.update_event(&native, &renamed).unwrap();

        let events = calendar.list_events(&window()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, native);
        assert_eq!(events[0].summary, "Daily standup");

        calendar.delete_event(&native).unwrap();
        assert!(calendar.list_events(&window()).unwrap().is_empty());
        assert!(matches!(
            calendar.delete_event(&native),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn calendar_listing_honours_window() {
        let dir = tempfile::tempdir().unwrap();
        let calendar = JsonCalendarFile::new(dir.path().join("calendar.json"));
        calendar.init().unwrap();
        calendar.create_event(&standup()).unwrap();

        let later = TimeRange::new(
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap(),
        );
        assert!(calendar.list_events(&later).unwrap().is_empty());

        // Direct lookup ignores the window.
        let native = calendar.list_events(&window()).unwrap()[0].id.clone();
        let found = calendar.get_event(&native).unwrap().unwrap();
        assert_eq!(found.summary, "Standup");
        assert!(calendar.get_event("missing").unwrap().is_none());
        let events = calendar.list_events(&window()).unwrap();
        assert!(matches!(events[0].start_time(), Some(EventTime::DateTime(_))));
    }

    #[test]
    fn sheet_appends_after_last_row() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = JsonSheetFile::new(dir.path().join("sheet.json"));
        sheet.init().unwrap();

        assert_eq!(sheet.write_row(&row_with_id(None, "a")).unwrap(), WriteAck::row(2));
        assert_eq!(sheet.write_row(&row_with_id(None, "b")).unwrap(), WriteAck::row(3));

        let rows = sheet.list_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].position, Some(3));
        assert_eq!(rows[1].cell(Column::EventId), "b");
    }

    #[test]
    fn sheet_clear_keeps_later_positions() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = JsonSheetFile::new(dir.path().join("sheet.json"));
        sheet.init().unwrap();
        for id in ["a", "b", "c"] {
            sheet.write_row(&row_with_id(None, id)).unwrap();
        }

        sheet.clear_row(3).unwrap();
        let positions: Vec<_> = sheet.list_rows().unwrap().iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![Some(2), Some(4)]);

        assert!(matches!(sheet.clear_row(3), Err(SyncError::NotFound(_))));
        assert!(matches!(sheet.clear_row(1), Err(SyncError::PermanentIo(_))));
    }

    #[test]
    fn sheet_in_place_write_past_end_pads() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = JsonSheetFile::new(dir.path().join("sheet.json"));
        sheet.init().unwrap();

        sheet.write_row(&row_with_id(Some(5), "far")).unwrap();
        let rows = sheet.list_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].position, Some(5));
    }

    #[test]
    fn sheet_with_foreign_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet.json");
        fs::write(&path, r#"{"header": ["Name", "Date"], "rows": []}"#).unwrap();

        let sheet = JsonSheetFile::new(&path);
        assert!(matches!(sheet.list_rows(), Err(SyncError::PermanentIo(_))));
    }
}
