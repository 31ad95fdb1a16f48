//! In-memory stores.
//!
//! Each store is a cheap cloneable handle over shared state, so a test can
//! hand one clone to the engine and inspect another. Failures can be
//! injected per record id to exercise retry and isolation paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::sync::ports::{CalendarStore, LockStore, SheetStore, StateStore};
use crate::sync::record_codec::{event_sync_id, CalendarEvent, Column, SheetRow};
use crate::sync::types::{
    PassSummary, PersistedState, SyncError, SyncResult, TimeRange, WriteAck,
};

/// First data row; row 1 is the header.
pub const FIRST_DATA_ROW: u32 = 2;

/// Kind of failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    RateLimited,
    Permanent,
}

impl Fault {
    fn to_error(self, what: &str) -> SyncError {
        match self {
            Fault::Transient => SyncError::TransientIo(format!("injected failure on {what}")),
            Fault::RateLimited => SyncError::RateLimited,
            Fault::Permanent => SyncError::PermanentIo(format!("injected failure on {what}")),
        }
    }
}

/// Pending injected failures, keyed by record id.
#[derive(Debug, Default)]
struct Faults {
    by_id: HashMap<String, (Fault, u32)>,
    listing: Option<Fault>,
}

impl Faults {
    fn check(&mut self, id: &str) -> SyncResult<()> {
        if let Some((fault, remaining)) = self.by_id.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(fault.to_error(id));
            }
        }
        Ok(())
    }

    fn check_listing(&self, what: &str) -> SyncResult<()> {
        match self.listing {
            Some(fault) => Err(fault.to_error(what)),
            None => Ok(()),
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> SyncResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| SyncError::Store(format!("Failed to lock {what}")))
}

// ============================================================================
// Calendar
// ============================================================================

#[derive(Debug, Default)]
struct CalendarInner {
    events: BTreeMap<String, CalendarEvent>,
    next_seq: u64,
    writes: u64,
    faults: Faults,
}

impl CalendarInner {
    fn assign_id(&mut self) -> String {
        self.next_seq += 1;
        format!("evt-{}", self.next_seq)
    }
}

/// Calendar held in memory. Writes stamp `updated` with the current time.
#[derive(Debug, Clone, Default)]
pub struct MemoryCalendar {
    inner: Arc<Mutex<CalendarInner>>,
}

impl MemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an event as-is. An empty id gets a generated one, which is returned.
    pub fn insert(&self, mut event: CalendarEvent) -> SyncResult<String> {
        let mut inner = lock(&self.inner, "calendar")?;
        if event.id.is_empty() {
            event.id = inner.assign_id();
        }
        let id = event.id.clone();
        inner.events.insert(id.clone(), event);
        Ok(id)
    }

    pub fn event(&self, native_ref: &str) -> Option<CalendarEvent> {
        lock(&self.inner, "calendar")
            .ok()
            .and_then(|inner| inner.events.get(native_ref).cloned())
    }

    /// Find an event by its sync id.
    pub fn find(&self, sync_id: &str) -> Option<CalendarEvent> {
        lock(&self.inner, "calendar").ok().and_then(|inner| {
            inner
                .events
                .values()
                .find(|e| event_sync_id(e) == sync_id)
                .cloned()
        })
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        lock(&self.inner, "calendar")
            .map(|inner| inner.events.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful create/update/delete calls.
    pub fn write_count(&self) -> u64 {
        lock(&self.inner, "calendar").map(|i| i.writes).unwrap_or(0)
    }

    /// Fail the next `times` writes touching `sync_id`.
    pub fn fail_writes_for(&self, sync_id: &str, fault: Fault, times: u32) {
        if let Ok(mut inner) = lock(&self.inner, "calendar") {
            inner.faults.by_id.insert(sync_id.to_string(), (fault, times));
        }
    }

    /// Fail every listing until cleared with `None`.
    pub fn fail_listing(&self, fault: Option<Fault>) {
        if let Ok(mut inner) = lock(&self.inner, "calendar") {
            inner.faults.listing = fault;
        }
    }
}

impl CalendarStore for MemoryCalendar {
    fn list_events(&self, range: &TimeRange) -> SyncResult<Vec<CalendarEvent>> {
        let inner = lock(&self.inner, "calendar")?;
        inner.faults.check_listing("calendar listing")?;
        Ok(inner
            .events
            .values()
            .filter(|e| e.start_time().is_some_and(|t| range.contains(&t)))
            .cloned()
            .collect())
    }

    fn get_event(&self, native_ref: &str) -> SyncResult<Option<CalendarEvent>> {
        let inner = lock(&self.inner, "calendar")?;
        inner.faults.check_listing("calendar lookup")?;
        Ok(inner.events.get(native_ref).cloned())
    }

    fn create_event(&self, event: &CalendarEvent) -> SyncResult<WriteAck> {
        let mut inner = lock(&self.inner, "calendar")?;
        inner.faults.check(event_sync_id(event))?;
        let mut stored = event.clone();
        stored.id = inner.assign_id();
        stored.updated = Utc::now();
        let ack = WriteAck::event(stored.id.clone(), Some(stored.updated));
        inner.events.insert(stored.id.clone(), stored);
        inner.writes += 1;
        Ok(ack)
    }

    fn update_event(&self, native_ref: &str, event: &CalendarEvent) -> SyncResult<WriteAck> {
        let mut inner = lock(&self.inner, "calendar")?;
        inner.faults.check(event_sync_id(event))?;
        if !inner.events.contains_key(native_ref) {
            return Err(SyncError::NotFound(format!("event {native_ref}")));
        }
        let mut stored = event.clone();
        stored.id = native_ref.to_string();
        stored.updated = Utc::now();
        let ack = WriteAck::event(native_ref, Some(stored.updated));
        inner.events.insert(native_ref.to_string(), stored);
        inner.writes += 1;
        Ok(ack)
    }

    fn delete_event(&self, native_ref: &str) -> SyncResult<()> {
        let mut inner = lock(&self.inner, "calendar")?;
        let sync_id = inner
            .events
            .get(native_ref)
            .map(|e| event_sync_id(e).to_string())
            .ok_or_else(|| SyncError::NotFound(format!("event {native_ref}")))?;
        inner.faults.check(&sync_id)?;
        inner.events.remove(native_ref);
        inner.writes += 1;
        Ok(())
    }
}

// ============================================================================
// Sheet
// ============================================================================

#[derive(Debug, Default)]
struct SheetInner {
    rows: BTreeMap<u32, Vec<String>>,
    writes: u64,
    faults: Faults,
}

impl SheetInner {
    fn next_position(&self) -> u32 {
        self.rows
            .keys()
            .next_back()
            .map(|last| last + 1)
            .unwrap_or(FIRST_DATA_ROW)
    }
}

/// Sheet held in memory, keyed by row position.
#[derive(Debug, Clone, Default)]
pub struct MemorySheet {
    inner: Arc<Mutex<SheetInner>>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw cells, returning the row position.
    pub fn push_row<S: Into<String>>(&self, cells: impl IntoIterator<Item = S>) -> SyncResult<u32> {
        let mut inner = lock(&self.inner, "sheet")?;
        let position = inner.next_position();
        inner
            .rows
            .insert(position, cells.into_iter().map(Into::into).collect());
        Ok(position)
    }

    pub fn row(&self, position: u32) -> Option<SheetRow> {
        lock(&self.inner, "sheet").ok().and_then(|inner| {
            inner
                .rows
                .get(&position)
                .map(|cells| SheetRow::new(Some(position), cells.clone()))
        })
    }

    /// Find a row by the value of its `EventID` cell.
    pub fn find(&self, sync_id: &str) -> Option<SheetRow> {
        self.rows()
            .into_iter()
            .find(|r| r.cell(Column::EventId) == sync_id)
    }

    pub fn rows(&self) -> Vec<SheetRow> {
        lock(&self.inner, "sheet")
            .map(|inner| {
                inner
                    .rows
                    .iter()
                    .map(|(pos, cells)| SheetRow::new(Some(*pos), cells.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrite one cell in place, as a user editing the sheet would.
    pub fn set_cell(&self, position: u32, column: Column, value: &str) -> SyncResult<()> {
        let mut inner = lock(&self.inner, "sheet")?;
        let cells = inner
            .rows
            .get_mut(&position)
            .ok_or_else(|| SyncError::NotFound(format!("row {position}")))?;
        let mut row = SheetRow::new(Some(position), std::mem::take(cells));
        row.set(column, value);
        *cells = row.cells;
        Ok(())
    }

    pub fn remove_row(&self, position: u32) -> SyncResult<()> {
        let mut inner = lock(&self.inner, "sheet")?;
        inner.rows.remove(&position);
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner, "sheet").map(|i| i.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_count(&self) -> u64 {
        lock(&self.inner, "sheet").map(|i| i.writes).unwrap_or(0)
    }

    /// Fail the next `times` writes touching `sync_id`.
    pub fn fail_writes_for(&self, sync_id: &str, fault: Fault, times: u32) {
        if let Ok(mut inner) = lock(&self.inner, "sheet") {
            inner.faults.by_id.insert(sync_id.to_string(), (fault, times));
        }
    }

    pub fn fail_listing(&self, fault: Option<Fault>) {
        if let Ok(mut inner) = lock(&self.inner, "sheet") {
            inner.faults.listing = fault;
        }
    }
}

impl SheetStore for MemorySheet {
    fn list_rows(&self) -> SyncResult<Vec<SheetRow>> {
        {
            let inner = lock(&self.inner, "sheet")?;
            inner.faults.check_listing("sheet listing")?;
        }
        Ok(self.rows())
    }

    fn write_row(&self, row: &SheetRow) -> SyncResult<WriteAck> {
        let mut inner = lock(&self.inner, "sheet")?;
        inner.faults.check(row.cell(Column::EventId))?;
        let position = match row.position {
            Some(p) if p >= FIRST_DATA_ROW => p,
            Some(p) => return Err(SyncError::PermanentIo(format!("row {p} is not a data row"))),
            None => inner.next_position(),
        };
        inner.rows.insert(position, row.cells.clone());
        inner.writes += 1;
        Ok(WriteAck::row(position))
    }

    fn clear_row(&self, position: u32) -> SyncResult<()> {
        let mut inner = lock(&self.inner, "sheet")?;
        let id = inner
            .rows
            .get(&position)
            .map(|cells| cells.first().cloned().unwrap_or_default())
            .ok_or_else(|| SyncError::NotFound(format!("row {position}")))?;
        inner.faults.check(&id)?;
        inner.rows.remove(&position);
        inner.writes += 1;
        Ok(())
    }
}

// ============================================================================
// Lock and state
// ============================================================================

/// Process-local lock table with TTL expiry.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    held: Arc<Mutex<HashMap<String, Instant>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.held, "lock table")
            .map(|held| held.contains_key(key))
            .unwrap_or(false)
    }
}

impl LockStore for MemoryLockStore {
    fn try_acquire(&self, key: &str, ttl: Duration) -> SyncResult<bool> {
        let mut held = lock(&self.held, "lock table")?;
        let now = Instant::now();
        if let Some(since) = held.get(key) {
            if now.duration_since(*since) < ttl {
                return Ok(false);
            }
        }
        held.insert(key.to_string(), now);
        Ok(true)
    }

    fn release(&self, key: &str) -> SyncResult<()> {
        lock(&self.held, "lock table")?.remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StateInner {
    state: PersistedState,
    history: Vec<PassSummary>,
    saves: u64,
    fail_load: bool,
    fail_save: bool,
}

/// Mapping, cursor and history held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<StateInner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PersistedState {
        lock(&self.inner, "state")
            .map(|i| i.state.clone())
            .unwrap_or_default()
    }

    pub fn save_count(&self) -> u64 {
        lock(&self.inner, "state").map(|i| i.saves).unwrap_or(0)
    }

    pub fn fail_load(&self, fail: bool) {
        if let Ok(mut inner) = lock(&self.inner, "state") {
            inner.fail_load = fail;
        }
    }

    pub fn fail_save(&self, fail: bool) {
        if let Ok(mut inner) = lock(&self.inner, "state") {
            inner.fail_save = fail;
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> SyncResult<PersistedState> {
        let inner = lock(&self.inner, "state")?;
        if inner.fail_load {
            return Err(SyncError::Store("injected load failure".into()));
        }
        Ok(inner.state.clone())
    }

    fn save(&self, state: &PersistedState) -> SyncResult<()> {
        let mut inner = lock(&self.inner, "state")?;
        if inner.fail_save {
            return Err(SyncError::Store("injected save failure".into()));
        }
        inner.state = state.clone();
        inner.saves += 1;
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        let mut inner = lock(&self.inner, "state")?;
        inner.state = PersistedState::default();
        Ok(())
    }

    fn record_pass(&self, summary: &PassSummary) -> SyncResult<()> {
        lock(&self.inner, "state")?.history.push(summary.clone());
        Ok(())
    }

    fn recent_passes(&self, limit: usize) -> SyncResult<Vec<PassSummary>> {
        let inner = lock(&self.inner, "state")?;
        Ok(inner.history.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::record_codec::{EventDateTime, ExtendedProperties};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn event(summary: &str) -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2025, 7, 1, 9, 0, 0).unwrap();
        CalendarEvent {
            id: String::new(),
            summary: summary.to_string(),
            description: None,
            location: None,
            start: EventDateTime {
                date: None,
                date_time: Some(start),
            },
            end: EventDateTime {
                date: None,
                date_time: Some(start + ChronoDuration::hours(1)),
            },
            attendees: Vec::new(),
            recurrence: Vec::new(),
            updated: start,
            extended_properties: ExtendedProperties::default(),
        }
    }

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let locks = MemoryLockStore::new();
        let ttl = Duration::from_secs(60);
        assert!(locks.try_acquire("k", ttl).unwrap());
        assert!(!locks.try_acquire("k", ttl).unwrap());
        locks.release("k").unwrap();
        assert!(locks.try_acquire("k", ttl).unwrap());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let locks = MemoryLockStore::new();
        assert!(locks.try_acquire("k", Duration::from_secs(60)).unwrap());
        assert!(locks.try_acquire("k", Duration::ZERO).unwrap());
    }

    #[test]
    fn test_calendar_create_assigns_id_and_stamps() {
        let cal = MemoryCalendar::new();
        let ack = cal.create_event(&event("standup")).unwrap();
        let native = match ack.locator {
            Some(crate::sync::types::Locator::Event(id)) => id,
            other => panic!("unexpected locator {other:?}"),
        };
        let stored = cal.event(&native).unwrap();
        assert_eq!(Some(stored.updated), ack.modified_at);
        assert_eq!(cal.write_count(), 1);
    }

    #[test]
    fn test_calendar_listing_respects_range() {
        let cal = MemoryCalendar::new();
        cal.insert(event("inside")).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 7, 2, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, start + ChronoDuration::days(1));
        assert!(cal.list_events(&range).unwrap().is_empty());
    }

    #[test]
    fn test_injected_faults_run_out() {
        let sheet = MemorySheet::new();
        sheet.fail_writes_for("R1", Fault::Transient, 1);
        let mut row = SheetRow::empty(None);
        row.set(Column::EventId, "R1");
        assert!(sheet.write_row(&row).unwrap_err().is_retryable());
        assert_eq!(sheet.write_row(&row).unwrap(), WriteAck::row(FIRST_DATA_ROW));
    }

    #[test]
    fn test_sheet_clear_keeps_positions() {
        let sheet = MemorySheet::new();
        let a = sheet.push_row(["A"]).unwrap();
        let b = sheet.push_row(["B"]).unwrap();
        sheet.clear_row(a).unwrap();
        assert_eq!(sheet.row(b).unwrap().cell(Column::EventId), "B");
        assert_eq!(sheet.push_row(["C"]).unwrap(), b + 1);
    }

    #[test]
    fn test_state_history_newest_first() {
        let state = MemoryStateStore::new();
        let first = PassSummary::new(Utc::now());
        let second = PassSummary::skipped_concurrent(Utc::now());
        state.record_pass(&first).unwrap();
        state.record_pass(&second).unwrap();
        let recent = state.recent_passes(1).unwrap();
        assert_eq!(recent, vec![second]);
    }
}
