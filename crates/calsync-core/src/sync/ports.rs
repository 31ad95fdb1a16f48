//! Store abstractions the sync engine runs against.
//!
//! Every method takes `&self`; implementations hold their own interior
//! synchronization.

use std::time::Duration;

use crate::sync::record_codec::{CalendarEvent, SheetRow};
use crate::sync::types::{PassSummary, PersistedState, SyncResult, TimeRange, WriteAck};

/// Calendar backend.
pub trait CalendarStore {
    /// Events whose start falls inside `range`.
    fn list_events(&self, range: &TimeRange) -> SyncResult<Vec<CalendarEvent>>;

    /// Fetch one event regardless of the listing window. `None` when it no
    /// longer exists.
    fn get_event(&self, native_ref: &str) -> SyncResult<Option<CalendarEvent>>;

    /// Create an event. The ack carries the native id the store assigned.
    fn create_event(&self, event: &CalendarEvent) -> SyncResult<WriteAck>;

    fn update_event(&self, native_ref: &str, event: &CalendarEvent) -> SyncResult<WriteAck>;

    fn delete_event(&self, native_ref: &str) -> SyncResult<()>;
}

/// Spreadsheet backend. Row 1 holds the header; data starts at row 2.
pub trait SheetStore {
    fn list_rows(&self) -> SyncResult<Vec<SheetRow>>;

    /// Write a row in place, or append it when `position` is `None`.
    fn write_row(&self, row: &SheetRow) -> SyncResult<WriteAck>;

    /// Remove the row at `position`. Later rows keep their positions.
    fn clear_row(&self, position: u32) -> SyncResult<()>;
}

/// Mutual exclusion across concurrent invocations.
pub trait LockStore {
    /// Take `key` unless a holder younger than `ttl` exists. Never waits.
    fn try_acquire(&self, key: &str, ttl: Duration) -> SyncResult<bool>;

    fn release(&self, key: &str) -> SyncResult<()>;
}

/// Persistence for the mapping, cursor and pass history.
pub trait StateStore {
    fn load(&self) -> SyncResult<PersistedState>;

    /// Persist mapping and cursor together.
    fn save(&self, state: &PersistedState) -> SyncResult<()>;

    fn clear(&self) -> SyncResult<()>;

    fn record_pass(&self, _summary: &PassSummary) -> SyncResult<()> {
        Ok(())
    }

    /// Most recent summaries, newest first.
    fn recent_passes(&self, _limit: usize) -> SyncResult<Vec<PassSummary>> {
        Ok(Vec::new())
    }
}
