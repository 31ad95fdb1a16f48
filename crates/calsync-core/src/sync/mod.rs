//! Calendar/sheet synchronization.
//!
//! Both sides are normalized to [`SyncRecord`], diffed against the persisted
//! [`SyncMapping`], conflicts resolved by strategy, and the resulting ops
//! written back in batches by [`SyncEngine`].

pub mod batch_writer;
pub mod conflict_resolver;
pub mod diff;
pub mod fields;
pub mod memory;
pub mod ports;
pub mod record_codec;
pub mod sync_engine;
pub mod types;

#[cfg(test)]
mod sync_engine_tests;

pub use batch_writer::{ApplyResult, AppliedOp, BatchWriter, FailedOp, RetryConfig};
pub use conflict_resolver::{decide, resolve, resolve_all, ConflictStrategy, Winner};
pub use diff::{diff, filter_by_origin};
pub use fields::{
    default_definitions, validate_all, FieldDefinition, FieldIssue, FieldType, FieldValidator,
    OverflowPolicy,
};
pub use memory::{Fault, MemoryCalendar, MemoryLockStore, MemorySheet, MemoryStateStore};
pub use ports::{CalendarStore, LockStore, SheetStore, StateStore};
pub use record_codec::{
    calendar_event_to_record, record_to_calendar_event, record_to_sheet_row, sheet_row_to_record,
    CalendarEvent, Column, SheetRow, SHEET_HEADERS,
};
pub use sync_engine::{EngineStats, EngineStatus, SyncConfig, SyncEngine, SyncPhase, LOCK_KEY};
pub use types::{
    ChangeKind, ChangeOp, EventTime, FieldValue, Locator, MappingEntry, PassCounters, PassOutcome,
    PassSummary, PersistedState, RecordIssue, Side, SyncCursor, SyncError, SyncMapping,
    SyncRecord, SyncResult, SyncStatus, TimeRange, WriteAck,
};
