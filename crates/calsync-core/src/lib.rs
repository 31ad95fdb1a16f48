//! # calsync Core Library
//!
//! This library keeps a calendar and a spreadsheet in step. It follows a
//! CLI-first layout: every operation lives here, and the `calsync` binary is a
//! thin layer over the same library.
//!
//! ## Architecture
//!
//! - **Sync**: records from both sides are normalized, diffed against the
//!   persisted mapping, resolved by a conflict strategy and written back in
//!   bounded, retried batches
//! - **Storage**: TOML configuration, SQLite state (mapping, cursor, locks,
//!   pass log) and JSON-file stores for both sides
//!
//! ## Key Components
//!
//! - [`SyncEngine`]: Pass orchestrator
//! - [`CalendarStore`] / [`SheetStore`]: Side backends
//! - [`StateDb`]: Mapping, cursor and lock persistence
//! - [`Config`]: Application configuration management

pub mod error;
pub mod storage;
pub mod sync;

pub use error::{ConfigError, CoreError, DatabaseError};
pub use storage::{Config, JsonCalendarFile, JsonSheetFile, StateDb};
pub use sync::{
    CalendarStore, ConflictStrategy, LockStore, PassOutcome, PassSummary, SheetStore, Side,
    StateStore, SyncConfig, SyncEngine, SyncError, SyncResult,
};
