pub mod config;
pub mod fields;
pub mod reset;
pub mod setup;
pub mod status;
pub mod sync;

use calsync_core::storage::data_dir;
use calsync_core::{Config, JsonCalendarFile, JsonSheetFile, StateDb, SyncEngine};

/// Engine wired to the configured JSON files and the SQLite state database.
pub type FileEngine = SyncEngine<JsonCalendarFile, JsonSheetFile, StateDb, StateDb>;

pub fn open_engine(config: &Config) -> Result<FileEngine, Box<dyn std::error::Error>> {
    let dir = data_dir()?;
    Ok(SyncEngine::new(
        JsonCalendarFile::new(config.calendar.path_in(&dir)),
        JsonSheetFile::new(config.sheet.path_in(&dir)),
        StateDb::open()?,
        StateDb::open()?,
        config.sync_config(),
    ))
}
