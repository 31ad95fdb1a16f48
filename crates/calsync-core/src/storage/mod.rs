mod config;
pub mod files;
pub mod state_db;

pub use config::{CalendarSection, Config, FieldsSection, SheetSection, SyncSection};
pub use files::{JsonCalendarFile, JsonSheetFile};
pub use state_db::StateDb;

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns the calsync data directory, creating it if needed.
///
/// `CALSYNC_DATA_DIR` wins when set. Otherwise `~/.config/calsync/`, or
/// `~/.config/calsync-dev/` when `CALSYNC_ENV=dev`.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("CALSYNC_DATA_DIR") {
        Some(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");

            let env = std::env::var("CALSYNC_ENV").unwrap_or_else(|_| "production".to_string());

            if env == "dev" {
                base_dir.join("calsync-dev")
            } else {
                base_dir.join("calsync")
            }
        }
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
