use calsync_core::storage::data_dir;
use calsync_core::{Config, JsonCalendarFile, JsonSheetFile, StateDb};

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let dir = data_dir()?;
    let config = Config::load()?;
    StateDb::open()?;

    let calendar = JsonCalendarFile::new(config.calendar.path_in(&dir));
    let sheet = JsonSheetFile::new(config.sheet.path_in(&dir));
    let created_calendar = calendar.init()?;
    let created_sheet = sheet.init()?;

    println!("data dir: {}", dir.display());
    println!("config:   {}", Config::path()?.display());
    println!(
        "calendar: {}{}",
        calendar.path().display(),
        if created_calendar { " (created)" } else { "" }
    );
    println!(
        "sheet:    {}{}",
        sheet.path().display(),
        if created_sheet { " (created)" } else { "" }
    );
    Ok(())
}
