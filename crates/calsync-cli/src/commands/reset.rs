use calsync_core::Config;

use super::open_engine;

pub fn run(yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !yes {
        return Err("reset forgets which rows belong to which events; re-run with --yes".into());
    }
    let config = Config::load()?;
    open_engine(&config)?.clear_state()?;
    println!("sync state cleared");
    Ok(())
}
