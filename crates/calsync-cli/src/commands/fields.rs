use clap::Subcommand;

use calsync_core::sync::validate_all;
use calsync_core::Config;

#[derive(Subcommand)]
pub enum FieldsAction {
    /// Check the configured extension field definitions
    Check,
    /// List the configured extension fields
    List,
}

pub fn run(action: FieldsAction) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let definitions = &config.fields.definitions;

    match action {
        FieldsAction::Check => {
            let issues = validate_all(definitions);
            if issues.is_empty() {
                println!("ok: {} field definitions", definitions.len());
                return Ok(());
            }
            for issue in &issues {
                eprintln!("  {issue}");
            }
            Err(format!("{} problem(s) in field definitions", issues.len()).into())
        }
        FieldsAction::List => {
            println!("overflow policy: {:?}", config.fields.overflow_policy);
            for def in definitions {
                let bounds = match (def.min, def.max, def.max_length) {
                    (Some(min), Some(max), _) => format!("[{min}, {max}]"),
                    (_, _, Some(len)) => format!("max {len} chars"),
                    _ => String::new(),
                };
                println!(
                    "  {:<12} -> {:<10} {:?} {bounds} default={:?}",
                    def.name, def.slot, def.field_type, def.default
                );
            }
            Ok(())
        }
    }
}
