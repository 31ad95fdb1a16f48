use chrono::{DateTime, Utc};
use serde::Serialize;

use calsync_core::sync::{PassCounters, LOCK_KEY};
use calsync_core::{PassOutcome, PassSummary, StateDb, StateStore};

#[derive(Serialize)]
struct StatusReport {
    last_sync_at: Option<DateTime<Utc>>,
    passes_committed: u64,
    last_run: PassCounters,
    mapped_records: usize,
    lock_held_since: Option<DateTime<Utc>>,
    history: Vec<PassSummary>,
}

pub fn run(json: bool, history: usize) -> Result<(), Box<dyn std::error::Error>> {
    let db = StateDb::open()?;
    let state = db.load()?;
    let report = StatusReport {
        last_sync_at: state.cursor.last_sync_at,
        passes_committed: state.cursor.passes_committed,
        last_run: state.cursor.last_run,
        mapped_records: state.mapping.len(),
        lock_held_since: db.lock_acquired_at(LOCK_KEY)?,
        history: db.recent_passes(history)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match report.last_sync_at {
        Some(at) => println!("Last sync:      {}", at.to_rfc3339()),
        None => println!("Last sync:      never"),
    }
    println!("Passes:         {}", report.passes_committed);
    println!("Mapped records: {}", report.mapped_records);
    let c = report.last_run;
    println!(
        "Last run:       created {} / updated {} / deleted {} / conflicts {} / errors {}",
        c.created, c.updated, c.deleted, c.conflicts, c.errors
    );
    if let Some(since) = report.lock_held_since {
        println!("Lock held since {}", since.to_rfc3339());
    }

    if !report.history.is_empty() {
        println!();
        println!("Recent passes:");
        for pass in &report.history {
            let outcome = match &pass.outcome {
                PassOutcome::Completed => "COMPLETED".to_string(),
                PassOutcome::Partial => "PARTIAL".to_string(),
                PassOutcome::SkippedConcurrentRun => "SKIPPED".to_string(),
                PassOutcome::Failed { cause } => format!("FAILED ({cause})"),
            };
            println!(
                "  {}  {outcome}  +{} ~{} -{} !{}",
                pass.started_at.format("%Y-%m-%d %H:%M:%S"),
                pass.counters.created,
                pass.counters.updated,
                pass.counters.deleted,
                pass.counters.errors
            );
        }
    }
    Ok(())
}
