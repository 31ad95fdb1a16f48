//! Sync subcommand: run one pass between the configured calendar and sheet.

use clap::Subcommand;

use calsync_core::{Config, PassOutcome, PassSummary, Side};

use super::open_engine;

#[derive(Subcommand)]
pub enum SyncAction {
    /// Reconcile changes from both sides
    Full {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply only changes that originated on one side
    From {
        /// calendar or sheet
        origin: Side,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(action: SyncAction) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let engine = open_engine(&config)?;

    let (summary, json) = match action {
        SyncAction::Full { json } => (engine.run_full_pass(), json),
        SyncAction::From { origin, json } => (engine.run_directional_pass(origin), json),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    match summary.outcome {
        PassOutcome::Failed { cause } => Err(cause.into()),
        _ => Ok(()),
    }
}

fn outcome_label(outcome: &PassOutcome) -> &'static str {
    match outcome {
        PassOutcome::Completed => "completed",
        PassOutcome::Partial => "partial",
        PassOutcome::SkippedConcurrentRun => "skipped (another pass is running)",
        PassOutcome::Failed { .. } => "failed",
    }
}

fn print_summary(summary: &PassSummary) {
    let c = &summary.counters;
    println!("Pass {}", outcome_label(&summary.outcome));
    if matches!(summary.outcome, PassOutcome::SkippedConcurrentRun) {
        return;
    }
    println!(
        "  created {} / updated {} / deleted {} / conflicts {} / errors {} / skipped {}",
        c.created, c.updated, c.deleted, c.conflicts, c.errors, c.skipped
    );
    if summary.deferred > 0 {
        println!("  deferred {} (time budget reached)", summary.deferred);
    }
    if !summary.conflict_ids.is_empty() {
        println!("  conflicts resolved: {}", summary.conflict_ids.join(", "));
    }
    for issue in &summary.issues {
        match &issue.id {
            Some(id) => println!("  [{}] {id}: {}", issue.side, issue.message),
            None => println!("  [{}] {}", issue.side, issue.message),
        }
    }
}
