//! Conflict resolution for records changed on both sides.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sync::types::{ChangeKind, ChangeOp, Side, SyncRecord, SyncStatus};

/// Policy applied to every conflict in a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    CalendarWins,
    SheetsWins,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last_write_wins",
            ConflictStrategy::CalendarWins => "calendar_wins",
            ConflictStrategy::SheetsWins => "sheets_wins",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side whose version survives a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Calendar,
    Sheet,
}

impl Winner {
    pub fn side(self) -> Side {
        match self {
            Winner::Calendar => Side::Calendar,
            Winner::Sheet => Side::Sheet,
        }
    }
}

/// Pick the winning side. `None` means the record was deleted on that side.
pub fn decide(
    calendar: Option<&SyncRecord>,
    sheet: Option<&SyncRecord>,
    strategy: ConflictStrategy,
) -> Winner {
    match strategy {
        ConflictStrategy::CalendarWins => Winner::Calendar,
        ConflictStrategy::SheetsWins => Winner::Sheet,
        ConflictStrategy::LastWriteWins => match (calendar, sheet) {
            // Existing record beats a deletion of unknown age
            (Some(_), None) => Winner::Calendar,
            (None, Some(_)) => Winner::Sheet,
            (Some(c), Some(s)) => {
                if s.last_modified_at > c.last_modified_at {
                    Winner::Sheet
                } else {
                    Winner::Calendar
                }
            }
            (None, None) => Winner::Calendar,
        },
    }
}

/// Turn a conflict into a concrete op toward the losing side.
///
/// Non-conflict ops are returned unchanged. A conflict with neither version
/// present stays a conflict and is never written.
pub fn resolve(op: ChangeOp, strategy: ConflictStrategy) -> ChangeOp {
    if op.kind != ChangeKind::Conflict {
        return op;
    }

    let winner = decide(op.source.as_ref(), op.target.as_ref(), strategy);
    let (winning, losing) = match winner {
        Winner::Calendar => (op.source, op.target),
        Winner::Sheet => (op.target, op.source),
    };
    let toward = winner.side().other();

    match (winning, losing) {
        (Some(w), Some(l)) => ChangeOp::update(toward, w.with_status(SyncStatus::Synced), Some(l)),
        (Some(w), None) => ChangeOp::create(toward, w.with_status(SyncStatus::Synced)),
        (None, Some(l)) => ChangeOp::delete(toward, l),
        (None, None) => ChangeOp::conflict(op.id, None, None),
    }
}

/// Resolve every conflict in `ops`, preserving order.
pub fn resolve_all(ops: Vec<ChangeOp>, strategy: ConflictStrategy) -> Vec<ChangeOp> {
    ops.into_iter().map(|op| resolve(op, strategy)).collect()
}
