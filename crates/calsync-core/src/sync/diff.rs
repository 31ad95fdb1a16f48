//! Change detection between the calendar snapshot, the sheet snapshot and the
//! persisted mapping.

use std::collections::{BTreeMap, BTreeSet};

use crate::sync::types::{ChangeKind, ChangeOp, MappingEntry, Side, SyncMapping, SyncRecord};

/// Compute the change set for one pass.
///
/// Ops come back sorted by id, at most one per id.
pub fn diff(
    calendar: &BTreeMap<String, SyncRecord>,
    sheet: &BTreeMap<String, SyncRecord>,
    mapping: &SyncMapping,
) -> Vec<ChangeOp> {
    let ids: BTreeSet<&String> = calendar
        .keys()
        .chain(sheet.keys())
        .chain(mapping.ids())
        .collect();

    ids.into_iter()
        .filter_map(|id| diff_one(id, calendar.get(id), sheet.get(id), mapping.get(id)))
        .collect()
}

fn diff_one(
    id: &str,
    cal: Option<&SyncRecord>,
    sheet: Option<&SyncRecord>,
    entry: Option<&MappingEntry>,
) -> Option<ChangeOp> {
    // A retired entry only matters while a leftover copy still exists.
    let entry = match entry {
        Some(e) if e.is_retired() && cal.is_some() && sheet.is_some() => None,
        other => other,
    };

    match (cal, sheet, entry) {
        (None, None, _) => None,

        (Some(c), Some(s), None) => {
            if c.same_content(s) {
                None
            } else {
                Some(ChangeOp::conflict(id, Some(c.clone()), Some(s.clone())))
            }
        }

        (Some(c), Some(s), Some(e)) => {
            let cal_changed = changed_since(c, e, Side::Calendar);
            let sheet_changed = changed_since(s, e, Side::Sheet);
            if c.same_content(s) {
                return None;
            }
            match (cal_changed, sheet_changed) {
                (false, false) => None,
                (true, false) => Some(ChangeOp::update(Side::Sheet, c.clone(), Some(s.clone()))),
                (false, true) => Some(ChangeOp::update(Side::Calendar, s.clone(), Some(c.clone()))),
                (true, true) => Some(ChangeOp::conflict(id, Some(c.clone()), Some(s.clone()))),
            }
        }

        (Some(c), None, None) => Some(ChangeOp::create(Side::Sheet, c.clone())),
        (None, Some(s), None) => Some(ChangeOp::create(Side::Calendar, s.clone())),

        (Some(c), None, Some(e)) => {
            if !e.is_retired() && changed_since(c, e, Side::Calendar) {
                Some(ChangeOp::conflict(id, Some(c.clone()), None))
            } else {
                Some(ChangeOp::delete(Side::Calendar, c.clone()))
            }
        }

        (None, Some(s), Some(e)) => {
            if !e.is_retired() && changed_since(s, e, Side::Sheet) {
                Some(ChangeOp::conflict(id, None, Some(s.clone())))
            } else {
                Some(ChangeOp::delete(Side::Sheet, s.clone()))
            }
        }
    }
}

fn changed_since(record: &SyncRecord, entry: &MappingEntry, side: Side) -> bool {
    record.last_modified_at > entry.synced_at(side)
}

/// Keep ops that originate from `side`, plus every conflict.
pub fn filter_by_origin(ops: Vec<ChangeOp>, side: Side) -> Vec<ChangeOp> {
    ops.into_iter()
        .filter(|op| op.kind == ChangeKind::Conflict || op.kind.origin() == Some(side))
        .collect()
}
