//! Sync orchestrator: lock, load, diff, resolve, write, commit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::sync::batch_writer::{ApplyResult, BatchWriter, RetryConfig};
use crate::sync::conflict_resolver::{resolve, ConflictStrategy};
use crate::sync::diff::{diff, filter_by_origin};
use crate::sync::fields::{
    default_definitions, validate_all, FieldDefinition, FieldValidator, OverflowPolicy,
};
use crate::sync::ports::{CalendarStore, LockStore, SheetStore, StateStore};
use crate::sync::record_codec::{
    calendar_event_to_record, event_sync_id, record_to_calendar_event, record_to_sheet_row,
    sheet_row_to_record, CalendarEvent, Column, SheetRow,
};
use crate::sync::types::{
    ChangeKind, ChangeOp, Locator, MappingEntry, PassOutcome, PassSummary, PersistedState,
    RecordIssue, Side, SyncCursor, SyncError, SyncMapping, SyncRecord, SyncResult, SyncStatus,
    TimeRange, WriteAck,
};

/// Lock key shared by every pass.
pub const LOCK_KEY: &str = "calsync.pass";

/// Immutable engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub strategy: ConflictStrategy,
    pub batch_size: usize,
    pub retry: RetryConfig,
    /// A lock older than this is considered abandoned.
    pub lock_ttl: Duration,
    /// Wall-clock budget for the writing phase; `None` is unbounded.
    pub time_budget: Option<Duration>,
    pub lookback_days: u32,
    pub lookahead_days: u32,
    pub fields: Vec<FieldDefinition>,
    pub overflow_policy: OverflowPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            batch_size: 50,
            retry: RetryConfig::default(),
            lock_ttl: Duration::from_secs(360),
            time_budget: Some(Duration::from_secs(300)),
            lookback_days: 30,
            lookahead_days: 365,
            fields: default_definitions(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    #[default]
    Idle,
    AcquiringLock,
    Loading,
    Diffing,
    Resolving,
    Writing,
    Committing,
    /// Last pass failed; cleared when the next pass starts.
    Error,
}

/// Cumulative counters for this engine instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub passes_run: u64,
    pub passes_failed: u64,
    pub passes_skipped: u64,
    pub total_errors: u64,
    pub last_error: Option<String>,
}

/// Snapshot returned by [`SyncEngine::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub phase: SyncPhase,
    pub cursor: SyncCursor,
    pub stats: EngineStats,
}

/// Normalized view of both sides for one pass.
#[derive(Debug, Default)]
struct Snapshot {
    calendar: BTreeMap<String, SyncRecord>,
    sheet: BTreeMap<String, SyncRecord>,
    event_refs: HashMap<String, String>,
    row_positions: HashMap<String, u32>,
    /// Ids whose records could not be read; their mapping entries are kept.
    quarantined: BTreeSet<String>,
    /// Unmapped ids whose sheet row starts outside the listing window.
    out_of_window: BTreeSet<String>,
    /// Sheet ids assigned during this pass and not yet written back.
    fresh_ids: BTreeSet<String>,
}

/// Bidirectional calendar/sheet sync engine.
pub struct SyncEngine<C, S, L, P> {
    calendar: C,
    sheet: S,
    locks: L,
    state: P,
    config: SyncConfig,
    validator: FieldValidator,
    writer: BatchWriter,
    phase: Mutex<SyncPhase>,
    stats: Mutex<EngineStats>,
}

impl<C, S, L, P> SyncEngine<C, S, L, P>
where
    C: CalendarStore,
    S: SheetStore,
    L: LockStore,
    P: StateStore,
{
    pub fn new(calendar: C, sheet: S, locks: L, state: P, config: SyncConfig) -> Self {
        let validator = FieldValidator::new(config.fields.clone(), config.overflow_policy);
        let writer = BatchWriter::new(config.batch_size, config.retry.clone());
        Self {
            calendar,
            sheet,
            locks,
            state,
            config,
            validator,
            writer,
            phase: Mutex::new(SyncPhase::Idle),
            stats: Mutex::new(EngineStats::default()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Reconcile changes from both sides.
    pub fn run_full_pass(&self) -> PassSummary {
        self.run(None)
    }

    /// Propagate only changes originating from `origin`. Conflicts are still resolved.
    pub fn run_directional_pass(&self, origin: Side) -> PassSummary {
        self.run(Some(origin))
    }

    pub fn status(&self) -> SyncResult<EngineStatus> {
        let cursor = self.state.load()?.cursor;
        Ok(EngineStatus {
            phase: self.phase(),
            cursor,
            stats: self.stats.lock().map(|s| s.clone()).unwrap_or_default(),
        })
    }

    /// Last `limit` pass summaries, newest first.
    pub fn history(&self, limit: usize) -> SyncResult<Vec<PassSummary>> {
        self.state.recent_passes(limit)
    }

    /// Forget the mapping and cursor. Fails if a pass holds the lock.
    pub fn clear_state(&self) -> SyncResult<()> {
        if !self.locks.try_acquire(LOCK_KEY, self.config.lock_ttl)? {
            return Err(SyncError::LockUnavailable);
        }
        let result = self.state.clear();
        self.release_lock();
        if result.is_ok() {
            info!("Sync state cleared");
        }
        result
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.lock().map(|p| *p).unwrap_or(SyncPhase::Error)
    }

    fn set_phase(&self, phase: SyncPhase) {
        if let Ok(mut current) = self.phase.lock() {
            if *current != phase {
                debug!(from = ?*current, to = ?phase, "Sync phase");
                *current = phase;
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut EngineStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn release_lock(&self) {
        if let Err(e) = self.locks.release(LOCK_KEY) {
            warn!(error = %e, "Failed to release sync lock");
        }
    }

    fn run(&self, direction: Option<Side>) -> PassSummary {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(direction = ?direction, "Sync pass starting");

        self.set_phase(SyncPhase::AcquiringLock);
        match self.locks.try_acquire(LOCK_KEY, self.config.lock_ttl) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Sync lock held by another run, skipping pass");
                self.set_phase(SyncPhase::Idle);
                self.update_stats(|s| s.passes_skipped += 1);
                return PassSummary::skipped_concurrent(started_at);
            }
            Err(e) => return self.fail(started_at, e),
        }

        let result = self.execute(direction, started_at, started);
        self.release_lock();

        match result {
            Ok(summary) => {
                self.set_phase(SyncPhase::Idle);
                self.update_stats(|s| {
                    s.passes_run += 1;
                    s.total_errors += summary.counters.errors;
                });
                info!(
                    outcome = ?summary.outcome,
                    created = summary.counters.created,
                    updated = summary.counters.updated,
                    deleted = summary.counters.deleted,
                    conflicts = summary.counters.conflicts,
                    errors = summary.counters.errors,
                    skipped = summary.counters.skipped,
                    deferred = summary.deferred,
                    "Sync pass finished"
                );
                summary
            }
            Err(e) => self.fail(started_at, e),
        }
    }

    fn fail(&self, started_at: DateTime<Utc>, cause: SyncError) -> PassSummary {
        error!(error = %cause, "Sync pass failed");
        self.set_phase(SyncPhase::Error);
        let message = cause.to_string();
        self.update_stats(|s| {
            s.passes_run += 1;
            s.passes_failed += 1;
            s.last_error = Some(message.clone());
        });
        let summary = PassSummary::failed(started_at, message);
        if let Err(e) = self.state.record_pass(&summary) {
            warn!(error = %e, "Failed to record pass history");
        }
        summary
    }

    fn execute(
        &self,
        direction: Option<Side>,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> SyncResult<PassSummary> {
        let mut summary = PassSummary::new(started_at);

        // Loading
        self.set_phase(SyncPhase::Loading);
        let issues = validate_all(&self.config.fields);
        if !issues.is_empty() {
            return Err(SyncError::Configuration(
                issues.iter().map(ToString::to_string).collect(),
            ));
        }
        let range = TimeRange::around(
            started_at,
            self.config.lookback_days,
            self.config.lookahead_days,
        );
        let events = self.calendar.list_events(&range)?;
        let rows = self.sheet.list_rows()?;
        let previous = self.state.load()?;
        let snapshot = self.load_snapshot(events, rows, &range, &previous.mapping, &mut summary);
        debug!(
            calendar = snapshot.calendar.len(),
            sheet = snapshot.sheet.len(),
            mapped = previous.mapping.len(),
            quarantined = snapshot.quarantined.len(),
            "Snapshots loaded"
        );

        // Diffing
        self.set_phase(SyncPhase::Diffing);
        let all_ops = diff(&snapshot.calendar, &snapshot.sheet, &previous.mapping);
        let ops = match direction {
            Some(side) => filter_by_origin(all_ops.clone(), side),
            None => all_ops.clone(),
        };
        let kept: BTreeSet<&str> = ops.iter().map(|op| op.id.as_str()).collect();
        let held_back: BTreeSet<String> = all_ops
            .iter()
            .filter(|op| !kept.contains(op.id.as_str()))
            .map(|op| op.id.clone())
            .collect();
        debug!(ops = ops.len(), held_back = held_back.len(), "Diff computed");

        // Resolving
        self.set_phase(SyncPhase::Resolving);
        let mut calendar_ops = Vec::new();
        let mut sheet_ops = Vec::new();
        for op in ops {
            let op = if op.kind == ChangeKind::Conflict {
                summary.counters.conflicts += 1;
                summary.conflict_ids.push(op.id.clone());
                let resolved = resolve(op, self.config.strategy);
                debug!(id = %resolved.id, kind = ?resolved.kind, strategy = %self.config.strategy, "Conflict resolved");
                resolved
            } else {
                op
            };
            match op.target_side() {
                Some(Side::Calendar) => calendar_ops.push(op),
                Some(Side::Sheet) => sheet_ops.push(op),
                None => {}
            }
        }

        // Writing
        self.set_phase(SyncPhase::Writing);
        let deadline = self.config.time_budget.map(|budget| started + budget);
        let mut applied = self.writer.apply(calendar_ops, deadline, |op| {
            self.write_calendar(op, &snapshot, &previous.mapping)
        });
        let sheet_result = self.writer.apply(sheet_ops, deadline, |op| {
            self.write_sheet(op, &snapshot, &previous.mapping)
        });
        applied.merge(sheet_result);

        if applied.all_failed_transiently() {
            return Err(SyncError::TransientIo(format!(
                "all {} attempted writes failed",
                applied.failed.len()
            )));
        }

        let acks = self.acknowledgements(&applied, &snapshot);
        let ack_result = self
            .writer
            .apply(acks, None, |op| self.write_sheet(op, &snapshot, &previous.mapping));
        for failed in &ack_result.failed {
            summary.counters.errors += 1;
            summary.issues.push(RecordIssue {
                id: Some(failed.op.id.clone()),
                side: Side::Sheet,
                message: format!("status write-back failed: {}", failed.error),
            });
        }

        // Committing
        self.set_phase(SyncPhase::Committing);
        let mapping = self.next_mapping(&previous.mapping, &snapshot, &applied, &held_back);

        for done in &applied.succeeded {
            match done.op.kind {
                k if k.is_create() => summary.counters.created += 1,
                k if k.is_delete() => summary.counters.deleted += 1,
                ChangeKind::Update { .. } => summary.counters.updated += 1,
                _ => {}
            }
        }
        for failed in &applied.failed {
            summary.counters.errors += 1;
            summary.issues.push(RecordIssue {
                id: Some(failed.op.id.clone()),
                side: failed.op.target_side().unwrap_or(Side::Sheet),
                message: failed.error.clone(),
            });
        }
        summary.deferred = applied.deferred.len() as u64;
        if !applied.failed.is_empty() || !applied.deferred.is_empty() || !ack_result.failed.is_empty() {
            summary.outcome = PassOutcome::Partial;
        }

        let cursor = SyncCursor {
            last_sync_at: Some(started_at),
            last_run: summary.counters,
            passes_committed: previous.cursor.passes_committed + 1,
        };
        self.state.save(&PersistedState { mapping, cursor })?;

        summary.finished_at = Utc::now();
        if let Err(e) = self.state.record_pass(&summary) {
            warn!(error = %e, "Failed to record pass history");
        }
        Ok(summary)
    }

    /// Map native events and rows to records, quarantining unreadable ones.
    ///
    /// Mapped records stay in the snapshot after moving outside the window:
    /// their sheet rows are kept, and events missing from the listing are
    /// fetched directly so a move is not read as a deletion.
    fn load_snapshot(
        &self,
        events: Vec<CalendarEvent>,
        rows: Vec<SheetRow>,
        range: &TimeRange,
        mapping: &SyncMapping,
        summary: &mut PassSummary,
    ) -> Snapshot {
        let mut snap = Snapshot::default();

        for event in events {
            match calendar_event_to_record(&event, &self.validator) {
                Ok(record) => {
                    if snap.calendar.contains_key(&record.id) {
                        quarantine(&mut snap, summary, Side::Calendar, &record.id, "duplicate id");
                        continue;
                    }
                    snap.event_refs.insert(record.id.clone(), event.id.clone());
                    snap.calendar.insert(record.id.clone(), record);
                }
                Err(e) => {
                    let id = e
                        .record_id()
                        .map(str::to_string)
                        .unwrap_or_else(|| event_sync_id(&event).to_string());
                    quarantine(&mut snap, summary, Side::Calendar, &id, &e.to_string());
                }
            }
        }

        for mut row in rows {
            if row.is_blank() {
                continue;
            }
            let Some(position) = row.position else {
                continue;
            };
            if row.cell(Column::EventId).trim().is_empty() {
                let id = Uuid::new_v4().to_string();
                debug!(row = position, id = %id, "Assigned id to new sheet row");
                row.set(Column::EventId, id.clone());
                snap.fresh_ids.insert(id);
            }
            match sheet_row_to_record(&row, &self.validator) {
                Ok(record) => {
                    if snap.sheet.contains_key(&record.id) {
                        quarantine(&mut snap, summary, Side::Sheet, &record.id, "duplicate id");
                        continue;
                    }
                    if !range.contains(&record.start_at) && !is_live(mapping, &record.id) {
                        snap.out_of_window.insert(record.id);
                        continue;
                    }
                    snap.row_positions.insert(record.id.clone(), position);
                    snap.sheet.insert(record.id.clone(), record);
                }
                Err(e) => {
                    let id = row.cell(Column::EventId).trim().to_string();
                    quarantine(&mut snap, summary, Side::Sheet, &id, &e.to_string());
                }
            }
        }

        self.fetch_unlisted(&mut snap, mapping, summary);

        for id in snap.quarantined.iter().chain(&snap.out_of_window) {
            snap.calendar.remove(id);
            snap.sheet.remove(id);
            snap.event_refs.remove(id);
            snap.row_positions.remove(id);
        }
        snap
    }

    /// Look up mapped events the windowed listing did not return.
    fn fetch_unlisted(
        &self,
        snap: &mut Snapshot,
        mapping: &SyncMapping,
        summary: &mut PassSummary,
    ) {
        for (id, entry) in mapping.iter() {
            if entry.is_retired()
                || snap.calendar.contains_key(id)
                || snap.quarantined.contains(id)
            {
                continue;
            }
            let Some(native_ref) = entry.calendar_ref.as_deref() else {
                continue;
            };
            let event = match self.calendar.get_event(native_ref) {
                Ok(Some(event)) => event,
                Ok(None) | Err(SyncError::NotFound(_)) => continue,
                Err(e) => {
                    quarantine(snap, summary, Side::Calendar, id, &format!("lookup failed: {e}"));
                    continue;
                }
            };
            match calendar_event_to_record(&event, &self.validator) {
                Ok(record) if record.id == *id => {
                    debug!(id = %id, event = %native_ref, "Mapped event found outside window");
                    snap.event_refs.insert(id.clone(), event.id.clone());
                    snap.calendar.insert(id.clone(), record);
                }
                Ok(_) => {}
                Err(e) => quarantine(snap, summary, Side::Calendar, id, &e.to_string()),
            }
        }
    }

    fn write_calendar(
        &self,
        op: &ChangeOp,
        snap: &Snapshot,
        mapping: &SyncMapping,
    ) -> SyncResult<WriteAck> {
        let native_ref = || {
            snap.event_refs
                .get(&op.id)
                .cloned()
                .or_else(|| mapping.get(&op.id).and_then(|e| e.calendar_ref.clone()))
                .ok_or_else(|| SyncError::NotFound(format!("calendar event for {}", op.id)))
        };
        match op.kind {
            ChangeKind::CreateOnCalendar => {
                let record = source(op)?;
                self.calendar
                    .create_event(&record_to_calendar_event(record, None))
            }
            ChangeKind::Update { .. } => {
                let record = source(op)?;
                let native = native_ref()?;
                self.calendar
                    .update_event(&native, &record_to_calendar_event(record, Some(&native)))
            }
            ChangeKind::DeleteOnCalendar => {
                let native = native_ref()?;
                match self.calendar.delete_event(&native) {
                    Ok(()) | Err(SyncError::NotFound(_)) => Ok(WriteAck::removed()),
                    Err(e) => Err(e),
                }
            }
            _ => Err(SyncError::PermanentIo(format!(
                "{:?} cannot be written to the calendar",
                op.kind
            ))),
        }
    }

    fn write_sheet(
        &self,
        op: &ChangeOp,
        snap: &Snapshot,
        mapping: &SyncMapping,
    ) -> SyncResult<WriteAck> {
        let position = || {
            snap.row_positions
                .get(&op.id)
                .copied()
                .or_else(|| mapping.get(&op.id).and_then(|e| e.sheet_row))
                .ok_or_else(|| SyncError::NotFound(format!("sheet row for {}", op.id)))
        };
        match op.kind {
            ChangeKind::CreateOnSheet => {
                let record = source(op)?.clone().with_status(SyncStatus::Synced);
                self.sheet
                    .write_row(&record_to_sheet_row(&record, None, &self.validator))
            }
            ChangeKind::Update { .. } => {
                let record = source(op)?.clone().with_status(SyncStatus::Synced);
                let row = record_to_sheet_row(&record, Some(position()?), &self.validator);
                self.sheet.write_row(&row)
            }
            ChangeKind::DeleteOnSheet => match self.sheet.clear_row(position()?) {
                Ok(()) | Err(SyncError::NotFound(_)) => Ok(WriteAck::removed()),
                Err(e) => Err(e),
            },
            _ => Err(SyncError::PermanentIo(format!(
                "{:?} cannot be written to the sheet",
                op.kind
            ))),
        }
    }

    /// Sheet rows whose content reached the calendar but whose row still
    /// shows a stale status or lacks its id.
    fn acknowledgements(&self, applied: &ApplyResult, snap: &Snapshot) -> Vec<ChangeOp> {
        applied
            .succeeded
            .iter()
            .filter(|done| done.op.target_side() == Some(Side::Calendar))
            .filter_map(|done| {
                let record = snap.sheet.get(&done.op.id)?;
                let stale = record.sync_status != SyncStatus::Synced
                    || snap.fresh_ids.contains(&record.id);
                stale.then(|| {
                    ChangeOp::update(
                        Side::Sheet,
                        record.clone().with_status(SyncStatus::Synced),
                        None,
                    )
                })
            })
            .collect()
    }

    /// Mapping after this pass. Failed, deferred and held-back ids keep their
    /// previous entries so the next pass retries them.
    fn next_mapping(
        &self,
        previous: &SyncMapping,
        snap: &Snapshot,
        applied: &ApplyResult,
        held_back: &BTreeSet<String>,
    ) -> SyncMapping {
        let mut mapping = previous.clone();
        let mut touched: BTreeSet<&str> = held_back.iter().map(String::as_str).collect();
        touched.extend(applied.failed.iter().map(|f| f.op.id.as_str()));
        touched.extend(applied.deferred.iter().map(|op| op.id.as_str()));
        touched.extend(snap.quarantined.iter().map(String::as_str));
        touched.extend(snap.out_of_window.iter().map(String::as_str));

        for done in &applied.succeeded {
            let op = &done.op;
            touched.insert(op.id.as_str());

            if op.kind.is_delete() {
                if let Some(mut entry) = mapping.get(&op.id).cloned() {
                    entry.status = SyncStatus::Deleted;
                    mapping.upsert(op.id.clone(), entry);
                }
                continue;
            }

            let Some(record) = op.source.as_ref() else {
                continue;
            };
            let previous_entry = previous.get(&op.id);
            let mut entry = MappingEntry {
                sheet_row: snap
                    .row_positions
                    .get(&op.id)
                    .copied()
                    .or_else(|| previous_entry.and_then(|e| e.sheet_row)),
                calendar_ref: snap
                    .event_refs
                    .get(&op.id)
                    .cloned()
                    .or_else(|| previous_entry.and_then(|e| e.calendar_ref.clone())),
                calendar_modified_at: record.last_modified_at,
                sheet_modified_at: record.last_modified_at,
                status: SyncStatus::Synced,
            };
            match &done.ack.locator {
                Some(Locator::Event(native)) => entry.calendar_ref = Some(native.clone()),
                Some(Locator::Row(position)) => entry.sheet_row = Some(*position),
                None => {}
            }
            if op.target_side() == Some(Side::Calendar) {
                if let Some(stamped) = done.ack.modified_at {
                    entry.calendar_modified_at = stamped;
                }
            }
            mapping.upsert(op.id.clone(), entry);
        }

        let ids: BTreeSet<String> = previous
            .ids()
            .chain(snap.calendar.keys())
            .chain(snap.sheet.keys())
            .cloned()
            .collect();
        for id in ids {
            if touched.contains(id.as_str()) {
                continue;
            }
            match (snap.calendar.get(&id), snap.sheet.get(&id)) {
                (Some(cal), Some(sheet)) => mapping.upsert(
                    id.clone(),
                    MappingEntry {
                        sheet_row: snap.row_positions.get(&id).copied(),
                        calendar_ref: snap.event_refs.get(&id).cloned(),
                        calendar_modified_at: cal.last_modified_at,
                        sheet_modified_at: sheet.last_modified_at,
                        status: SyncStatus::Synced,
                    },
                ),
                (None, None) => {
                    mapping.remove(&id);
                }
                _ => {}
            }
        }
        mapping
    }
}

fn source(op: &ChangeOp) -> SyncResult<&SyncRecord> {
    op.source
        .as_ref()
        .ok_or_else(|| SyncError::PermanentIo(format!("op for {} carries no record", op.id)))
}

/// Whether `id` has a mapping entry that still links both sides.
fn is_live(mapping: &SyncMapping, id: &str) -> bool {
    mapping.get(id).is_some_and(|e| !e.is_retired())
}

fn quarantine(snap: &mut Snapshot, summary: &mut PassSummary, side: Side, id: &str, message: &str) {
    warn!(side = %side, id = %id, reason = %message, "Skipping unreadable record");
    summary.counters.skipped += 1;
    summary.issues.push(RecordIssue {
        id: (!id.is_empty()).then(|| id.to_string()),
        side,
        message: message.to_string(),
    });
    if !id.is_empty() {
        snap.quarantined.insert(id.to_string());
    }
}
