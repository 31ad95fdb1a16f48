//! Tests for sync_engine module.

#[cfg(test)]
mod tests {
    use super::super::sync_engine::*;
    use crate::sync::batch_writer::RetryConfig;
    use crate::sync::fields::{FieldDefinition, FieldValidator};
    use crate::sync::memory::{
        Fault, MemoryCalendar, MemoryLockStore, MemorySheet, MemoryStateStore,
    };
    use crate::sync::ports::{LockStore, StateStore};
    use crate::sync::record_codec::{
        record_to_sheet_row, CalendarEvent, Column, EventDateTime, ExtendedProperties,
        SYNC_ID_PROPERTY,
    };
    use crate::sync::types::{EventTime, PassOutcome, Side, SyncRecord, SyncStatus};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    type Engine = SyncEngine<MemoryCalendar, MemorySheet, MemoryLockStore, MemoryStateStore>;

    struct Harness {
        calendar: MemoryCalendar,
        sheet: MemorySheet,
        locks: MemoryLockStore,
        state: MemoryStateStore,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                calendar: MemoryCalendar::new(),
                sheet: MemorySheet::new(),
                locks: MemoryLockStore::new(),
                state: MemoryStateStore::new(),
            }
        }

        fn engine(&self) -> Engine {
            self.engine_with(test_config())
        }

        fn engine_with(&self, config: SyncConfig) -> Engine {
            SyncEngine::new(
                self.calendar.clone(),
                self.sheet.clone(),
                self.locks.clone(),
                self.state.clone(),
                config,
            )
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            retry: RetryConfig::immediate(2),
            ..SyncConfig::default()
        }
    }

    /// Whole-second timestamp relative to now.
    fn at(minutes: i64) -> DateTime<Utc> {
        let now = Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap();
        now + Duration::minutes(minutes)
    }

    fn event(id: &str, title: &str, updated: DateTime<Utc>) -> CalendarEvent {
        let start = at(2 * 24 * 60);
        CalendarEvent {
            id: id.to_string(),
            summary: title.to_string(),
            description: None,
            location: Some("HQ".to_string()),
            start: EventDateTime {
                date: None,
                date_time: Some(start),
            },
            end: EventDateTime {
                date: None,
                date_time: Some(start + Duration::hours(1)),
            },
            attendees: Vec::new(),
            recurrence: Vec::new(),
            updated,
            extended_properties: ExtendedProperties::default(),
        }
    }

    fn sheet_record(id: &str, title: &str, modified: DateTime<Utc>, status: SyncStatus) -> SyncRecord {
        let start = at(3 * 24 * 60);
        SyncRecord {
            id: id.to_string(),
            title: title.to_string(),
            description: "from sheet".to_string(),
            location: String::new(),
            start_at: EventTime::DateTime(start),
            end_at: EventTime::DateTime(start + Duration::minutes(30)),
            all_day: false,
            attendees: vec!["ops@example.com".to_string()],
            recurrence_rule: None,
            extensions: FieldValidator::default().defaults(),
            last_modified_at: modified,
            sync_status: status,
        }
    }

    fn push_sheet_row(h: &Harness, record: &SyncRecord) -> u32 {
        let row = record_to_sheet_row(record, None, &FieldValidator::default());
        h.sheet.push_row(row.cells).unwrap()
    }

    #[test]
    fn test_calendar_events_land_on_sheet() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        h.calendar.insert(event("B", "Beta", at(-60))).unwrap();

        let summary = h.engine().run_full_pass();
        assert_eq!(summary.outcome, PassOutcome::Completed);
        assert_eq!(summary.counters.created, 2);

        let row = h.sheet.find("A").unwrap();
        assert_eq!(row.cell(Column::Title), "Alpha");
        assert_eq!(row.cell(Column::SyncStatus), "SYNCED");
        assert_eq!(row.cell(Column::Priority), "3");
        assert_eq!(h.state.snapshot().mapping.len(), 2);
    }

    #[test]
    fn test_second_pass_is_quiet() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        push_sheet_row(&h, &sheet_record("S1", "Sheet one", at(-30), SyncStatus::Pending));

        let engine = h.engine();
        let first = engine.run_full_pass();
        assert_eq!(first.counters.created, 2);

        let second = engine.run_full_pass();
        assert!(second.counters.is_quiet(), "second pass: {second:?}");
        assert_eq!(second.outcome, PassOutcome::Completed);
        assert_eq!(h.state.snapshot().cursor.passes_committed, 2);
    }

    #[test]
    fn test_new_sheet_row_gets_id_and_event() {
        let h = Harness::new();
        let record = sheet_record("", "Unsaved", at(-10), SyncStatus::Pending);
        let position = push_sheet_row(&h, &record);

        let summary = h.engine().run_full_pass();
        assert_eq!(summary.counters.created, 1);

        let row = h.sheet.row(position).unwrap();
        let id = row.cell(Column::EventId).to_string();
        assert_eq!(id.len(), 36);
        assert_eq!(row.cell(Column::SyncStatus), "SYNCED");

        let created = h.calendar.find(&id).unwrap();
        assert_eq!(created.summary, "Unsaved");
        assert_eq!(created.extended_properties.private[SYNC_ID_PROPERTY], id);

        assert!(h.engine().run_full_pass().counters.is_quiet());
    }

    #[test]
    fn test_newer_calendar_edit_wins_conflict() {
        let h = Harness::new();
        h.calendar.insert(event("E1", "Original", at(-120))).unwrap();
        let engine = h.engine();
        engine.run_full_pass();

        let position = h.sheet.find("E1").unwrap().position.unwrap();
        let t1 = at(-20);
        let t2 = at(-10);
        h.sheet.set_cell(position, Column::Title, "Sheet edit").unwrap();
        h.sheet.set_cell(position, Column::LastModified, &t1.to_rfc3339()).unwrap();
        h.sheet.set_cell(position, Column::SyncStatus, "PENDING").unwrap();
        h.calendar.insert(event("E1", "Calendar edit", t2)).unwrap();
        let calendar_writes = h.calendar.write_count();

        let summary = engine.run_full_pass();
        assert_eq!(summary.counters.conflicts, 1);
        assert_eq!(summary.counters.updated, 1);
        assert_eq!(summary.conflict_ids, vec!["E1".to_string()]);

        let row = h.sheet.row(position).unwrap();
        assert_eq!(row.cell(Column::Title), "Calendar edit");
        assert_eq!(row.cell(Column::SyncStatus), "SYNCED");
        assert_eq!(h.calendar.write_count(), calendar_writes);

        assert!(engine.run_full_pass().counters.is_quiet());
    }

    #[test]
    fn test_sheets_wins_strategy_overwrites_calendar() {
        let h = Harness::new();
        h.calendar.insert(event("E1", "Original", at(-120))).unwrap();
        let engine = h.engine_with(SyncConfig {
            strategy: crate::sync::conflict_resolver::ConflictStrategy::SheetsWins,
            ..test_config()
        });
        engine.run_full_pass();

        let position = h.sheet.find("E1").unwrap().position.unwrap();
        h.sheet.set_cell(position, Column::Title, "Sheet edit").unwrap();
        h.sheet.set_cell(position, Column::LastModified, &at(-20).to_rfc3339()).unwrap();
        h.calendar.insert(event("E1", "Calendar edit", at(-10))).unwrap();

        let summary = engine.run_full_pass();
        assert_eq!(summary.counters.conflicts, 1);
        assert_eq!(h.calendar.event("E1").unwrap().summary, "Sheet edit");
    }

    #[test]
    fn test_lock_held_skips_pass() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        assert!(h.locks.try_acquire(LOCK_KEY, StdDuration::from_secs(60)).unwrap());

        let engine = h.engine();
        let summary = engine.run_full_pass();
        assert_eq!(summary.outcome, PassOutcome::SkippedConcurrentRun);
        assert_eq!(summary.counters, Default::default());
        assert!(h.locks.is_held(LOCK_KEY));
        assert!(h.sheet.is_empty());
        assert_eq!(h.state.save_count(), 0);

        let status = engine.status().unwrap();
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.stats.passes_skipped, 1);
    }

    #[test]
    fn test_lock_released_after_pass() {
        let h = Harness::new();
        h.engine().run_full_pass();
        assert!(!h.locks.is_held(LOCK_KEY));

        h.state.fail_load(true);
        h.engine().run_full_pass();
        assert!(!h.locks.is_held(LOCK_KEY));
    }

    #[test]
    fn test_permanent_failure_is_isolated_and_retried_next_pass() {
        let h = Harness::new();
        for id in ["A", "B", "C"] {
            h.calendar.insert(event(id, id, at(-60))).unwrap();
        }
        h.sheet.fail_writes_for("B", Fault::Permanent, 1);

        let engine = h.engine();
        let first = engine.run_full_pass();
        assert_eq!(first.outcome, PassOutcome::Partial);
        assert_eq!(first.counters.created, 2);
        assert_eq!(first.counters.errors, 1);
        assert_eq!(first.issues[0].id.as_deref(), Some("B"));
        assert!(!h.state.snapshot().mapping.contains("B"));

        let second = engine.run_full_pass();
        assert_eq!(second.outcome, PassOutcome::Completed);
        assert_eq!(second.counters.created, 1);
        assert!(h.sheet.find("B").is_some());
    }

    #[test]
    fn test_transient_failure_recovers_within_pass() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        h.sheet.fail_writes_for("A", Fault::RateLimited, 2);

        let summary = h.engine().run_full_pass();
        assert_eq!(summary.outcome, PassOutcome::Completed);
        assert_eq!(summary.counters.created, 1);
    }

    #[test]
    fn test_all_writes_failing_transiently_fails_pass_without_commit() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        h.sheet.fail_writes_for("A", Fault::Transient, 10);

        let engine = h.engine();
        let summary = engine.run_full_pass();
        assert!(matches!(summary.outcome, PassOutcome::Failed { .. }));
        assert_eq!(h.state.save_count(), 0);

        let status = engine.status().unwrap();
        assert_eq!(status.phase, SyncPhase::Error);
        assert_eq!(status.stats.passes_failed, 1);
        assert!(status.stats.last_error.is_some());
    }

    #[test]
    fn test_unreachable_side_fails_pass_and_keeps_state() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        let engine = h.engine();
        engine.run_full_pass();
        let committed = h.state.snapshot();

        h.calendar.fail_listing(Some(Fault::Transient));
        let summary = engine.run_full_pass();
        match summary.outcome {
            PassOutcome::Failed { cause } => assert!(cause.contains("calendar listing")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.state.snapshot(), committed);
        assert!(h.sheet.find("A").is_some());
    }

    #[test]
    fn test_malformed_row_is_skipped_not_deleted() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        let engine = h.engine();
        engine.run_full_pass();

        let position = h.sheet.find("A").unwrap().position.unwrap();
        h.sheet.set_cell(position, Column::StartDate, "someday").unwrap();

        let summary = engine.run_full_pass();
        assert_eq!(summary.outcome, PassOutcome::Completed);
        assert_eq!(summary.counters.skipped, 1);
        assert_eq!(summary.counters.deleted, 0);
        assert!(summary.issues[0].message.contains("StartDate"));
        assert!(h.calendar.event("A").is_some());
        assert!(h.state.snapshot().mapping.contains("A"));
    }

    #[test]
    fn test_out_of_range_priority_is_reported() {
        let h = Harness::new();
        let mut record = sheet_record("P1", "Priority", at(-5), SyncStatus::Pending);
        record.extensions.clear();
        let mut row = record_to_sheet_row(&record, None, &FieldValidator::default());
        row.set(Column::Priority, "7");
        h.sheet.push_row(row.cells).unwrap();

        let summary = h.engine().run_full_pass();
        assert_eq!(summary.counters.skipped, 1);
        assert!(h.calendar.is_empty());

        let clamped = h.engine_with(SyncConfig {
            overflow_policy: crate::sync::fields::OverflowPolicy::Clamp,
            ..test_config()
        });
        let summary = clamped.run_full_pass();
        assert_eq!(summary.counters.created, 1);
        let created = h.calendar.find("P1").unwrap();
        assert_eq!(created.extended_properties.private["calsync_priority"], "5");
    }

    #[test]
    fn test_sheet_deletion_propagates_then_retires() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        let engine = h.engine();
        engine.run_full_pass();

        let position = h.sheet.find("A").unwrap().position.unwrap();
        h.sheet.remove_row(position).unwrap();

        let summary = engine.run_full_pass();
        assert_eq!(summary.counters.deleted, 1);
        assert!(h.calendar.is_empty());
        assert_eq!(
            h.state.snapshot().mapping.get("A").map(|e| e.status),
            Some(SyncStatus::Deleted)
        );

        let after = engine.run_full_pass();
        assert!(after.counters.is_quiet());
        assert!(!h.state.snapshot().mapping.contains("A"));
    }

    #[test]
    fn test_directional_pass_holds_back_other_side() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        let engine = h.engine();
        engine.run_full_pass();

        h.calendar.insert(event("A", "Alpha edited", at(-5))).unwrap();
        push_sheet_row(&h, &sheet_record("N", "New row", at(-5), SyncStatus::Pending));

        let directional = engine.run_directional_pass(Side::Sheet);
        assert_eq!(directional.counters.created, 1);
        assert_eq!(directional.counters.updated, 0);
        assert_eq!(h.sheet.find("A").unwrap().cell(Column::Title), "Alpha");
        assert!(h.calendar.find("N").is_some());

        let full = engine.run_full_pass();
        assert_eq!(full.counters.updated, 1);
        assert_eq!(h.sheet.find("A").unwrap().cell(Column::Title), "Alpha edited");
    }

    #[test]
    fn test_exhausted_budget_defers_writes() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        h.calendar.insert(event("B", "Beta", at(-60))).unwrap();

        let rushed = h.engine_with(SyncConfig {
            time_budget: Some(StdDuration::ZERO),
            ..test_config()
        });
        let summary = rushed.run_full_pass();
        assert_eq!(summary.outcome, PassOutcome::Partial);
        assert_eq!(summary.deferred, 2);
        assert!(h.sheet.is_empty());

        let summary = h.engine().run_full_pass();
        assert_eq!(summary.counters.created, 2);
    }

    #[test]
    fn test_bad_field_definitions_block_pass() {
        let h = Harness::new();
        let mut fields = crate::sync::fields::default_definitions();
        fields.push(FieldDefinition::text("notes", "Notes", 10, ""));

        let summary = h.engine_with(SyncConfig { fields, ..test_config() }).run_full_pass();
        match summary.outcome {
            PassOutcome::Failed { cause } => assert!(cause.contains("Invalid field configuration")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_clear_state_resets_mapping() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        let engine = h.engine();
        engine.run_full_pass();
        assert!(!h.state.snapshot().mapping.is_empty());

        engine.clear_state().unwrap();
        assert!(h.state.snapshot().mapping.is_empty());
        assert_eq!(engine.status().unwrap().cursor.passes_committed, 0);

        // Both sides still agree, so the next pass relinks without writes
        assert!(engine.run_full_pass().counters.is_quiet());
        assert!(h.state.snapshot().mapping.contains("A"));
    }

    #[test]
    fn test_clear_state_refused_while_locked() {
        let h = Harness::new();
        h.locks.try_acquire(LOCK_KEY, StdDuration::from_secs(60)).unwrap();
        assert!(h.engine().clear_state().is_err());
    }

    #[test]
    fn test_pass_history_recorded() {
        let h = Harness::new();
        h.calendar.insert(event("A", "Alpha", at(-60))).unwrap();
        let engine = h.engine();
        engine.run_full_pass();
        engine.run_full_pass();

        let history = engine.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(h.state.recent_passes(1).unwrap(), history[..1].to_vec());
        assert!(history[0].counters.is_quiet());
        assert_eq!(history[1].counters.created, 1);
    }
}
