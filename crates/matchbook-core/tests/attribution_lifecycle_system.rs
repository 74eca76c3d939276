//! End-to-end attribution lifecycle against the in-memory store:
//! selection, status transitions, report emission and batch-driver
//! semantics.

use std::sync::Arc;

use matchbook_core::debug_report::{DropReason, RecordingDebugReportSink};
use matchbook_core::params::{
    AGGREGATE_MAX_REPORT_DELAY_MS, AGGREGATE_MIN_REPORT_DELAY_MS, EngineConfig,
};
use matchbook_core::source::SourceStatus;
use matchbook_core::store::MemoryStore;
use matchbook_core::telemetry::AttributionTelemetry;
use matchbook_core::testing::{active_source, pending_trigger};
use matchbook_core::AttributionEngine;
use matchbook_core::trigger::TriggerStatus;

fn engine_with(
    store: MemoryStore,
    config: EngineConfig,
) -> (AttributionEngine<MemoryStore>, Arc<RecordingDebugReportSink>, AttributionTelemetry) {
    let sink = Arc::new(RecordingDebugReportSink::new());
    let telemetry = AttributionTelemetry::new();
    let config = EngineConfig { jitter_seed: Some(11), ..config };
    let engine = AttributionEngine::new(store, config, sink.clone(), telemetry.clone());
    (engine, sink, telemetry)
}

#[test]
fn priority_race_attributes_one_source_and_ignores_the_rest() {
    let store = MemoryStore::new();
    let mut high = active_source("high");
    high.priority = 10;
    high.event_time = 1_000;
    let mut low = active_source("low");
    low.priority = 5;
    low.event_time = 1_001;
    store.seed_source(high);
    store.seed_source(low);
    store.seed_trigger(pending_trigger("T1", 10_000));

    let (engine, _, _) = engine_with(store, EngineConfig::default());
    assert!(engine.perform_pending_attributions());

    let state = engine.store().snapshot();
    assert_eq!(state.triggers["T1"].status, TriggerStatus::Attributed);
    assert_eq!(state.sources["high"].status, SourceStatus::Active);
    assert_eq!(state.sources["low"].status, SourceStatus::Ignored);

    let reports: Vec<_> = state.event_reports.values().collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].source_id, "high");
    assert_eq!(reports[0].trigger_id, "T1");

    assert_eq!(state.attribution_ledger.len(), 1);
    assert_eq!(state.attribution_ledger[0].source_id.as_deref(), Some("high"));
    assert_eq!(state.attribution_ledger[0].source_time, 1_000);
}

#[test]
fn no_matching_source_ignores_the_trigger_and_signals_it() {
    let store = MemoryStore::new();
    store.seed_trigger(pending_trigger("T1", 10_000));

    let (engine, sink, telemetry) = engine_with(store, EngineConfig::default());
    assert!(engine.perform_pending_attributions());

    let state = engine.store().snapshot();
    assert_eq!(state.triggers["T1"].status, TriggerStatus::Ignored);
    assert!(state.event_reports.is_empty());
    assert!(state.attribution_ledger.is_empty());

    let scheduled = sink.drain();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].reason, DropReason::TriggerNoMatchingSource);

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.failure_total.get("no_matching_source"), Some(&1));
}

#[test]
fn reprocessing_a_finished_queue_changes_nothing() {
    let store = MemoryStore::new();
    store.seed_source(active_source("S1"));
    store.seed_trigger(pending_trigger("T1", 10_000));

    let (engine, _, telemetry) = engine_with(store, EngineConfig::default());
    assert!(engine.perform_pending_attributions());
    let after_first = engine.store().snapshot();

    assert!(engine.perform_pending_attributions());
    let after_second = engine.store().snapshot();

    assert_eq!(after_first.triggers["T1"].status, TriggerStatus::Attributed);
    assert_eq!(after_second.event_reports.len(), after_first.event_reports.len());
    assert_eq!(after_second.attribution_ledger.len(), 1);
    // the second pass saw an empty queue, not the settled trigger
    assert_eq!(telemetry.snapshot().attempts_total, 1);
}

#[test]
fn event_window_passed_still_allows_the_aggregate_path() {
    let store = MemoryStore::new();
    let mut source = active_source("S1");
    source.event_report_window = 5_000;
    source.aggregatable_report_window = 50_000;
    source.aggregation_keys = Some(r#"{"campaignCounts": "0x159"}"#.into());
    store.seed_source(source);

    let mut trigger = pending_trigger("T1", 10_000);
    trigger.aggregatable_trigger_data =
        Some(r#"[{"key_piece": "0x400", "source_keys": ["campaignCounts"]}]"#.into());
    trigger.aggregatable_values = Some(r#"{"campaignCounts": 1664}"#.into());
    store.seed_trigger(trigger);

    let (engine, sink, _) = engine_with(store, EngineConfig::default());
    assert!(engine.perform_pending_attributions());

    let state = engine.store().snapshot();
    assert_eq!(state.triggers["T1"].status, TriggerStatus::Attributed);
    assert!(state.event_reports.is_empty());

    let reports: Vec<_> = state.aggregate_reports.values().collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].contributions.len(), 1);
    assert_eq!(reports[0].contributions[0].key, 0x559);
    assert_eq!(reports[0].contributions[0].value, 1_664);
    let jitter = reports[0].scheduled_report_time - 10_000;
    assert!((AGGREGATE_MIN_REPORT_DELAY_MS..AGGREGATE_MAX_REPORT_DELAY_MS).contains(&jitter));

    assert_eq!(state.sources["S1"].aggregate_contributions, 1_664);
    assert!(
        sink.drain().iter().any(|s| s.reason == DropReason::TriggerEventReportWindowPassed),
        "event path must classify the window miss"
    );
}

#[test]
fn both_report_paths_can_succeed_in_one_pass() {
    let store = MemoryStore::new();
    let mut source = active_source("S1");
    source.aggregation_keys = Some(r#"{"campaignCounts": "0x10"}"#.into());
    store.seed_source(source);

    let mut trigger = pending_trigger("T1", 10_000);
    trigger.event_triggers =
        Some(r#"[{"trigger_data": "3", "priority": 9, "deduplication_key": "55"}]"#.into());
    trigger.aggregatable_values = Some(r#"{"campaignCounts": 400}"#.into());
    trigger.aggregatable_dedup_keys = Some(r#"[{"deduplication_key": "77"}]"#.into());
    store.seed_trigger(trigger);

    let (engine, _, _) = engine_with(store, EngineConfig::default());
    assert!(engine.perform_pending_attributions());

    let state = engine.store().snapshot();
    assert_eq!(state.event_reports.len(), 1);
    assert_eq!(state.aggregate_reports.len(), 1);
    let source = &state.sources["S1"];
    assert_eq!(source.event_report_dedup_keys, vec![55]);
    assert_eq!(source.aggregate_report_dedup_keys, vec![77]);
    assert_eq!(source.aggregate_contributions, 400);
    assert_eq!(state.attribution_ledger.len(), 1);
}

#[test]
fn event_dedup_key_collision_drops_regardless_of_priority() {
    let store = MemoryStore::new();
    let mut source = active_source("S1");
    source.event_report_dedup_keys = vec![42];
    store.seed_source(source);

    let mut trigger = pending_trigger("T1", 10_000);
    trigger.event_triggers =
        Some(r#"[{"trigger_data": "1", "priority": 999999, "deduplication_key": "42"}]"#.into());
    store.seed_trigger(trigger);

    let (engine, sink, _) = engine_with(store, EngineConfig::default());
    assert!(engine.perform_pending_attributions());

    let state = engine.store().snapshot();
    assert_eq!(state.triggers["T1"].status, TriggerStatus::Ignored);
    assert!(state.event_reports.is_empty());
    assert!(sink.drain().iter().any(|s| s.reason == DropReason::TriggerEventDeduplicated));
}

#[test]
fn top_level_filter_mismatch_never_promotes_the_runner_up() {
    let store = MemoryStore::new();
    let mut winner = active_source("winner");
    winner.priority = 10;
    winner.filter_data = Some(r#"{"product": ["1"]}"#.into());
    let mut runner_up = active_source("runner-up");
    runner_up.priority = 5;
    runner_up.filter_data = Some(r#"{"product": ["2"]}"#.into());
    store.seed_source(winner);
    store.seed_source(runner_up);

    let mut trigger = pending_trigger("T1", 10_000);
    trigger.filters = Some(r#"[{"product": ["2"]}]"#.into());
    store.seed_trigger(trigger);

    let (engine, sink, _) = engine_with(store, EngineConfig::default());
    assert!(engine.perform_pending_attributions());

    let state = engine.store().snapshot();
    assert_eq!(state.triggers["T1"].status, TriggerStatus::Ignored);
    // the losing candidate is untouched: the race never settled
    assert_eq!(state.sources["runner-up"].status, SourceStatus::Active);
    assert!(state.event_reports.is_empty());
    assert!(sink.drain().iter().any(|s| s.reason == DropReason::TriggerNoMatchingFilterData));
}

#[test]
fn empty_queue_drains_cleanly_every_time() {
    let store = MemoryStore::new();
    let (engine, _, telemetry) = engine_with(store, EngineConfig::default());
    assert!(engine.perform_pending_attributions());
    assert!(engine.perform_pending_attributions());
    assert_eq!(telemetry.snapshot().attempts_total, 0);
    assert!(engine.store().snapshot().event_reports.is_empty());
}

#[test]
fn batch_cap_leaves_overflow_for_the_next_pass() {
    let store = MemoryStore::new();
    store.seed_source(active_source("S1"));
    for i in 0..3 {
        let mut t = pending_trigger(&format!("T{i}"), 10_000 + i);
        // distinct dedup keys so every trigger lands a report
        t.event_triggers = Some(format!(
            r#"[{{"trigger_data": "1", "priority": 1, "deduplication_key": "{i}"}}]"#
        ));
        store.seed_trigger(t);
    }

    let config = EngineConfig { max_attributions_per_invocation: 2, ..EngineConfig::default() };
    let (engine, _, _) = engine_with(store, config);

    assert!(!engine.perform_pending_attributions(), "overflow batch must request another pass");
    let state = engine.store().snapshot();
    assert_eq!(state.triggers["T2"].status, TriggerStatus::Pending);

    assert!(engine.perform_pending_attributions());
    let state = engine.store().snapshot();
    assert_ne!(state.triggers["T2"].status, TriggerStatus::Pending);
}

#[test]
fn hard_store_failure_aborts_the_batch_and_keeps_settled_work() {
    let store = MemoryStore::new();
    store.seed_source(active_source("S1"));
    let mut t0 = pending_trigger("T0", 10_000);
    t0.event_triggers =
        Some(r#"[{"trigger_data": "1", "priority": 1, "deduplication_key": "1"}]"#.into());
    let mut t1 = pending_trigger("T1", 10_001);
    t1.event_triggers =
        Some(r#"[{"trigger_data": "1", "priority": 1, "deduplication_key": "2"}]"#.into());
    store.seed_trigger(t0);
    store.seed_trigger(t1);

    // transaction 0 fetches the queue, 1 settles T0, 2 would settle T1
    store.fail_on_transaction(2);

    let (engine, _, _) = engine_with(store, EngineConfig::default());
    assert!(!engine.perform_pending_attributions(), "hard failure must signal a retry");

    let state = engine.store().snapshot();
    assert_eq!(state.triggers["T0"].status, TriggerStatus::Attributed);
    assert_eq!(state.triggers["T1"].status, TriggerStatus::Pending);

    assert!(engine.perform_pending_attributions());
    let state = engine.store().snapshot();
    assert_eq!(state.triggers["T1"].status, TriggerStatus::Attributed);
    assert_eq!(state.event_reports.len(), 2);
}
