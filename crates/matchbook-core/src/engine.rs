// Copyright (c) 2026 Matchbook Contributors
// SPDX-License-Identifier: Apache-2.0

//! The attribution orchestrator.
//!
//! One pass pulls pending triggers and resolves each inside its own
//! store transaction: select the winning source, check rate limits,
//! attempt the aggregate and event report paths, then persist the
//! status flips, dedup-key growth and the ledger row together.
//! Soft failures classify and ignore the trigger; a store failure
//! aborts the trigger and the rest of the batch (retry later).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::aggregate::{accumulate_contributions, assemble_contributions, extract_dedup_key};
use crate::debug_report::{DebugReportSink, DropReason, NoopDebugReportSink};
use crate::error::{MatchbookError, MatchbookResult};
use crate::filter::{self, FilterMap};
use crate::params::{
    AGGREGATE_MAX_REPORT_DELAY_MS, AGGREGATE_MIN_REPORT_DELAY_MS, EngineConfig,
    MAX_SUM_OF_AGGREGATE_VALUES_PER_SOURCE, RATE_LIMIT_WINDOW_MS,
};
use crate::report::{self, AggregateReport, AttributionLedgerRow, EventReport, ReportStatus};
use crate::site;
use crate::source::{AttributionMode, Source, SourceStatus};
use crate::store::{StoreTransaction, TransactionalStore};
use crate::telemetry::{
    AttemptResult, AttributionAttempt, AttributionTelemetry, FailureKind, SurfaceCombination,
};
use crate::trigger::{EventTrigger, Trigger, TriggerStatus};
use crate::xna;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Triggering {
    Attributed,
    Dropped,
}

pub struct AttributionEngine<S> {
    store: S,
    config: EngineConfig,
    debug_sink: Arc<dyn DebugReportSink>,
    telemetry: AttributionTelemetry,
    jitter: Mutex<ChaCha8Rng>,
}

impl<S: TransactionalStore> AttributionEngine<S> {
    pub fn new(
        store: S,
        config: EngineConfig,
        debug_sink: Arc<dyn DebugReportSink>,
        telemetry: AttributionTelemetry,
    ) -> Self {
        let seed = config.jitter_seed.unwrap_or_else(|| rand::rngs::OsRng.next_u64());
        Self {
            store,
            config,
            debug_sink,
            telemetry,
            jitter: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn with_defaults(store: S) -> Self {
        Self::new(
            store,
            EngineConfig::default(),
            Arc::new(NoopDebugReportSink),
            AttributionTelemetry::new(),
        )
    }

    pub fn telemetry(&self) -> &AttributionTelemetry {
        &self.telemetry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Processes up to the batch ceiling of pending triggers.
    /// Returns `false` when a hard store failure aborted the batch or
    /// the retrieved batch hit the ceiling (queue may not be drained);
    /// callers reschedule on `false`.
    pub fn perform_pending_attributions(&self) -> bool {
        let pending = match self.fetch_pending_trigger_ids() {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %err, "pending-trigger retrieval failed; rescheduling batch");
                return false;
            }
        };

        let cap = self.config.max_attributions_per_invocation;
        for trigger_id in pending.iter().take(cap) {
            match self.attribute_one(trigger_id) {
                Ok(attempt) => self.telemetry.record_attempt(attempt),
                Err(err) => {
                    tracing::warn!(
                        trigger_id = %trigger_id,
                        error = %err,
                        "attribution aborted; rescheduling batch"
                    );
                    return false;
                }
            }
        }
        cap >= pending.len()
    }

    fn fetch_pending_trigger_ids(&self) -> MatchbookResult<Vec<String>> {
        let mut txn = self.store.transaction()?;
        let ids = txn.pending_trigger_ids()?;
        txn.commit()?;
        Ok(ids)
    }

    /// Resolves one trigger inside one transaction. `Err` means a
    /// hard failure: the transaction is dropped uncommitted and the
    /// batch aborts.
    fn attribute_one(&self, trigger_id: &str) -> MatchbookResult<AttributionAttempt> {
        let mut txn = self.store.transaction()?;
        let trigger = txn.trigger_by_id(trigger_id)?;

        if trigger.status != TriggerStatus::Pending {
            txn.commit()?;
            return Ok(AttributionAttempt::failed(trigger_id, FailureKind::TriggerAlreadyHandled));
        }

        let selection = self.select_source(txn.as_mut(), &trigger)?;

        // Competing source that registered too late to participate;
        // observational only.
        if let Some(delayed) = txn.nearest_delayed_matching_source(&trigger)? {
            self.telemetry
                .record_delayed_source_registration(delayed.event_time - trigger.trigger_time);
        }

        let Some((winner, runner_ups)) = selection else {
            self.drop_path(DropReason::TriggerNoMatchingSource, None, &trigger, None);
            return self.ignore_trigger(txn, &trigger, FailureKind::NoMatchingSource);
        };
        let mut winner = winner;

        if !self.top_level_filters_match(&winner, &trigger) {
            return self.ignore_trigger(txn, &trigger, FailureKind::TopLevelFilterMismatch);
        }

        if self.rate_limits_block(txn.as_mut(), &winner, &trigger)? {
            tracing::debug!(
                source_id = %winner.id,
                trigger_id = %trigger.id,
                "attribution blocked by rate limits"
            );
            return self.ignore_trigger(txn, &trigger, FailureKind::RateLimitExceeded);
        }

        let aggregate = self.maybe_generate_aggregate_report(txn.as_mut(), &mut winner, &trigger)?;
        let event = self.maybe_generate_event_report(txn.as_mut(), &mut winner, &trigger)?;

        if aggregate == Triggering::Dropped && event == Triggering::Dropped {
            return self.ignore_trigger(txn, &trigger, FailureKind::NoReportsGenerated);
        }

        self.ignore_competing_sources(txn.as_mut(), &runner_ups, &trigger)?;
        txn.update_trigger_status(std::slice::from_ref(&trigger.id), TriggerStatus::Attributed)?;
        txn.insert_ledger_row(&AttributionLedgerRow::for_attribution(&winner, &trigger)?)?;
        txn.commit()?;

        tracing::debug!(
            source_id = %winner.id,
            trigger_id = %trigger.id,
            derived = winner.is_derived(),
            "trigger attributed"
        );
        Ok(AttributionAttempt {
            trigger_id: trigger.id.clone(),
            result: AttemptResult::Success,
            failure: FailureKind::None,
            source_type: Some(winner.source_type),
            surfaces: Some(SurfaceCombination::from_surfaces(
                winner.publisher_surface,
                trigger.destination_surface,
            )),
            attribution_delay_ms: now_ms().saturating_sub(trigger.trigger_time),
            source_derived: winner.is_derived(),
            install_attribution: winner.install_attributed,
        })
    }

    fn ignore_trigger(
        &self,
        mut txn: Box<dyn StoreTransaction + '_>,
        trigger: &Trigger,
        failure: FailureKind,
    ) -> MatchbookResult<AttributionAttempt> {
        txn.update_trigger_status(std::slice::from_ref(&trigger.id), TriggerStatus::Ignored)?;
        txn.commit()?;
        Ok(AttributionAttempt::failed(trigger.id.clone(), failure))
    }

    /// Candidate retrieval plus the deterministic priority race.
    /// Descending order: install-attributed inside its cooldown
    /// window first, then priority, then recency; the sort is stable
    /// so retrieval order breaks remaining ties.
    fn select_source(
        &self,
        txn: &mut dyn StoreTransaction,
        trigger: &Trigger,
    ) -> MatchbookResult<Option<(Source, Vec<Source>)>> {
        let mut candidates = match trigger.attribution_config.as_deref() {
            Some(raw) if self.config.enable_xna => {
                let networks = xna::extract_network_ids(raw);
                let all = txn.xna_matching_sources(trigger, &networks)?;
                let (own, foreign): (Vec<Source>, Vec<Source>) =
                    all.into_iter().partition(|s| s.network_id == trigger.network_id);
                let derived = xna::generate_derived_sources(trigger, &foreign);
                own.into_iter().chain(derived).collect()
            }
            _ => txn.matching_active_sources(trigger)?,
        };
        if candidates.is_empty() {
            return Ok(None);
        }

        candidates.sort_by(|a, b| {
            let a_install = a.install_attributed && a.is_within_install_cooldown(trigger.trigger_time);
            let b_install = b.install_attributed && b.is_within_install_cooldown(trigger.trigger_time);
            b_install
                .cmp(&a_install)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| b.event_time.cmp(&a.event_time))
        });

        let winner = candidates.remove(0);
        Ok(Some((winner, candidates)))
    }

    /// Applied to the winner only, after the priority race; a
    /// mismatch drops the whole trigger with no second-place
    /// promotion. Malformed JSON on either side fails closed.
    fn top_level_filters_match(&self, source: &Source, trigger: &Trigger) -> bool {
        let source_filters = match source.filter_map() {
            Ok(map) => map,
            Err(err) => {
                tracing::debug!(source_id = %source.id, error = %err, "source filter data unparsable");
                return false;
            }
        };
        let (filters, not_filters) =
            match (trigger.top_level_filters(), trigger.top_level_not_filters()) {
                (Ok(filters), Ok(not_filters)) => (filters, not_filters),
                _ => {
                    tracing::debug!(trigger_id = %trigger.id, "trigger filters unparsable");
                    return false;
                }
            };

        let matched = filter::is_filter_match(&source_filters, &filters, true)
            && filter::is_filter_match(&source_filters, &not_filters, false);
        if !matched && (!filters.is_empty() || !not_filters.is_empty()) {
            self.drop_path(DropReason::TriggerNoMatchingFilterData, Some(source), trigger, None);
        }
        matched
    }

    fn rate_limits_block(
        &self,
        txn: &mut dyn StoreTransaction,
        source: &Source,
        trigger: &Trigger,
    ) -> MatchbookResult<bool> {
        Ok(!self.attribution_quota_available(txn, source, trigger)?
            || !self.network_within_privacy_bounds(txn, source, trigger)?)
    }

    /// Ledger rows for the (source site, destination site, network)
    /// triple inside the sliding window.
    fn attribution_quota_available(
        &self,
        txn: &mut dyn StoreTransaction,
        source: &Source,
        trigger: &Trigger,
    ) -> MatchbookResult<bool> {
        let source_site = site::top_private_site(&source.publisher, source.publisher_surface)
            .ok_or_else(|| MatchbookError::MalformedOrigin {
                role: "publisher",
                uri: source.publisher.clone(),
            })?;
        let destination_site =
            site::top_private_site(&trigger.attribution_destination, trigger.destination_surface)
                .ok_or_else(|| MatchbookError::MalformedOrigin {
                    role: "destination",
                    uri: trigger.attribution_destination.clone(),
                })?;
        let count = txn.count_ledger_rows_in_window(
            &source_site,
            &destination_site,
            &trigger.network_id,
            trigger.trigger_time - RATE_LIMIT_WINDOW_MS,
            trigger.trigger_time,
        )?;
        if count >= self.config.max_attributions_per_rate_limit_window {
            self.drop_path(
                DropReason::TriggerAttributionsPerSourceDestinationLimit,
                Some(source),
                trigger,
                Some(count),
            );
        }
        Ok(count < self.config.max_attributions_per_rate_limit_window)
    }

    /// Distinct other networks attributing to the same publisher ×
    /// destination pair. Unresolvable sites pass the check; the
    /// quota check above has already insisted on well-formed origins.
    fn network_within_privacy_bounds(
        &self,
        txn: &mut dyn StoreTransaction,
        source: &Source,
        trigger: &Trigger,
    ) -> MatchbookResult<bool> {
        let source_site = site::top_private_site(&source.publisher, source.publisher_surface);
        let destination_site =
            site::top_private_site(&trigger.attribution_destination, trigger.destination_surface);
        let (Some(source_site), Some(destination_site)) = (source_site, destination_site) else {
            tracing::debug!(
                publisher = %source.publisher,
                destination = %trigger.attribution_destination,
                "site extraction failed; skipping distinct-network bound"
            );
            return Ok(true);
        };
        let count = txn.count_distinct_networks_in_window(
            &source_site,
            &destination_site,
            &trigger.network_id,
            trigger.trigger_time - RATE_LIMIT_WINDOW_MS,
            trigger.trigger_time,
        )?;
        if count >= self.config.max_distinct_networks_in_attribution {
            self.drop_path(
                DropReason::TriggerReportingOriginLimit,
                Some(source),
                trigger,
                Some(count),
            );
        }
        Ok(count < self.config.max_distinct_networks_in_attribution)
    }

    fn maybe_generate_aggregate_report(
        &self,
        txn: &mut dyn StoreTransaction,
        source: &mut Source,
        trigger: &Trigger,
    ) -> MatchbookResult<Triggering> {
        if trigger.trigger_time > source.aggregatable_report_window {
            self.drop_path(
                DropReason::TriggerAggregateReportWindowPassed,
                Some(source),
                trigger,
                None,
            );
            return Ok(Triggering::Dropped);
        }

        let existing = txn.count_aggregate_reports_for_destination(
            &trigger.attribution_destination,
            trigger.destination_surface,
        )?;
        if existing >= self.config.max_aggregate_reports_per_destination {
            tracing::debug!(
                destination = %trigger.attribution_destination,
                reports = existing,
                "aggregate reports for destination at storage limit"
            );
            self.drop_path(
                DropReason::TriggerAggregateStorageLimit,
                Some(source),
                trigger,
                Some(existing),
            );
            return Ok(Triggering::Dropped);
        }

        let aggregatable_trigger = match trigger.aggregatable_trigger() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(trigger_id = %trigger.id, error = %err, "aggregatable trigger unparsable");
                return Ok(Triggering::Dropped);
            }
        };
        let aggregatable_source = match source.aggregatable_source() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(source_id = %source.id, error = %err, "aggregation keys unparsable");
                return Ok(Triggering::Dropped);
            }
        };

        let dedup_key = match (&aggregatable_source, &aggregatable_trigger) {
            (Some(s), Some(t)) => extract_dedup_key(t, &s.filter_map),
            _ => None,
        };
        if let Some(key) = dedup_key {
            if source.aggregate_report_dedup_keys.contains(&key) {
                self.drop_path(
                    DropReason::TriggerAggregateDeduplicated,
                    Some(source),
                    trigger,
                    None,
                );
                return Ok(Triggering::Dropped);
            }
        }

        let (Some(aggregatable_source), Some(aggregatable_trigger)) =
            (aggregatable_source, aggregatable_trigger)
        else {
            return Ok(Triggering::Dropped);
        };

        let contributions = assemble_contributions(&aggregatable_source, &aggregatable_trigger);
        if contributions.is_empty() {
            self.drop_path(
                DropReason::TriggerAggregateNoContributions,
                Some(source),
                trigger,
                None,
            );
            return Ok(Triggering::Dropped);
        }

        let Some(new_total) = accumulate_contributions(
            source.aggregate_contributions,
            &contributions,
            MAX_SUM_OF_AGGREGATE_VALUES_PER_SOURCE,
        ) else {
            tracing::debug!(
                source_id = %source.id,
                trigger_id = %trigger.id,
                "aggregate contributions exceeded the per-source budget"
            );
            self.drop_path(
                DropReason::TriggerAggregateInsufficientBudget,
                Some(source),
                trigger,
                Some(u64::from(MAX_SUM_OF_AGGREGATE_VALUES_PER_SOURCE)),
            );
            return Ok(Triggering::Dropped);
        };

        let report_time = trigger.trigger_time + self.aggregate_report_jitter();
        let report = AggregateReport::for_attribution(
            source,
            trigger,
            contributions,
            dedup_key,
            report_time,
        );

        // Derived sources never persist; their parent accumulated
        // nothing, so neither budget nor dedup state is written back.
        if !source.is_derived() {
            source.aggregate_contributions = new_total;
            if let Some(key) = dedup_key {
                source.aggregate_report_dedup_keys.push(key);
            }
            txn.update_source_aggregate_contributions(source)?;
            txn.update_source_aggregate_dedup_keys(source)?;
        }
        txn.insert_aggregate_report(&report)?;
        Ok(Triggering::Attributed)
    }

    fn aggregate_report_jitter(&self) -> i64 {
        if AGGREGATE_MAX_REPORT_DELAY_MS <= AGGREGATE_MIN_REPORT_DELAY_MS {
            return AGGREGATE_MIN_REPORT_DELAY_MS;
        }
        self.jitter
            .lock()
            .gen_range(AGGREGATE_MIN_REPORT_DELAY_MS..AGGREGATE_MAX_REPORT_DELAY_MS)
    }

    fn maybe_generate_event_report(
        &self,
        txn: &mut dyn StoreTransaction,
        source: &mut Source,
        trigger: &Trigger,
    ) -> MatchbookResult<Triggering> {
        if source.is_derived() {
            tracing::debug!(trigger_id = %trigger.id, "derived source; event path skipped");
            return Ok(Triggering::Dropped);
        }
        if source.attribution_mode != AttributionMode::Truthful {
            self.drop_path(DropReason::TriggerEventNoise, Some(source), trigger, None);
            return Ok(Triggering::Dropped);
        }
        if trigger.trigger_time > source.event_report_window {
            self.drop_path(
                DropReason::TriggerEventReportWindowPassed,
                Some(source),
                trigger,
                None,
            );
            return Ok(Triggering::Dropped);
        }

        let event_triggers = match trigger.parse_event_triggers() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(trigger_id = %trigger.id, error = %err, "event triggers unparsable");
                return Ok(Triggering::Dropped);
            }
        };
        let source_filters = match source.filter_map() {
            Ok(map) => map,
            Err(err) => {
                tracing::debug!(source_id = %source.id, error = %err, "source filter data unparsable");
                return Ok(Triggering::Dropped);
            }
        };

        // First match wins, not best match.
        let Some(event_trigger) = event_triggers
            .iter()
            .find(|et| event_filters_match(&source_filters, et))
        else {
            if !event_triggers.is_empty() {
                self.drop_path(
                    DropReason::TriggerEventNoMatchingConfigurations,
                    Some(source),
                    trigger,
                    None,
                );
            }
            return Ok(Triggering::Dropped);
        };

        if let Some(key) = event_trigger.dedup_key {
            if source.event_report_dedup_keys.contains(&key) {
                self.drop_path(DropReason::TriggerEventDeduplicated, Some(source), trigger, None);
                return Ok(Triggering::Dropped);
            }
        }

        let existing = txn.count_event_reports_for_destination(
            &trigger.attribution_destination,
            trigger.destination_surface,
        )?;
        if existing >= self.config.max_event_reports_per_destination {
            tracing::debug!(
                destination = %trigger.attribution_destination,
                reports = existing,
                "event reports for destination at storage limit"
            );
            self.drop_path(
                DropReason::TriggerEventStorageLimit,
                Some(source),
                trigger,
                Some(existing),
            );
            return Ok(Triggering::Dropped);
        }

        let report_time = report::event_report_time(source, trigger.trigger_time);
        let new_report = EventReport::for_attribution(source, trigger, event_trigger, report_time);

        if !self.provision_event_report_quota(txn, source, trigger, &new_report)? {
            return Ok(Triggering::Dropped);
        }

        if let Some(key) = event_trigger.dedup_key {
            source.event_report_dedup_keys.push(key);
        }
        txn.update_source_event_dedup_keys(source)?;
        txn.insert_event_report(&new_report)?;
        Ok(Triggering::Attributed)
    }

    /// Per-source report-count provisioning with lowest-priority
    /// eviction inside the new report's report-time bucket. Evicting
    /// releases the victim's dedup key back onto the source.
    fn provision_event_report_quota(
        &self,
        txn: &mut dyn StoreTransaction,
        source: &mut Source,
        trigger: &Trigger,
        new_report: &EventReport,
    ) -> MatchbookResult<bool> {
        let existing = txn.source_event_reports(&source.id)?;
        if existing.len() < report::max_event_reports(source, trigger.destination_surface) {
            return Ok(true);
        }

        let mut bucket: Vec<&EventReport> = existing
            .iter()
            .filter(|r| {
                r.status == ReportStatus::Pending && r.report_time == new_report.report_time
            })
            .collect();
        bucket.sort_by(|a, b| {
            a.trigger_priority
                .cmp(&b.trigger_priority)
                .then_with(|| b.trigger_time.cmp(&a.trigger_time))
        });

        let Some(lowest) = bucket.first() else {
            self.drop_path(DropReason::TriggerEventExcessiveReports, Some(source), trigger, None);
            return Ok(false);
        };
        if lowest.trigger_priority >= new_report.trigger_priority {
            self.drop_path(DropReason::TriggerEventLowPriority, Some(source), trigger, None);
            return Ok(false);
        }

        if let Some(victim_key) = lowest.trigger_dedup_key {
            source.event_report_dedup_keys.retain(|k| *k != victim_key);
        }
        let victim_id = lowest.id.clone();
        txn.delete_event_report(&victim_id)?;
        tracing::debug!(
            source_id = %source.id,
            evicted_report = %victim_id,
            "evicted lowest-priority pending report"
        );
        Ok(true)
    }

    /// Runner-up originals flip to IGNORED; runner-up derived sources
    /// are recorded against their parent for this network instead.
    fn ignore_competing_sources(
        &self,
        txn: &mut dyn StoreTransaction,
        runner_ups: &[Source],
        trigger: &Trigger,
    ) -> MatchbookResult<()> {
        let mut original_ids = Vec::new();
        for source in runner_ups {
            match &source.parent_id {
                None => original_ids.push(source.id.clone()),
                Some(parent_id) => {
                    txn.record_xna_ignored_source(parent_id, &trigger.network_id)?;
                }
            }
        }
        if !original_ids.is_empty() {
            txn.update_source_status(&original_ids, SourceStatus::Ignored)?;
        }
        Ok(())
    }

    fn drop_path(
        &self,
        reason: DropReason,
        source: Option<&Source>,
        trigger: &Trigger,
        limit: Option<u64>,
    ) {
        self.debug_sink.schedule(reason, source, trigger, limit);
        self.telemetry.record_drop(reason);
    }
}

fn event_filters_match(source_filters: &FilterMap, event_trigger: &EventTrigger) -> bool {
    filter::is_filter_match(source_filters, &event_trigger.filters, true)
        && filter::is_filter_match(source_filters, &event_trigger.not_filters, false)
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{active_source, pending_trigger};

    fn engine(store: MemoryStore) -> AttributionEngine<MemoryStore> {
        let config = EngineConfig { jitter_seed: Some(7), ..EngineConfig::default() };
        AttributionEngine::new(
            store,
            config,
            Arc::new(NoopDebugReportSink),
            AttributionTelemetry::new(),
        )
    }

    #[test]
    fn selection_prefers_priority_then_recency() {
        let store = MemoryStore::new();
        let mut low = active_source("low");
        low.priority = 5;
        low.event_time = 2_000;
        let mut high = active_source("high");
        high.priority = 10;
        high.event_time = 1_000;
        store.seed_source(low);
        store.seed_source(high);

        let engine = engine(store);
        let trigger = pending_trigger("T1", 10_000);
        let mut txn = engine.store().transaction().expect("txn");
        let (winner, runner_ups) =
            engine.select_source(txn.as_mut(), &trigger).expect("select").expect("candidates");
        assert_eq!(winner.id, "high");
        assert_eq!(runner_ups.len(), 1);
        assert_eq!(runner_ups[0].id, "low");
    }

    #[test]
    fn install_attributed_sources_outrank_higher_priority() {
        let store = MemoryStore::new();
        let mut installed = active_source("installed");
        installed.priority = 1;
        installed.install_attributed = true;
        installed.install_cooldown_window = 50_000;
        let mut high = active_source("high");
        high.priority = 100;
        store.seed_source(installed);
        store.seed_source(high);

        let engine = engine(store);
        let trigger = pending_trigger("T1", 10_000);
        let mut txn = engine.store().transaction().expect("txn");
        let (winner, _) =
            engine.select_source(txn.as_mut(), &trigger).expect("select").expect("candidates");
        assert_eq!(winner.id, "installed");
    }

    #[test]
    fn expired_install_cooldown_loses_its_head_start() {
        let store = MemoryStore::new();
        let mut installed = active_source("installed");
        installed.priority = 1;
        installed.install_attributed = true;
        installed.install_cooldown_window = 100;
        let mut high = active_source("high");
        high.priority = 100;
        store.seed_source(installed);
        store.seed_source(high);

        let engine = engine(store);
        let trigger = pending_trigger("T1", 10_000);
        let mut txn = engine.store().transaction().expect("txn");
        let (winner, _) =
            engine.select_source(txn.as_mut(), &trigger).expect("select").expect("candidates");
        assert_eq!(winner.id, "high");
    }

    #[test]
    fn selection_is_deterministic_across_runs() {
        let store = MemoryStore::new();
        for i in 0..6 {
            let mut s = active_source(&format!("s{i}"));
            s.priority = 3;
            s.event_time = 1_000;
            store.seed_source(s);
        }
        let engine = engine(store);
        let trigger = pending_trigger("T1", 10_000);

        let mut first: Option<String> = None;
        for _ in 0..5 {
            let mut txn = engine.store().transaction().expect("txn");
            let (winner, _) =
                engine.select_source(txn.as_mut(), &trigger).expect("select").expect("candidates");
            match &first {
                None => first = Some(winner.id),
                Some(expected) => assert_eq!(&winner.id, expected),
            }
        }
    }

    #[test]
    fn aggregate_jitter_stays_inside_the_configured_band() {
        let engine = engine(MemoryStore::new());
        for _ in 0..100 {
            let jitter = engine.aggregate_report_jitter();
            assert!(jitter >= AGGREGATE_MIN_REPORT_DELAY_MS);
            assert!(jitter < AGGREGATE_MAX_REPORT_DELAY_MS);
        }
    }

    #[test]
    fn jitter_stream_is_reproducible_for_a_fixed_seed() {
        let a = engine(MemoryStore::new());
        let b = engine(MemoryStore::new());
        let stream_a: Vec<i64> = (0..8).map(|_| a.aggregate_report_jitter()).collect();
        let stream_b: Vec<i64> = (0..8).map(|_| b.aggregate_report_jitter()).collect();
        assert_eq!(stream_a, stream_b);
    }
}
