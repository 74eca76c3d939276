//! Abstract transactional datastore boundary.
//!
//! The engine performs every per-trigger read-modify-write inside one
//! [`StoreTransaction`]; dropping a transaction without committing
//! discards every staged effect. [`MemoryStore`] is the reference
//! implementation: transactions hold the store lock for their whole
//! lifetime (serializable isolation) and swap the staged state in on
//! commit only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::params::DELAYED_SOURCE_REGISTRATION_WINDOW_MS;
use crate::report::{AggregateReport, AttributionLedgerRow, EventReport};
use crate::site;
use crate::source::{Source, SourceStatus, Surface};
use crate::trigger::{Trigger, TriggerStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore failure: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub trait TransactionalStore {
    fn transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;
}

/// One atomic unit of datastore work. Every operation the engine
/// needs during a single trigger's attribution is invocable here.
pub trait StoreTransaction {
    fn pending_trigger_ids(&mut self) -> Result<Vec<String>, StoreError>;
    fn trigger_by_id(&mut self, trigger_id: &str) -> Result<Trigger, StoreError>;

    /// Active sources of the trigger's own network, time-window
    /// eligible for its destination.
    fn matching_active_sources(&mut self, trigger: &Trigger) -> Result<Vec<Source>, StoreError>;

    /// Candidate pool for cross-network attribution: the trigger
    /// network's own sources plus other networks' sources that are
    /// XNA-eligible (shared aggregation keys registered, never lost
    /// XNA attribution before, and no source of the trigger's network
    /// on the same registration chain).
    fn xna_matching_sources(
        &mut self,
        trigger: &Trigger,
        network_ids: &BTreeSet<String>,
    ) -> Result<Vec<Source>, StoreError>;

    /// The earliest-registered source that would have matched the
    /// trigger but was registered after it fired. Observational only.
    fn nearest_delayed_matching_source(
        &mut self,
        trigger: &Trigger,
    ) -> Result<Option<Source>, StoreError>;

    fn count_event_reports_for_destination(
        &mut self,
        destination: &str,
        surface: Surface,
    ) -> Result<u64, StoreError>;
    fn count_aggregate_reports_for_destination(
        &mut self,
        destination: &str,
        surface: Surface,
    ) -> Result<u64, StoreError>;

    fn count_ledger_rows_in_window(
        &mut self,
        source_site: &str,
        destination_site: &str,
        network_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<u64, StoreError>;
    fn count_distinct_networks_in_window(
        &mut self,
        source_site: &str,
        destination_site: &str,
        excluded_network_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<u64, StoreError>;

    fn source_event_reports(&mut self, source_id: &str) -> Result<Vec<EventReport>, StoreError>;

    fn update_trigger_status(
        &mut self,
        trigger_ids: &[String],
        status: TriggerStatus,
    ) -> Result<(), StoreError>;
    fn update_source_status(
        &mut self,
        source_ids: &[String],
        status: SourceStatus,
    ) -> Result<(), StoreError>;

    /// Records that a derived source's parent lost the priority race
    /// for this network (lose once, lose always).
    fn record_xna_ignored_source(
        &mut self,
        parent_source_id: &str,
        network_id: &str,
    ) -> Result<(), StoreError>;

    fn update_source_event_dedup_keys(&mut self, source: &Source) -> Result<(), StoreError>;
    fn update_source_aggregate_dedup_keys(&mut self, source: &Source) -> Result<(), StoreError>;
    fn update_source_aggregate_contributions(&mut self, source: &Source)
    -> Result<(), StoreError>;

    fn insert_event_report(&mut self, report: &EventReport) -> Result<(), StoreError>;
    fn delete_event_report(&mut self, report_id: &str) -> Result<(), StoreError>;
    fn insert_aggregate_report(&mut self, report: &AggregateReport) -> Result<(), StoreError>;
    fn insert_ledger_row(&mut self, row: &AttributionLedgerRow) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub sources: BTreeMap<String, Source>,
    pub triggers: BTreeMap<String, Trigger>,
    pub event_reports: BTreeMap<String, EventReport>,
    pub aggregate_reports: BTreeMap<String, AggregateReport>,
    pub attribution_ledger: Vec<AttributionLedgerRow>,
    /// (parent source id, network id) pairs that lost XNA attribution.
    pub xna_ignored_sources: BTreeSet<(String, String)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    transactions_started: AtomicUsize,
    fail_at: Mutex<BTreeSet<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_source(&self, source: Source) {
        self.state.lock().sources.insert(source.id.clone(), source);
    }

    pub fn seed_trigger(&self, trigger: Trigger) {
        self.state.lock().triggers.insert(trigger.id.clone(), trigger);
    }

    /// Copy of the committed state, for assertions.
    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().clone()
    }

    /// Makes the n-th transaction from now (0-based) fail to open,
    /// for hard-failure tests.
    pub fn fail_on_transaction(&self, nth_from_now: usize) {
        let base = self.transactions_started.load(Ordering::SeqCst);
        self.fail_at.lock().insert(base + nth_from_now);
    }
}

impl TransactionalStore for MemoryStore {
    fn transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let serial = self.transactions_started.fetch_add(1, Ordering::SeqCst);
        if self.fail_at.lock().remove(&serial) {
            return Err(StoreError::Backend("injected transaction failure".into()));
        }
        let committed = self.state.lock();
        let staged = committed.clone();
        Ok(Box::new(MemoryTransaction { committed, staged }))
    }
}

struct MemoryTransaction<'a> {
    committed: MutexGuard<'a, MemoryState>,
    staged: MemoryState,
}

/// Destination equality modulo path/query: stored values may carry
/// either the full origin or the base form.
fn same_destination(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (site::base_origin(a), site::base_origin(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn source_matches_destination(source: &Source, trigger: &Trigger) -> bool {
    source
        .destination(trigger.destination_surface)
        .is_some_and(|d| same_destination(d, &trigger.attribution_destination))
}

fn time_window_eligible(source: &Source, trigger_time: i64) -> bool {
    source.event_time <= trigger_time && source.expiry_time > trigger_time
}

impl MemoryTransaction<'_> {
    fn source_mut(&mut self, source: &Source) -> Result<&mut Source, StoreError> {
        let Some(id) = source.persisted_id() else {
            return Err(StoreError::Backend("derived sources are never persisted".into()));
        };
        self.staged
            .sources
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("source {id}")))
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn pending_trigger_ids(&mut self) -> Result<Vec<String>, StoreError> {
        let mut pending: Vec<&Trigger> = self
            .staged
            .triggers
            .values()
            .filter(|t| t.status == TriggerStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.trigger_time.cmp(&b.trigger_time).then(a.id.cmp(&b.id)));
        Ok(pending.into_iter().map(|t| t.id.clone()).collect())
    }

    fn trigger_by_id(&mut self, trigger_id: &str) -> Result<Trigger, StoreError> {
        self.staged
            .triggers
            .get(trigger_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("trigger {trigger_id}")))
    }

    fn matching_active_sources(&mut self, trigger: &Trigger) -> Result<Vec<Source>, StoreError> {
        Ok(self
            .staged
            .sources
            .values()
            .filter(|s| {
                s.status == SourceStatus::Active
                    && s.registration_origin == trigger.registration_origin
                    && time_window_eligible(s, trigger.trigger_time)
                    && source_matches_destination(s, trigger)
            })
            .cloned()
            .collect())
    }

    fn xna_matching_sources(
        &mut self,
        trigger: &Trigger,
        network_ids: &BTreeSet<String>,
    ) -> Result<Vec<Source>, StoreError> {
        let trigger_network_registration_ids: BTreeSet<&str> = self
            .staged
            .sources
            .values()
            .filter(|s| s.network_id == trigger.network_id)
            .filter_map(|s| s.registration_id.as_deref())
            .collect();

        Ok(self
            .staged
            .sources
            .values()
            .filter(|s| {
                if s.status != SourceStatus::Active
                    || !time_window_eligible(s, trigger.trigger_time)
                    || !source_matches_destination(s, trigger)
                {
                    return false;
                }
                if s.network_id == trigger.network_id {
                    return true;
                }
                if !network_ids.contains(&s.network_id) || s.shared_aggregation_keys.is_none() {
                    return false;
                }
                let lost_before = self.staged.xna_ignored_sources.iter().any(|(id, network)| {
                    id == &s.id && (network == &trigger.network_id || network_ids.contains(network))
                });
                if lost_before {
                    return false;
                }
                // Registration chains the trigger's network took part
                // in are off limits for delegation.
                !s.registration_id
                    .as_deref()
                    .is_some_and(|r| trigger_network_registration_ids.contains(r))
            })
            .cloned()
            .collect())
    }

    fn nearest_delayed_matching_source(
        &mut self,
        trigger: &Trigger,
    ) -> Result<Option<Source>, StoreError> {
        let horizon = trigger
            .trigger_time
            .saturating_add(DELAYED_SOURCE_REGISTRATION_WINDOW_MS);
        Ok(self
            .staged
            .sources
            .values()
            .filter(|s| {
                s.status == SourceStatus::Active
                    && s.registration_origin == trigger.registration_origin
                    && s.event_time > trigger.trigger_time
                    && s.event_time <= horizon
                    && s.expiry_time > trigger.trigger_time
                    && source_matches_destination(s, trigger)
            })
            .min_by_key(|s| s.event_time)
            .cloned())
    }

    fn count_event_reports_for_destination(
        &mut self,
        destination: &str,
        _surface: Surface,
    ) -> Result<u64, StoreError> {
        Ok(self
            .staged
            .event_reports
            .values()
            .filter(|r| {
                r.attribution_destinations.iter().any(|d| same_destination(d, destination))
            })
            .count() as u64)
    }

    fn count_aggregate_reports_for_destination(
        &mut self,
        destination: &str,
        _surface: Surface,
    ) -> Result<u64, StoreError> {
        Ok(self
            .staged
            .aggregate_reports
            .values()
            .filter(|r| same_destination(&r.attribution_destination, destination))
            .count() as u64)
    }

    fn count_ledger_rows_in_window(
        &mut self,
        source_site: &str,
        destination_site: &str,
        network_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<u64, StoreError> {
        Ok(self
            .staged
            .attribution_ledger
            .iter()
            .filter(|row| {
                row.source_site == source_site
                    && row.destination_site == destination_site
                    && row.network_id == network_id
                    && row.source_time > window_start
                    && row.source_time <= window_end
            })
            .count() as u64)
    }

    fn count_distinct_networks_in_window(
        &mut self,
        source_site: &str,
        destination_site: &str,
        excluded_network_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<u64, StoreError> {
        let networks: BTreeSet<&str> = self
            .staged
            .attribution_ledger
            .iter()
            .filter(|row| {
                row.source_site == source_site
                    && row.destination_site == destination_site
                    && row.network_id != excluded_network_id
                    && row.source_time > window_start
                    && row.source_time <= window_end
            })
            .map(|row| row.network_id.as_str())
            .collect();
        Ok(networks.len() as u64)
    }

    fn source_event_reports(&mut self, source_id: &str) -> Result<Vec<EventReport>, StoreError> {
        Ok(self
            .staged
            .event_reports
            .values()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect())
    }

    fn update_trigger_status(
        &mut self,
        trigger_ids: &[String],
        status: TriggerStatus,
    ) -> Result<(), StoreError> {
        for id in trigger_ids {
            if let Some(trigger) = self.staged.triggers.get_mut(id) {
                trigger.status = status;
            }
        }
        Ok(())
    }

    fn update_source_status(
        &mut self,
        source_ids: &[String],
        status: SourceStatus,
    ) -> Result<(), StoreError> {
        for id in source_ids {
            if let Some(source) = self.staged.sources.get_mut(id) {
                source.status = status;
            }
        }
        Ok(())
    }

    fn record_xna_ignored_source(
        &mut self,
        parent_source_id: &str,
        network_id: &str,
    ) -> Result<(), StoreError> {
        self.staged
            .xna_ignored_sources
            .insert((parent_source_id.to_string(), network_id.to_string()));
        Ok(())
    }

    fn update_source_event_dedup_keys(&mut self, source: &Source) -> Result<(), StoreError> {
        let keys = source.event_report_dedup_keys.clone();
        self.source_mut(source)?.event_report_dedup_keys = keys;
        Ok(())
    }

    fn update_source_aggregate_dedup_keys(&mut self, source: &Source) -> Result<(), StoreError> {
        let keys = source.aggregate_report_dedup_keys.clone();
        self.source_mut(source)?.aggregate_report_dedup_keys = keys;
        Ok(())
    }

    fn update_source_aggregate_contributions(
        &mut self,
        source: &Source,
    ) -> Result<(), StoreError> {
        let contributions = source.aggregate_contributions;
        self.source_mut(source)?.aggregate_contributions = contributions;
        Ok(())
    }

    fn insert_event_report(&mut self, report: &EventReport) -> Result<(), StoreError> {
        if self.staged.event_reports.contains_key(&report.id) {
            return Err(StoreError::Backend(format!("duplicate event report {}", report.id)));
        }
        self.staged.event_reports.insert(report.id.clone(), report.clone());
        Ok(())
    }

    fn delete_event_report(&mut self, report_id: &str) -> Result<(), StoreError> {
        self.staged
            .event_reports
            .remove(report_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("event report {report_id}")))
    }

    fn insert_aggregate_report(&mut self, report: &AggregateReport) -> Result<(), StoreError> {
        if self.staged.aggregate_reports.contains_key(&report.id) {
            return Err(StoreError::Backend(format!("duplicate aggregate report {}", report.id)));
        }
        self.staged.aggregate_reports.insert(report.id.clone(), report.clone());
        Ok(())
    }

    fn insert_ledger_row(&mut self, row: &AttributionLedgerRow) -> Result<(), StoreError> {
        self.staged.attribution_ledger.push(row.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut committed, staged } = *self;
        *committed = staged;
        Ok(())
    }
}
