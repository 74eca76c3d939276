// Copyright (c) 2026 Matchbook Contributors
// SPDX-License-Identifier: Apache-2.0

//! Output records: event-level reports, aggregate reports and the
//! append-only attribution ledger row, plus the event report-window
//! policy. Report ids are deterministic digests so that replaying a
//! transaction cannot mint a second id for the same attribution.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aggregate::HistogramContribution;
use crate::error::MatchbookError;
use crate::params::{
    EVENT_TRIGGER_DATA_CARDINALITY, NAVIGATION_EARLY_DEADLINES_MS,
    NAVIGATION_TRIGGER_DATA_CARDINALITY, ONE_DAY_MS, ONE_HOUR_MS,
};
use crate::site;
use crate::source::{Source, SourceType, Surface};
use crate::trigger::{EventTrigger, Trigger};

pub const AGGREGATE_API_VERSION: &str = "0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    Delivered,
    MarkedToDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub id: String,
    pub source_id: String,
    pub trigger_id: String,
    pub source_event_id: u64,
    /// Truncated modulo the source type's trigger-data cardinality.
    pub trigger_data: u64,
    pub trigger_priority: i64,
    pub trigger_dedup_key: Option<u64>,
    pub trigger_time: i64,
    pub report_time: i64,
    pub attribution_destinations: Vec<String>,
    pub network_id: String,
    pub source_type: SourceType,
    pub status: ReportStatus,
    pub trigger_debug_key: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub id: String,
    /// Absent for reports attributed through a derived source.
    pub source_id: Option<String>,
    pub trigger_id: String,
    pub publisher: String,
    pub attribution_destination: String,
    /// Source event time rounded down to the day.
    pub source_registration_time: i64,
    pub scheduled_report_time: i64,
    pub network_id: String,
    pub contributions: Vec<HistogramContribution>,
    pub status: ReportStatus,
    pub api_version: String,
    pub dedup_key: Option<u64>,
    pub trigger_debug_key: Option<u64>,
}

/// Rate-limit ledger row, recorded once per successful attribution.
/// Append-only; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionLedgerRow {
    pub id: String,
    pub source_site: String,
    pub source_origin: String,
    pub destination_site: String,
    pub destination_origin: String,
    pub network_id: String,
    /// Event time of the attributed source; rate-limit windows are
    /// evaluated against this column.
    pub source_time: i64,
    pub registrant: String,
    pub source_id: Option<String>,
    pub trigger_id: String,
}

impl EventReport {
    pub fn for_attribution(
        source: &Source,
        trigger: &Trigger,
        event_trigger: &EventTrigger,
        report_time: i64,
    ) -> Self {
        let cardinality = match source.source_type {
            SourceType::Event => EVENT_TRIGGER_DATA_CARDINALITY,
            SourceType::Navigation => NAVIGATION_TRIGGER_DATA_CARDINALITY,
        };
        let destinations = source
            .destination(trigger.destination_surface)
            .map(|d| vec![d.to_string()])
            .unwrap_or_default();
        Self {
            id: synthetic_report_id("event-report", Some(&source.id), &trigger.id),
            source_id: source.id.clone(),
            trigger_id: trigger.id.clone(),
            source_event_id: source.event_id,
            trigger_data: event_trigger.trigger_data % cardinality,
            trigger_priority: event_trigger.priority,
            trigger_dedup_key: event_trigger.dedup_key,
            trigger_time: trigger.trigger_time,
            report_time,
            attribution_destinations: destinations,
            network_id: trigger.network_id.clone(),
            source_type: source.source_type,
            status: ReportStatus::Pending,
            trigger_debug_key: trigger.debug_key,
        }
    }
}

impl AggregateReport {
    pub fn for_attribution(
        source: &Source,
        trigger: &Trigger,
        contributions: Vec<HistogramContribution>,
        dedup_key: Option<u64>,
        scheduled_report_time: i64,
    ) -> Self {
        Self {
            id: synthetic_report_id("aggregate-report", source.persisted_id(), &trigger.id),
            source_id: source.persisted_id().map(str::to_string),
            trigger_id: trigger.id.clone(),
            publisher: source.publisher.clone(),
            attribution_destination: trigger.attribution_destination.clone(),
            source_registration_time: round_down_to_day(source.event_time),
            scheduled_report_time,
            network_id: trigger.network_id.clone(),
            contributions,
            status: ReportStatus::Pending,
            api_version: AGGREGATE_API_VERSION.to_string(),
            dedup_key,
            trigger_debug_key: trigger.debug_key,
        }
    }
}

impl AttributionLedgerRow {
    pub fn for_attribution(source: &Source, trigger: &Trigger) -> Result<Self, MatchbookError> {
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
        let destination_origin = site::base_origin(&trigger.attribution_destination)
            .ok_or_else(|| MatchbookError::MalformedOrigin {
                role: "destination",
                uri: trigger.attribution_destination.clone(),
            })?;
        Ok(Self {
            id: synthetic_report_id("attribution", source.persisted_id(), &trigger.id),
            source_site,
            source_origin: source.publisher.clone(),
            destination_site,
            destination_origin,
            network_id: trigger.network_id.clone(),
            source_time: source.event_time,
            registrant: trigger.registrant.clone(),
            source_id: source.persisted_id().map(str::to_string),
            trigger_id: trigger.id.clone(),
        })
    }
}

/// Event reports are delivered at the end of a reporting window, with
/// an hour of delivery slack. Navigation sources get two early
/// deadlines before the window end; event sources only the window
/// end. Callers have already rejected triggers past the window.
pub fn event_report_time(source: &Source, trigger_time: i64) -> i64 {
    if source.source_type == SourceType::Navigation {
        for offset in NAVIGATION_EARLY_DEADLINES_MS {
            let deadline = source.event_time.saturating_add(offset);
            if deadline < source.event_report_window && trigger_time <= deadline {
                return deadline + ONE_HOUR_MS;
            }
        }
    }
    source.event_report_window + ONE_HOUR_MS
}

/// Per-source event-report quota: one report for event-type sources
/// (two once install-attributed on the app surface), three for
/// navigation-type sources.
pub fn max_event_reports(source: &Source, destination_surface: Surface) -> usize {
    let install_case = destination_surface == Surface::App && source.install_attributed;
    match source.source_type {
        SourceType::Event if install_case => 2,
        SourceType::Event => 1,
        SourceType::Navigation => 3,
    }
}

pub fn round_down_to_day(timestamp: i64) -> i64 {
    timestamp.div_euclid(ONE_DAY_MS) * ONE_DAY_MS
}

fn synthetic_report_id(kind: &str, source_id: Option<&str>, trigger_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"matchbook:report-id:v1");
    hasher.update([0u8]);
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_id.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(trigger_id.as_bytes());
    hex::encode(hasher.finalize())
}
