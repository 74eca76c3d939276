//! Fire-and-forget debug-report scheduling.
//!
//! Every soft drop surfaces a typed reason to the sink; sink failures
//! are the sink's problem and must never fail the attribution
//! transaction.

use serde::Serialize;

use crate::source::Source;
use crate::trigger::Trigger;

/// Why a trigger, or one of its report paths, was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    TriggerNoMatchingSource,
    TriggerNoMatchingFilterData,
    TriggerAttributionsPerSourceDestinationLimit,
    TriggerReportingOriginLimit,
    TriggerEventNoise,
    TriggerEventReportWindowPassed,
    TriggerEventNoMatchingConfigurations,
    TriggerEventDeduplicated,
    TriggerEventStorageLimit,
    TriggerEventLowPriority,
    TriggerEventExcessiveReports,
    TriggerAggregateReportWindowPassed,
    TriggerAggregateStorageLimit,
    TriggerAggregateDeduplicated,
    TriggerAggregateNoContributions,
    TriggerAggregateInsufficientBudget,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TriggerNoMatchingSource => "trigger-no-matching-source",
            Self::TriggerNoMatchingFilterData => "trigger-no-matching-filter-data",
            Self::TriggerAttributionsPerSourceDestinationLimit => {
                "trigger-attributions-per-source-destination-limit"
            }
            Self::TriggerReportingOriginLimit => "trigger-reporting-origin-limit",
            Self::TriggerEventNoise => "trigger-event-noise",
            Self::TriggerEventReportWindowPassed => "trigger-event-report-window-passed",
            Self::TriggerEventNoMatchingConfigurations => {
                "trigger-event-no-matching-configurations"
            }
            Self::TriggerEventDeduplicated => "trigger-event-deduplicated",
            Self::TriggerEventStorageLimit => "trigger-event-storage-limit",
            Self::TriggerEventLowPriority => "trigger-event-low-priority",
            Self::TriggerEventExcessiveReports => "trigger-event-excessive-reports",
            Self::TriggerAggregateReportWindowPassed => "trigger-aggregate-report-window-passed",
            Self::TriggerAggregateStorageLimit => "trigger-aggregate-storage-limit",
            Self::TriggerAggregateDeduplicated => "trigger-aggregate-deduplicated",
            Self::TriggerAggregateNoContributions => "trigger-aggregate-no-contributions",
            Self::TriggerAggregateInsufficientBudget => "trigger-aggregate-insufficient-budget",
        }
    }
}

pub trait DebugReportSink: Send + Sync {
    /// `limit` carries the exceeded ceiling where one applies.
    fn schedule(
        &self,
        reason: DropReason,
        source: Option<&Source>,
        trigger: &Trigger,
        limit: Option<u64>,
    );
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDebugReportSink;

impl DebugReportSink for NoopDebugReportSink {
    fn schedule(
        &self,
        _reason: DropReason,
        _source: Option<&Source>,
        _trigger: &Trigger,
        _limit: Option<u64>,
    ) {
    }
}

/// Buffers scheduled reports; handy for tests and offline inspection.
#[derive(Debug, Default)]
pub struct RecordingDebugReportSink {
    scheduled: parking_lot::Mutex<Vec<ScheduledDebugReport>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDebugReport {
    pub reason: DropReason,
    pub source_id: Option<String>,
    pub trigger_id: String,
    pub limit: Option<u64>,
}

impl RecordingDebugReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<ScheduledDebugReport> {
        std::mem::take(&mut *self.scheduled.lock())
    }
}

impl DebugReportSink for RecordingDebugReportSink {
    fn schedule(
        &self,
        reason: DropReason,
        source: Option<&Source>,
        trigger: &Trigger,
        limit: Option<u64>,
    ) {
        self.scheduled.lock().push(ScheduledDebugReport {
            reason,
            source_id: source.map(|s| s.id.clone()),
            trigger_id: trigger.id.clone(),
            limit,
        });
    }
}
