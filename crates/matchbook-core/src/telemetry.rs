//! Attribution telemetry: per-attempt status records and aggregated
//! counters, kept behind one mutex and exported as a snapshot for the
//! metrics side channel. Nothing here is load-bearing for the
//! attribution decision.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use crate::debug_report::DropReason;
use crate::source::{SourceType, Surface};

const MAX_RETAINED_ATTEMPTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Success,
    Failure,
}

/// Failure classification mirrored by the orchestrator's state
/// machine steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    None,
    TriggerAlreadyHandled,
    NoMatchingSource,
    TopLevelFilterMismatch,
    RateLimitExceeded,
    NoReportsGenerated,
}

/// Publisher-surface × destination-surface combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceCombination {
    AppToApp,
    AppToWeb,
    WebToApp,
    WebToWeb,
}

impl SurfaceCombination {
    pub fn from_surfaces(publisher: Surface, destination: Surface) -> Self {
        match (publisher, destination) {
            (Surface::App, Surface::App) => Self::AppToApp,
            (Surface::App, Surface::Web) => Self::AppToWeb,
            (Surface::Web, Surface::App) => Self::WebToApp,
            (Surface::Web, Surface::Web) => Self::WebToWeb,
        }
    }
}

/// One attribution attempt, as exposed to metrics emission.
#[derive(Debug, Clone, Serialize)]
pub struct AttributionAttempt {
    pub trigger_id: String,
    pub result: AttemptResult,
    pub failure: FailureKind,
    pub source_type: Option<SourceType>,
    pub surfaces: Option<SurfaceCombination>,
    /// Trigger-to-attribution latency; zero for failed attempts.
    pub attribution_delay_ms: i64,
    pub source_derived: bool,
    pub install_attribution: bool,
}

impl AttributionAttempt {
    pub fn failed(trigger_id: impl Into<String>, failure: FailureKind) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            result: AttemptResult::Failure,
            failure,
            source_type: None,
            surfaces: None,
            attribution_delay_ms: 0,
            source_derived: false,
            install_attribution: false,
        }
    }
}

#[derive(Debug, Default)]
struct TelemetryState {
    attempts_total: u64,
    success_total: u64,
    failure_total: BTreeMap<&'static str, u64>,
    drops_total: BTreeMap<&'static str, u64>,
    delayed_source_registrations_total: u64,
    last_delayed_registration_ms: Option<i64>,
    attempts: VecDeque<AttributionAttempt>,
}

#[derive(Debug, Clone, Default)]
pub struct AttributionTelemetry {
    state: std::sync::Arc<Mutex<TelemetryState>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub attempts_total: u64,
    pub success_total: u64,
    pub failure_total: BTreeMap<&'static str, u64>,
    pub drops_total: BTreeMap<&'static str, u64>,
    pub delayed_source_registrations_total: u64,
    pub last_delayed_registration_ms: Option<i64>,
    pub recent_attempts: Vec<AttributionAttempt>,
}

impl AttributionTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self, attempt: AttributionAttempt) {
        let mut state = self.state.lock();
        state.attempts_total += 1;
        match attempt.result {
            AttemptResult::Success => state.success_total += 1,
            AttemptResult::Failure => {
                *state.failure_total.entry(failure_label(attempt.failure)).or_insert(0) += 1;
            }
        }
        if state.attempts.len() == MAX_RETAINED_ATTEMPTS {
            let _ = state.attempts.pop_front();
        }
        state.attempts.push_back(attempt);
    }

    pub fn record_drop(&self, reason: DropReason) {
        *self.state.lock().drops_total.entry(reason.as_str()).or_insert(0) += 1;
    }

    /// A source that would have matched registered only after the
    /// trigger fired; `delay_ms` is how late it was.
    pub fn record_delayed_source_registration(&self, delay_ms: i64) {
        let mut state = self.state.lock();
        state.delayed_source_registrations_total += 1;
        state.last_delayed_registration_ms = Some(delay_ms);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = self.state.lock();
        TelemetrySnapshot {
            attempts_total: state.attempts_total,
            success_total: state.success_total,
            failure_total: state.failure_total.clone(),
            drops_total: state.drops_total.clone(),
            delayed_source_registrations_total: state.delayed_source_registrations_total,
            last_delayed_registration_ms: state.last_delayed_registration_ms,
            recent_attempts: state.attempts.iter().cloned().collect(),
        }
    }
}

fn failure_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::None => "none",
        FailureKind::TriggerAlreadyHandled => "trigger_already_handled",
        FailureKind::NoMatchingSource => "no_matching_source",
        FailureKind::TopLevelFilterMismatch => "top_level_filter_mismatch",
        FailureKind::RateLimitExceeded => "rate_limit_exceeded",
        FailureKind::NoReportsGenerated => "no_reports_generated",
    }
}
