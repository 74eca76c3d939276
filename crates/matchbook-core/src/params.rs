//! Privacy parameters and engine configuration.
//!
//! The privacy constants are fixed protocol values; the operational
//! ceilings live in [`EngineConfig`] with environment overrides.

pub const ONE_HOUR_MS: i64 = 60 * 60 * 1_000;
pub const ONE_DAY_MS: i64 = 24 * ONE_HOUR_MS;

/// Sliding window for cross-network attribution rate limits.
pub const RATE_LIMIT_WINDOW_MS: i64 = 30 * ONE_DAY_MS;

/// Hard ceiling on the per-source sum of aggregate histogram values.
pub const MAX_SUM_OF_AGGREGATE_VALUES_PER_SOURCE: u32 = 65_536;

/// Aggregate report delivery jitter, added to the trigger time.
pub const AGGREGATE_MIN_REPORT_DELAY_MS: i64 = 0;
pub const AGGREGATE_MAX_REPORT_DELAY_MS: i64 = 10 * 60 * 1_000;

/// Early event-report deadlines for navigation sources, relative to
/// the source event time. Event-type sources report only at the end
/// of their report window.
pub const NAVIGATION_EARLY_DEADLINES_MS: [i64; 2] = [2 * ONE_DAY_MS, 7 * ONE_DAY_MS];

/// Trigger-data cardinality per source type; event-level trigger data
/// is truncated modulo this value.
pub const EVENT_TRIGGER_DATA_CARDINALITY: u64 = 2;
pub const NAVIGATION_TRIGGER_DATA_CARDINALITY: u64 = 8;

/// How far past the trigger a just-missed source registration is
/// still reported to telemetry as "delayed".
pub const DELAYED_SOURCE_REGISTRATION_WINDOW_MS: i64 = 2 * 60 * 1_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Batch ceiling per `perform_pending_attributions` invocation.
    pub max_attributions_per_invocation: usize,
    /// Ledger rows allowed per (source site, destination site,
    /// network) inside the rate-limit window.
    pub max_attributions_per_rate_limit_window: u64,
    /// Distinct other networks allowed per (source site, destination
    /// site) inside the rate-limit window.
    pub max_distinct_networks_in_attribution: u64,
    pub max_event_reports_per_destination: u64,
    pub max_aggregate_reports_per_destination: u64,
    pub enable_xna: bool,
    /// Seed for the report-time jitter stream; `None` seeds from OS
    /// entropy at engine construction.
    pub jitter_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attributions_per_invocation: 100,
            max_attributions_per_rate_limit_window: 100,
            max_distinct_networks_in_attribution: 10,
            max_event_reports_per_destination: 1_024,
            max_aggregate_reports_per_destination: 1_024,
            enable_xna: true,
            jitter_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.max_attributions_per_invocation = read_env_usize(
            "MATCHBOOK_MAX_ATTRIBUTIONS_PER_INVOCATION",
            cfg.max_attributions_per_invocation,
        );
        cfg.max_attributions_per_rate_limit_window = read_env_u64(
            "MATCHBOOK_MAX_ATTRIBUTIONS_PER_RATE_LIMIT_WINDOW",
            cfg.max_attributions_per_rate_limit_window,
        );
        cfg.max_distinct_networks_in_attribution = read_env_u64(
            "MATCHBOOK_MAX_DISTINCT_NETWORKS_IN_ATTRIBUTION",
            cfg.max_distinct_networks_in_attribution,
        );
        cfg.max_event_reports_per_destination = read_env_u64(
            "MATCHBOOK_MAX_EVENT_REPORTS_PER_DESTINATION",
            cfg.max_event_reports_per_destination,
        );
        cfg.max_aggregate_reports_per_destination = read_env_u64(
            "MATCHBOOK_MAX_AGGREGATE_REPORTS_PER_DESTINATION",
            cfg.max_aggregate_reports_per_destination,
        );
        cfg.enable_xna = std::env::var("MATCHBOOK_ENABLE_XNA")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(cfg.enable_xna);
        cfg
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_positive_and_ordered() {
        let cfg = EngineConfig::default();
        assert!(cfg.max_attributions_per_invocation > 0);
        assert!(cfg.max_attributions_per_rate_limit_window > 0);
        assert!(AGGREGATE_MIN_REPORT_DELAY_MS < AGGREGATE_MAX_REPORT_DELAY_MS);
        assert!(NAVIGATION_EARLY_DEADLINES_MS[0] < NAVIGATION_EARLY_DEADLINES_MS[1]);
    }
}
