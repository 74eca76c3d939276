// Copyright (c) 2026 Matchbook Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-network attribution (XNA): derived-source generation.
//!
//! A trigger may carry an ordered list of per-network attribution
//! configs. Each config selects parent sources registered by another
//! network and synthesizes non-persisted derived copies that compete
//! in the priority race on the triggering network's behalf. A parent
//! consumed by an earlier config is excluded from later configs.

use std::collections::BTreeSet;

use serde_json::Value;
use thiserror::Error;

use crate::filter::{self, FilterMap, filter_set_from_value};
use crate::source::{Source, SourceStatus};
use crate::trigger::Trigger;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttributionConfigError {
    #[error("attribution config payload is not valid JSON")]
    Json,

    #[error("missing required field {0:?}")]
    MissingField(&'static str),

    #[error("field {0:?} has an invalid value")]
    BadField(&'static str),
}

/// One per-network override rule, in list order.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionConfig {
    pub source_network: String,
    pub source_priority_range: Option<(i64, i64)>,
    pub source_filters: Option<Vec<FilterMap>>,
    pub source_not_filters: Option<Vec<FilterMap>>,
    /// Seconds; bounds how old a parent may be relative to the trigger.
    pub source_expiry_override: Option<i64>,
    pub priority: Option<i64>,
    /// Seconds; caps the derived source's expiry relative to the
    /// parent's event time.
    pub expiry: Option<i64>,
    pub filter_data: Option<FilterMap>,
    pub post_install_exclusivity_window: Option<i64>,
}

pub fn parse_attribution_configs(raw: &str) -> Result<Vec<AttributionConfig>, AttributionConfigError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| AttributionConfigError::Json)?;
    let Value::Array(items) = value else {
        return Err(AttributionConfigError::Json);
    };
    items.iter().map(parse_config).collect()
}

/// The set of source networks named by a trigger's attribution
/// configs; malformed JSON reads as the empty set (fails closed).
pub fn extract_network_ids(raw: &str) -> BTreeSet<String> {
    match parse_attribution_configs(raw) {
        Ok(configs) => configs.into_iter().map(|c| c.source_network).collect(),
        Err(err) => {
            tracing::debug!(error = %err, "failed to parse attribution configs");
            BTreeSet::new()
        }
    }
}

fn parse_config(value: &Value) -> Result<AttributionConfig, AttributionConfigError> {
    let Value::Object(obj) = value else {
        return Err(AttributionConfigError::Json);
    };
    let source_network = match obj.get("source_network") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(AttributionConfigError::MissingField("source_network")),
    };
    let source_priority_range = match obj.get("source_priority_range") {
        None | Some(Value::Null) => None,
        Some(Value::Object(range)) => {
            let start = parse_i64(range.get("start"), "source_priority_range")?
                .ok_or(AttributionConfigError::BadField("source_priority_range"))?;
            let end = parse_i64(range.get("end"), "source_priority_range")?
                .ok_or(AttributionConfigError::BadField("source_priority_range"))?;
            Some((start, end))
        }
        Some(_) => return Err(AttributionConfigError::BadField("source_priority_range")),
    };
    Ok(AttributionConfig {
        source_network,
        source_priority_range,
        source_filters: parse_filters(obj.get("source_filters"), "source_filters")?,
        source_not_filters: parse_filters(obj.get("source_not_filters"), "source_not_filters")?,
        source_expiry_override: parse_i64(obj.get("source_expiry_override"), "source_expiry_override")?,
        priority: parse_i64(obj.get("priority"), "priority")?,
        expiry: parse_i64(obj.get("expiry"), "expiry")?,
        filter_data: match obj.get("filter_data") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                FilterMap::from_json_object(v)
                    .map_err(|_| AttributionConfigError::BadField("filter_data"))?,
            ),
        },
        post_install_exclusivity_window: parse_i64(
            obj.get("post_install_exclusivity_window"),
            "post_install_exclusivity_window",
        )?,
    })
}

fn parse_i64(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<i64>, AttributionConfigError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            n.as_i64().map(Some).ok_or(AttributionConfigError::BadField(field))
        }
        Some(Value::String(s)) => {
            s.parse::<i64>().map(Some).map_err(|_| AttributionConfigError::BadField(field))
        }
        Some(_) => Err(AttributionConfigError::BadField(field)),
    }
}

fn parse_filters(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<Vec<FilterMap>>, AttributionConfigError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(
            filter_set_from_value(v).map_err(|_| AttributionConfigError::BadField(field))?,
        )),
    }
}

/// Generates derived sources for the trigger from other networks'
/// parent sources. Config order is authoritative; first match wins
/// per parent. An unparsable config list yields no derived sources.
pub fn generate_derived_sources(trigger: &Trigger, parent_sources: &[Source]) -> Vec<Source> {
    let Some(raw) = trigger.attribution_config.as_deref() else {
        return Vec::new();
    };
    let configs = match parse_attribution_configs(raw) {
        Ok(configs) => configs,
        Err(err) => {
            tracing::debug!(trigger_id = %trigger.id, error = %err, "attribution configs unparsable; deriving nothing");
            return Vec::new();
        }
    };

    let mut consumed: BTreeSet<&str> = BTreeSet::new();
    let mut derived = Vec::new();
    for config in &configs {
        for parent in parent_sources {
            if parent.network_id != config.source_network || consumed.contains(parent.id.as_str()) {
                continue;
            }
            if !config_selects(config, parent, trigger.trigger_time) {
                continue;
            }
            derived.push(derive_source(parent, config, trigger.trigger_time));
            consumed.insert(parent.id.as_str());
        }
    }
    derived
}

fn config_selects(config: &AttributionConfig, parent: &Source, trigger_time: i64) -> bool {
    if let Some((low, high)) = config.source_priority_range {
        if parent.priority < low || parent.priority > high {
            return false;
        }
    }
    if let Some(override_s) = config.source_expiry_override {
        if trigger_time > parent.event_time.saturating_add(override_s.saturating_mul(1_000)) {
            return false;
        }
    }
    let Ok(parent_filters) = parent.filter_map() else {
        return false;
    };
    if let Some(filters) = &config.source_filters {
        if !filter::is_filter_match(&parent_filters, filters, true) {
            return false;
        }
    }
    if let Some(not_filters) = &config.source_not_filters {
        if !filter::is_filter_match(&parent_filters, not_filters, false) {
            return false;
        }
    }
    true
}

fn derive_source(parent: &Source, config: &AttributionConfig, trigger_time: i64) -> Source {
    let expiry_time = match config.expiry {
        Some(expiry_s) => parent
            .expiry_time
            .min(parent.event_time.saturating_add(expiry_s.saturating_mul(1_000))),
        None => parent.expiry_time,
    };
    let filter_data = match &config.filter_data {
        Some(map) => Some(map.to_json_value().to_string()),
        None => parent.filter_data.clone(),
    };
    Source {
        id: format!("derived:{}", parent.id),
        parent_id: Some(parent.id.clone()),
        status: SourceStatus::Active,
        priority: config.priority.unwrap_or(parent.priority),
        install_cooldown_window: config
            .post_install_exclusivity_window
            .unwrap_or(parent.install_cooldown_window),
        install_attributed: parent.install_time.is_some_and(|t| t < trigger_time),
        expiry_time,
        filter_data,
        aggregation_keys: Some(shared_aggregation_keys_subset(parent)),
        aggregate_contributions: 0,
        event_report_dedup_keys: Vec::new(),
        aggregate_report_dedup_keys: Vec::new(),
        ..parent.clone()
    }
}

/// The parent's aggregation keys narrowed to its shared key ids; a
/// missing or unparsable key map narrows to the empty object.
fn shared_aggregation_keys_subset(parent: &Source) -> String {
    let shared: BTreeSet<String> = parent.shared_aggregation_key_ids().into_iter().collect();
    let keys = parent
        .aggregation_keys
        .as_deref()
        .and_then(|raw| serde_json::from_str::<serde_json::Map<String, Value>>(raw).ok())
        .unwrap_or_default();
    let filtered: serde_json::Map<String, Value> =
        keys.into_iter().filter(|(id, _)| shared.contains(id)).collect();
    Value::Object(filtered).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AttributionMode, SourceType, Surface};
    use crate::trigger::TriggerStatus;

    fn parent(id: &str, network: &str, priority: i64) -> Source {
        Source {
            id: id.into(),
            event_id: 1,
            publisher: "https://publisher.example".into(),
            publisher_surface: Surface::Web,
            app_destination: Some("android-app://com.shop.app".into()),
            web_destination: None,
            network_id: network.into(),
            registrant: "android-app://com.shop.app".into(),
            registration_id: Some(format!("reg-{id}")),
            registration_origin: "https://adtech.example".into(),
            source_type: SourceType::Navigation,
            priority,
            status: SourceStatus::Active,
            event_time: 1_000,
            expiry_time: 1_000_000,
            event_report_window: 900_000,
            aggregatable_report_window: 950_000,
            attribution_mode: AttributionMode::Truthful,
            install_attributed: false,
            install_cooldown_window: 100,
            install_time: None,
            filter_data: None,
            aggregation_keys: Some(r#"{"key1": "0x159", "key2": "0x1", "key3": "0x2"}"#.into()),
            aggregate_contributions: 7,
            event_report_dedup_keys: vec![11],
            aggregate_report_dedup_keys: vec![22],
            shared_aggregation_keys: Some(r#"["key2", "key3"]"#.into()),
            parent_id: None,
        }
    }

    fn trigger_with_configs(configs: &str) -> Trigger {
        Trigger {
            id: "T1".into(),
            attribution_destination: "android-app://com.shop.app".into(),
            destination_surface: Surface::App,
            network_id: "trigger-network".into(),
            registrant: "android-app://com.shop.app".into(),
            registration_origin: "https://trigger-adtech.example".into(),
            trigger_time: 50_000,
            status: TriggerStatus::Pending,
            event_triggers: None,
            filters: None,
            not_filters: None,
            aggregatable_trigger_data: None,
            aggregatable_values: None,
            aggregatable_dedup_keys: None,
            attribution_config: Some(configs.into()),
            debug_key: None,
        }
    }

    #[test]
    fn configs_filter_select_and_override() {
        let configs = r#"[
            {"source_network": "enrollment1",
             "source_priority_range": {"start": 1, "end": 100},
             "priority": 50, "post_install_exclusivity_window": 5},
            {"source_network": "enrollment2",
             "source_priority_range": {"start": 101, "end": 200},
             "source_expiry_override": 60},
            {"source_network": "enrollment1",
             "source_priority_range": {"start": 1, "end": 100},
             "priority": 70}
        ]"#;
        let trigger = trigger_with_configs(configs);

        let in_range = parent("s1", "enrollment1", 1);
        let out_of_range = parent("s3", "enrollment1", 101);
        let second_network = parent("s5", "enrollment2", 120);
        let mut expired = parent("s7", "enrollment2", 120);
        // event_time + 60s override lands before the trigger fires
        expired.event_time = trigger.trigger_time - 60_000 - 50;
        let unconfigured = parent("s8", "enrollmentX", 120);

        let derived = generate_derived_sources(
            &trigger,
            &[in_range.clone(), out_of_range, second_network, expired, unconfigured],
        );

        let parents: Vec<_> = derived.iter().filter_map(|s| s.parent_id.clone()).collect();
        assert_eq!(parents, vec!["s1".to_string(), "s5".to_string()]);

        let d1 = &derived[0];
        assert_eq!(d1.priority, 50, "first config's override applies, not the copy's");
        assert_eq!(d1.install_cooldown_window, 5);
        assert_eq!(d1.status, SourceStatus::Active);
        assert!(d1.is_derived());

        let d5 = &derived[1];
        assert_eq!(d5.priority, 120, "no override keeps the parent priority");
    }

    #[test]
    fn derived_sources_reset_dedup_state_and_narrow_aggregation_keys() {
        let trigger = trigger_with_configs(r#"[{"source_network": "enrollment1"}]"#);
        let derived = generate_derived_sources(&trigger, &[parent("s1", "enrollment1", 1)]);
        assert_eq!(derived.len(), 1);
        let d = &derived[0];
        assert!(d.event_report_dedup_keys.is_empty());
        assert!(d.aggregate_report_dedup_keys.is_empty());
        assert_eq!(d.aggregate_contributions, 0);
        let keys: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(d.aggregation_keys.as_deref().expect("keys")).expect("json");
        assert_eq!(keys.len(), 2);
        assert!(keys.contains_key("key2") && keys.contains_key("key3"));
    }

    #[test]
    fn derived_expiry_is_capped_by_config_expiry() {
        let trigger = trigger_with_configs(r#"[{"source_network": "enrollment1", "expiry": 30}]"#);
        let derived = generate_derived_sources(&trigger, &[parent("s1", "enrollment1", 1)]);
        assert_eq!(derived[0].expiry_time, 1_000 + 30_000);
    }

    #[test]
    fn config_filters_apply_to_parent_filter_data() {
        let configs = r#"[{"source_network": "enrollment1",
                           "source_filters": [{"product": ["1234"]}]}]"#;
        let trigger = trigger_with_configs(configs);
        let mut matching = parent("s1", "enrollment1", 1);
        matching.filter_data = Some(r#"{"product": ["1234", "234"]}"#.into());
        let mut mismatching = parent("s2", "enrollment1", 1);
        mismatching.filter_data = Some(r#"{"product": ["999"]}"#.into());

        let derived = generate_derived_sources(&trigger, &[matching, mismatching]);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].parent_id.as_deref(), Some("s1"));
    }

    #[test]
    fn malformed_config_list_derives_nothing() {
        let trigger = trigger_with_configs("{not an array");
        assert!(generate_derived_sources(&trigger, &[parent("s1", "enrollment1", 1)]).is_empty());
        assert!(extract_network_ids("{not an array").is_empty());
    }

    #[test]
    fn install_attribution_is_recomputed_from_parent_install_time() {
        let trigger = trigger_with_configs(r#"[{"source_network": "enrollment1"}]"#);
        let mut installed = parent("s1", "enrollment1", 1);
        installed.install_time = Some(trigger.trigger_time - 1);
        let mut not_yet = parent("s2", "enrollment1", 1);
        not_yet.install_time = Some(trigger.trigger_time + 1);

        let derived = generate_derived_sources(&trigger, &[installed, not_yet]);
        assert!(derived[0].install_attributed);
        assert!(!derived[1].install_attributed);
    }
}
