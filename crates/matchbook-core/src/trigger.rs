// Copyright (c) 2026 Matchbook Contributors
// SPDX-License-Identifier: Apache-2.0

//! The trigger record: a conversion event seeking attribution. The
//! wire-shaped JSON payloads (event triggers, aggregatable trigger
//! data, dedup rules) are stored raw and parsed on demand; malformed
//! payloads surface as typed errors that every call site maps to the
//! fails-closed outcome.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::aggregate::{
    AggregatableTrigger, AggregateDedupRule, AggregateTriggerData, parse_key_piece,
};
use crate::filter::{FilterError, FilterMap, filter_set_from_value};
use crate::source::Surface;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStatus {
    Pending,
    Ignored,
    Attributed,
    MarkedToDelete,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerParseError {
    #[error("trigger payload is not valid JSON")]
    Json,

    #[error("missing required field {0:?}")]
    MissingField(&'static str),

    #[error("field {0:?} has an invalid value")]
    BadField(&'static str),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub attribution_destination: String,
    pub destination_surface: Surface,
    /// Enrolled ad-tech network the trigger belongs to.
    pub network_id: String,
    pub registrant: String,
    pub registration_origin: String,
    pub trigger_time: i64,
    pub status: TriggerStatus,
    /// JSON array of event-trigger objects.
    pub event_triggers: Option<String>,
    /// JSON array of filter maps (top level).
    pub filters: Option<String>,
    pub not_filters: Option<String>,
    /// JSON array of key-piece extension objects.
    pub aggregatable_trigger_data: Option<String>,
    /// JSON object key id → value.
    pub aggregatable_values: Option<String>,
    /// JSON array of dedup rules.
    pub aggregatable_dedup_keys: Option<String>,
    /// JSON array of cross-network attribution configs.
    pub attribution_config: Option<String>,
    pub debug_key: Option<u64>,
}

/// One parsed event-trigger sub-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTrigger {
    pub trigger_data: u64,
    pub priority: i64,
    pub dedup_key: Option<u64>,
    pub filters: Vec<FilterMap>,
    pub not_filters: Vec<FilterMap>,
}

impl Trigger {
    /// Parses the event-trigger list; an absent payload reads as an
    /// empty list.
    pub fn parse_event_triggers(&self) -> Result<Vec<EventTrigger>, TriggerParseError> {
        let Some(raw) = self.event_triggers.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(Vec::new());
        };
        let value: Value = serde_json::from_str(raw).map_err(|_| TriggerParseError::Json)?;
        let Value::Array(items) = value else {
            return Err(TriggerParseError::BadField("event_trigger_data"));
        };
        items.iter().map(parse_event_trigger).collect()
    }

    /// Parses the aggregatable half of the trigger. `None` when no
    /// aggregatable values were registered.
    pub fn aggregatable_trigger(&self) -> Result<Option<AggregatableTrigger>, TriggerParseError> {
        let Some(values_raw) = self.aggregatable_values.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        let values = parse_aggregatable_values(values_raw)?;
        let trigger_data = match self.aggregatable_trigger_data.as_deref().filter(|s| !s.is_empty())
        {
            None => Vec::new(),
            Some(raw) => parse_aggregatable_trigger_data(raw)?,
        };
        let dedup_rules = match self.aggregatable_dedup_keys.as_deref().filter(|s| !s.is_empty()) {
            None => Vec::new(),
            Some(raw) => parse_dedup_rules(raw)?,
        };

        Ok(Some(AggregatableTrigger { trigger_data, values, dedup_rules }))
    }

    /// Top-level positive filter set; absent reads as unrestricted.
    pub fn top_level_filters(&self) -> Result<Vec<FilterMap>, FilterError> {
        crate::filter::parse_filter_set(self.filters.as_deref())
    }

    pub fn top_level_not_filters(&self) -> Result<Vec<FilterMap>, FilterError> {
        crate::filter::parse_filter_set(self.not_filters.as_deref())
    }
}

fn parse_event_trigger(value: &Value) -> Result<EventTrigger, TriggerParseError> {
    let Value::Object(obj) = value else {
        return Err(TriggerParseError::BadField("event_trigger_data"));
    };
    let trigger_data = match obj.get("trigger_data") {
        Some(Value::String(s)) => {
            s.parse::<u64>().map_err(|_| TriggerParseError::BadField("trigger_data"))?
        }
        Some(_) => return Err(TriggerParseError::BadField("trigger_data")),
        None => return Err(TriggerParseError::MissingField("trigger_data")),
    };
    let priority = match obj.get("priority") {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => {
            n.as_i64().ok_or(TriggerParseError::BadField("priority"))?
        }
        Some(Value::String(s)) => {
            s.parse::<i64>().map_err(|_| TriggerParseError::BadField("priority"))?
        }
        Some(_) => return Err(TriggerParseError::BadField("priority")),
    };
    let dedup_key = parse_optional_u64(obj.get("deduplication_key"), "deduplication_key")?;
    let filters = parse_optional_filter_set(obj.get("filters"))?;
    let not_filters = parse_optional_filter_set(obj.get("not_filters"))?;
    Ok(EventTrigger { trigger_data, priority, dedup_key, filters, not_filters })
}

fn parse_aggregatable_trigger_data(
    raw: &str,
) -> Result<Vec<AggregateTriggerData>, TriggerParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| TriggerParseError::Json)?;
    let Value::Array(items) = value else {
        return Err(TriggerParseError::BadField("aggregatable_trigger_data"));
    };
    items
        .iter()
        .map(|item| {
            let Value::Object(obj) = item else {
                return Err(TriggerParseError::BadField("aggregatable_trigger_data"));
            };
            let key_piece = match obj.get("key_piece") {
                Some(Value::String(s)) => {
                    parse_key_piece(s).ok_or(TriggerParseError::BadField("key_piece"))?
                }
                _ => return Err(TriggerParseError::MissingField("key_piece")),
            };
            let source_keys = match obj.get("source_keys") {
                Some(Value::Array(keys)) => keys
                    .iter()
                    .map(|k| match k {
                        Value::String(s) => Ok(s.clone()),
                        _ => Err(TriggerParseError::BadField("source_keys")),
                    })
                    .collect::<Result<BTreeSet<_>, _>>()?,
                _ => return Err(TriggerParseError::MissingField("source_keys")),
            };
            Ok(AggregateTriggerData {
                key_piece,
                source_keys,
                filters: parse_optional_filter_set(obj.get("filters"))?,
                not_filters: parse_optional_filter_set(obj.get("not_filters"))?,
            })
        })
        .collect()
}

fn parse_aggregatable_values(raw: &str) -> Result<BTreeMap<String, u32>, TriggerParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| TriggerParseError::Json)?;
    let Value::Object(obj) = value else {
        return Err(TriggerParseError::BadField("aggregatable_values"));
    };
    let mut out = BTreeMap::new();
    for (id, v) in obj {
        let number = v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(TriggerParseError::BadField("aggregatable_values"))?;
        out.insert(id, number);
    }
    Ok(out)
}

fn parse_dedup_rules(raw: &str) -> Result<Vec<AggregateDedupRule>, TriggerParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| TriggerParseError::Json)?;
    let Value::Array(items) = value else {
        return Err(TriggerParseError::BadField("aggregatable_deduplication_keys"));
    };
    items
        .iter()
        .map(|item| {
            let Value::Object(obj) = item else {
                return Err(TriggerParseError::BadField("aggregatable_deduplication_keys"));
            };
            Ok(AggregateDedupRule {
                dedup_key: parse_optional_u64(obj.get("deduplication_key"), "deduplication_key")?,
                filters: parse_optional_filter_set(obj.get("filters"))?,
                not_filters: parse_optional_filter_set(obj.get("not_filters"))?,
            })
        })
        .collect()
}

fn parse_optional_u64(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<u64>, TriggerParseError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            s.parse::<u64>().map(Some).map_err(|_| TriggerParseError::BadField(field))
        }
        Some(_) => Err(TriggerParseError::BadField(field)),
    }
}

fn parse_optional_filter_set(value: Option<&Value>) -> Result<Vec<FilterMap>, TriggerParseError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => Ok(filter_set_from_value(v)?),
    }
}
