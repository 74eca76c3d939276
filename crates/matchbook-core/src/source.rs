// Copyright (c) 2026 Matchbook Contributors
// SPDX-License-Identifier: Apache-2.0

//! The source record: a registered ad exposure eligible to receive
//! attribution credit. Records are immutable values; the engine
//! derives modified copies and persists explicit field updates.

use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregatableSource, AggregateError, parse_aggregation_keys};
use crate::filter::{FilterError, FilterMap};

/// Registration surface of an origin: an installed app or the web.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Surface {
    App,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceStatus {
    Active,
    Ignored,
    MarkedToDelete,
}

/// Whether the registration-time noising kept this source truthful.
/// Only truthful sources may produce event-level reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributionMode {
    Unassigned,
    Truthful,
    Never,
    Falsely,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Event,
    Navigation,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Navigation => "navigation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub event_id: u64,
    /// Origin that registered the source.
    pub publisher: String,
    pub publisher_surface: Surface,
    pub app_destination: Option<String>,
    pub web_destination: Option<String>,
    /// Enrolled ad-tech network the source belongs to.
    pub network_id: String,
    pub registrant: String,
    pub registration_id: Option<String>,
    pub registration_origin: String,
    pub source_type: SourceType,
    pub priority: i64,
    pub status: SourceStatus,
    pub event_time: i64,
    pub expiry_time: i64,
    pub event_report_window: i64,
    pub aggregatable_report_window: i64,
    pub attribution_mode: AttributionMode,
    pub install_attributed: bool,
    pub install_cooldown_window: i64,
    pub install_time: Option<i64>,
    /// Raw JSON object `{"key": ["v", ...], ...}`; parsed on demand.
    pub filter_data: Option<String>,
    /// Raw JSON object `{"id": "0x159", ...}`; parsed on demand.
    pub aggregation_keys: Option<String>,
    /// Running sum of histogram values attributed so far.
    pub aggregate_contributions: u32,
    pub event_report_dedup_keys: Vec<u64>,
    pub aggregate_report_dedup_keys: Vec<u64>,
    /// JSON array of aggregation-key ids shared with derived sources.
    pub shared_aggregation_keys: Option<String>,
    /// Set on derived (XNA) sources only; names the parent source.
    pub parent_id: Option<String>,
}

impl Source {
    /// Derived sources are synthesized per trigger and never persisted.
    pub fn is_derived(&self) -> bool {
        self.parent_id.is_some()
    }

    /// The id under which this source exists in the store, if any.
    pub fn persisted_id(&self) -> Option<&str> {
        if self.is_derived() { None } else { Some(&self.id) }
    }

    pub fn destination(&self, surface: Surface) -> Option<&str> {
        match surface {
            Surface::App => self.app_destination.as_deref(),
            Surface::Web => self.web_destination.as_deref(),
        }
    }

    /// Effective filter map: the registered filter data plus the
    /// synthetic `source_type` key.
    pub fn filter_map(&self) -> Result<FilterMap, FilterError> {
        let mut map = match self.filter_data.as_deref().filter(|s| !s.is_empty()) {
            None => FilterMap::new(),
            Some(raw) => {
                let value = serde_json::from_str(raw).map_err(|_| FilterError::Json)?;
                FilterMap::from_json_object(&value)?
            }
        };
        map.insert("source_type", vec![self.source_type.as_str().to_string()]);
        Ok(map)
    }

    /// Aggregatable view of this source, `None` when it registered no
    /// aggregation keys.
    pub fn aggregatable_source(&self) -> Result<Option<AggregatableSource>, AggregateError> {
        let Some(raw) = self.aggregation_keys.as_deref() else {
            return Ok(None);
        };
        let keys = parse_aggregation_keys(raw)?;
        let filter_map = self.filter_map().map_err(AggregateError::Filter)?;
        Ok(Some(AggregatableSource { keys, filter_map }))
    }

    /// Parsed shared aggregation key ids; malformed JSON reads as an
    /// empty list (fails closed).
    pub fn shared_aggregation_key_ids(&self) -> Vec<String> {
        self.shared_aggregation_keys
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default()
    }

    pub fn is_within_install_cooldown(&self, trigger_time: i64) -> bool {
        trigger_time < self.event_time.saturating_add(self.install_cooldown_window)
    }
}
