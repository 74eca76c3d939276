// Copyright (c) 2026 Matchbook Contributors
// SPDX-License-Identifier: Apache-2.0

//! Aggregate histogram assembly.
//!
//! A source registers named 128-bit key pieces; a trigger supplies
//! key-piece extensions, values and dedup rules. Matching entries OR
//! their piece onto the source piece, and a contribution is emitted
//! for every key id that carries a value. The per-source contribution
//! budget is enforced with checked arithmetic only.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::filter::{self, FilterError, FilterMap};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("aggregation payload is not valid JSON")]
    Json,

    #[error("aggregation key {0:?} is not a 0x-prefixed hex string")]
    BadKeyPiece(String),

    #[error("aggregatable value for {0:?} is not an unsigned integer")]
    BadValue(String),

    #[error(transparent)]
    Filter(FilterError),
}

/// Aggregatable view of a source: key id → key piece, plus the filter
/// map the trigger-side entries are matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatableSource {
    pub keys: BTreeMap<String, u128>,
    pub filter_map: FilterMap,
}

/// One trigger-side key-piece extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateTriggerData {
    pub key_piece: u128,
    pub source_keys: BTreeSet<String>,
    pub filters: Vec<FilterMap>,
    pub not_filters: Vec<FilterMap>,
}

/// One aggregate dedup rule; the first rule whose filters match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDedupRule {
    pub dedup_key: Option<u64>,
    pub filters: Vec<FilterMap>,
    pub not_filters: Vec<FilterMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregatableTrigger {
    pub trigger_data: Vec<AggregateTriggerData>,
    pub values: BTreeMap<String, u32>,
    pub dedup_rules: Vec<AggregateDedupRule>,
}

/// A single (bucket, value) pair contributed toward an aggregate
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramContribution {
    pub key: u128,
    pub value: u32,
}

/// Parses `{"id": "0x159", ...}` into key id → 128-bit piece.
pub fn parse_aggregation_keys(raw: &str) -> Result<BTreeMap<String, u128>, AggregateError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| AggregateError::Json)?;
    let Value::Object(map) = value else {
        return Err(AggregateError::Json);
    };
    let mut out = BTreeMap::new();
    for (id, piece) in map {
        let Value::String(hex) = piece else {
            return Err(AggregateError::BadKeyPiece(id));
        };
        out.insert(id.clone(), parse_key_piece(&hex).ok_or(AggregateError::BadKeyPiece(id))?);
    }
    Ok(out)
}

pub fn parse_key_piece(hex: &str) -> Option<u128> {
    let digits = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X"))?;
    u128::from_str_radix(digits, 16).ok()
}

/// Assembles the histogram contributions for a (source, trigger)
/// pair. Entries whose filters reject the source filter map leave the
/// key pieces untouched; keys with no registered value contribute
/// nothing.
pub fn assemble_contributions(
    source: &AggregatableSource,
    trigger: &AggregatableTrigger,
) -> Vec<HistogramContribution> {
    let mut keys = source.keys.clone();
    for entry in &trigger.trigger_data {
        if !filter::is_filter_match(&source.filter_map, &entry.filters, true)
            || !filter::is_filter_match(&source.filter_map, &entry.not_filters, false)
        {
            continue;
        }
        for id in &entry.source_keys {
            if let Some(piece) = keys.get_mut(id) {
                *piece |= entry.key_piece;
            }
        }
    }
    keys.iter()
        .filter_map(|(id, piece)| {
            trigger
                .values
                .get(id)
                .map(|value| HistogramContribution { key: *piece, value: *value })
        })
        .collect()
}

/// Picks the dedup key for this attribution: the first rule whose
/// filter sets accept the source filter map. A matching rule without
/// a key value means "no dedup key".
pub fn extract_dedup_key(trigger: &AggregatableTrigger, source_filters: &FilterMap) -> Option<u64> {
    trigger
        .dedup_rules
        .iter()
        .find(|rule| {
            filter::is_filter_match(source_filters, &rule.filters, true)
                && filter::is_filter_match(source_filters, &rule.not_filters, false)
        })
        .and_then(|rule| rule.dedup_key)
}

/// Adds the contributions onto the running per-source sum. Returns
/// `None` when the sum would pass `budget` or overflow; overflow is
/// budget exhaustion, never a crash.
pub fn accumulate_contributions(
    current: u32,
    contributions: &[HistogramContribution],
    budget: u32,
) -> Option<u32> {
    let mut total = current;
    for contribution in contributions {
        total = total.checked_add(contribution.value)?;
        if total > budget {
            return None;
        }
    }
    Some(total)
}
