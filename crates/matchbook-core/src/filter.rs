// Copyright (c) 2026 Matchbook Contributors
// SPDX-License-Identifier: Apache-2.0

//! Filter-expression evaluation.
//!
//! A source carries a filter map (key → list of values); a trigger
//! supplies one or more filter maps per clause. Matching is OR across
//! the set, AND across keys within one map, and per key an
//! intersection test on the value lists. Keys present on only one
//! side are skipped. Negated matching (`not_filters`) inverts the
//! per-key test.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter payload is not valid JSON")]
    Json,

    #[error("filter set must be a JSON array of objects")]
    NotAnArray,

    #[error("filter map must be a JSON object of string arrays")]
    NotAnObject,

    #[error("filter values for key {0:?} must be an array of strings")]
    BadValues(String),
}

/// One filter map: key → allowed values. Ordered so serialization and
/// iteration are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterMap(BTreeMap<String, Vec<String>>);

impl FilterMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.0.insert(key.into(), values);
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// Parses a single JSON object of the form
    /// `{"key": ["v1", "v2"], ...}`.
    pub fn from_json_object(value: &Value) -> Result<Self, FilterError> {
        let Value::Object(map) = value else {
            return Err(FilterError::NotAnObject);
        };
        let mut out = BTreeMap::new();
        for (key, values) in map {
            let Value::Array(items) = values else {
                return Err(FilterError::BadValues(key.clone()));
            };
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                let Value::String(s) = item else {
                    return Err(FilterError::BadValues(key.clone()));
                };
                list.push(s.clone());
            }
            out.insert(key.clone(), list);
        }
        Ok(Self(out))
    }

    pub fn to_json_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, vs)| {
                    (
                        k.clone(),
                        Value::Array(vs.iter().cloned().map(Value::String).collect()),
                    )
                })
                .collect(),
        )
    }
}

/// Parses a serialized filter set: a JSON array of filter-map objects.
/// `None` or the empty string mean "no restriction" and yield an empty
/// set. Callers apply the fails-closed policy on `Err` explicitly.
pub fn parse_filter_set(raw: Option<&str>) -> Result<Vec<FilterMap>, FilterError> {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return Ok(Vec::new());
    };
    let value: Value = serde_json::from_str(raw).map_err(|_| FilterError::Json)?;
    filter_set_from_value(&value)
}

pub fn filter_set_from_value(value: &Value) -> Result<Vec<FilterMap>, FilterError> {
    let Value::Array(items) = value else {
        return Err(FilterError::NotAnArray);
    };
    items.iter().map(FilterMap::from_json_object).collect()
}

/// Evaluates a source filter map against a trigger-supplied filter
/// set. An empty source map or empty set means no restriction.
pub fn is_filter_match(source: &FilterMap, trigger_set: &[FilterMap], positive: bool) -> bool {
    if source.is_empty() || trigger_set.is_empty() {
        return true;
    }
    trigger_set
        .iter()
        .any(|candidate| matches_single(source, candidate, positive))
}

fn matches_single(source: &FilterMap, trigger: &FilterMap, positive: bool) -> bool {
    for (key, trigger_values) in trigger.iter() {
        let Some(source_values) = source.get(key) else {
            continue;
        };
        if !match_values(source_values, trigger_values, positive) {
            return false;
        }
    }
    true
}

fn match_values(source_values: &[String], trigger_values: &[String], positive: bool) -> bool {
    if trigger_values.is_empty() {
        return if positive {
            source_values.is_empty()
        } else {
            !source_values.is_empty()
        };
    }
    let intersects = trigger_values.iter().any(|v| source_values.contains(v));
    if positive { intersects } else { !intersects }
}
