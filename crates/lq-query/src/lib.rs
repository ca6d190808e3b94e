#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use lq_types::SeriesId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("a dataset query must be a JSON object of named elements")]
    NotAnObject,
    #[error("query element {0:?} is not a JSON object")]
    ElementNotAnObject(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One named element of a dataset query: either a direct series reference
/// with optional range/transform, a `merge` of sub-elements, or a nested
/// `dataset` of named sub-elements. Unknown fields are carried through and
/// participate in the cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryElement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeseries: Option<SeriesId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i1: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i2: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t1: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t2: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_transform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<Vec<QueryElement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<BTreeMap<String, QueryElement>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl QueryElement {
    /// True iff the element is a bare series reference: it names a series
    /// and applies no transform and no nested dataset.
    #[must_use]
    pub fn is_simple(&self) -> bool {
        if self.transform.as_deref().is_some_and(|t| !t.is_empty()) {
            return false;
        }
        if self
            .post_transform
            .as_deref()
            .is_some_and(|t| !t.is_empty())
        {
            return false;
        }
        self.timeseries.is_some() && self.dataset.is_none()
    }

    /// All series identifiers transitively reachable from this element.
    #[must_use]
    pub fn referenced_series(&self) -> BTreeSet<SeriesId> {
        let mut out = BTreeSet::new();
        self.collect_series(&mut out);
        out
    }

    fn collect_series(&self, out: &mut BTreeSet<SeriesId>) {
        if let Some(id) = &self.timeseries {
            out.insert(id.clone());
        }
        if let Some(merge) = &self.merge {
            for element in merge {
                element.collect_series(out);
            }
        }
        if let Some(dataset) = &self.dataset {
            for element in dataset.values() {
                element.collect_series(out);
            }
        }
    }
}

/// A full dataset query: named elements in deterministic order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetQuery {
    elements: BTreeMap<String, QueryElement>,
}

impl DatasetQuery {
    /// Parse a raw query value, applying numeric cleaning first so that
    /// string-formatted index fields deserialize.
    pub fn from_value(raw: &Value) -> Result<Self, QueryError> {
        if !raw.is_object() {
            return Err(QueryError::NotAnObject);
        }
        Ok(serde_json::from_value(clean(raw))?)
    }

    #[must_use]
    pub fn elements(&self) -> &BTreeMap<String, QueryElement> {
        &self.elements
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&QueryElement> {
        self.elements.get(key)
    }

    /// Union of every element's transitively referenced series.
    #[must_use]
    pub fn referenced_series(&self) -> BTreeSet<SeriesId> {
        let mut out = BTreeSet::new();
        for element in self.elements.values() {
            element.collect_series(&mut out);
        }
        out
    }
}

/// Numeric cleaning: the index-range fields accept numeric strings from
/// the frontend (`"50"`) and fractional numbers; both collapse to integers
/// so that equivalent queries share one cache key. Recurses through
/// `merge` and `dataset` nesting.
#[must_use]
pub fn clean(raw: &Value) -> Value {
    match raw {
        Value::Object(map) => {
            let cleaned = map
                .iter()
                .map(|(key, element)| (key.clone(), clean_element(element)))
                .collect::<Map<_, _>>();
            Value::Object(cleaned)
        }
        other => other.clone(),
    }
}

const INT_FIELDS: [&str; 4] = ["i1", "i2", "i", "limit"];

fn clean_element(element: &Value) -> Value {
    let Value::Object(map) = element else {
        return element.clone();
    };

    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        let cleaned = if INT_FIELDS.contains(&key.as_str()) {
            coerce_int(value)
        } else if key == "merge" {
            match value {
                Value::Array(items) => Value::Array(items.iter().map(clean_element).collect()),
                other => other.clone(),
            }
        } else if key == "dataset" {
            clean(value)
        } else {
            value.clone()
        };
        out.insert(key.clone(), cleaned);
    }
    Value::Object(out)
}

fn coerce_int(value: &Value) -> Value {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Value::from(v.trunc() as i64),
        _ => value.clone(),
    }
}

/// Canonical cache key: the cleaned query re-serialized with every object's
/// keys sorted. Byte-for-byte equality of canonical keys is query equality.
pub fn canonical_key(raw: &Value) -> Result<String, QueryError> {
    if !raw.is_object() {
        return Err(QueryError::NotAnObject);
    }
    Ok(serde_json::to_string(&sort_keys(&clean(raw)))?)
}

/// Canonical rendering of an arbitrary JSON value (keys sorted, no
/// cleaning). Used wherever a value itself must act as a cache key.
pub fn canonical_json(value: &Value) -> Result<String, QueryError> {
    Ok(serde_json::to_string(&sort_keys(value))?)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by_key(|(key, _)| key.as_str());
            let sorted = entries
                .into_iter()
                .map(|(key, inner)| (key.clone(), sort_keys(inner)))
                .collect::<Map<_, _>>();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Referenced-series extraction straight off a raw value, for callers that
/// have not built the typed model.
pub fn referenced_series(raw: &Value) -> Result<BTreeSet<SeriesId>, QueryError> {
    Ok(DatasetQuery::from_value(raw)?.referenced_series())
}
