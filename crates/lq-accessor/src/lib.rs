#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use lq_types::{DataPoint, as_number, is_bool_like, is_key_like, is_location, is_number_like};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The datapoint field an extractor starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    T,
    D,
    M,
    Dt,
}

/// Explicit extractor identity: a datapoint field plus nested object keys.
/// Two equal paths are the same extractor for cache purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    field: Field,
    keys: Vec<String>,
}

impl FieldPath {
    #[must_use]
    pub fn new(field: Field) -> Self {
        Self {
            field,
            keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn data() -> Self {
        Self::new(Field::D)
    }

    #[must_use]
    pub fn time() -> Self {
        Self::new(Field::T)
    }

    #[must_use]
    pub fn meta() -> Self {
        Self::new(Field::M)
    }

    #[must_use]
    pub fn duration() -> Self {
        Self::new(Field::Dt)
    }

    /// Narrow into a nested object key. Extracting a key from a non-object
    /// yields null, matching lenient wire data.
    #[must_use]
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut keys = self.keys.clone();
        keys.push(key.into());
        Self {
            field: self.field,
            keys,
        }
    }

    #[must_use]
    pub fn field(&self) -> Field {
        self.field
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Stable dotted rendering, used in composite cache keys.
    #[must_use]
    pub fn dotted(&self) -> String {
        let field = match self.field {
            Field::T => "t",
            Field::D => "d",
            Field::M => "m",
            Field::Dt => "dt",
        };
        if self.keys.is_empty() {
            field.to_owned()
        } else {
            format!("{field}.{}", self.keys.join("."))
        }
    }

    /// Extract this path's value from a datapoint. Missing fields and keys
    /// come back as `Value::Null`.
    #[must_use]
    pub fn extract(&self, point: &DataPoint) -> Value {
        let mut current = match self.field {
            Field::T => Value::from(point.t),
            Field::D => point.d.clone(),
            Field::M => point.m.clone().unwrap_or(Value::Null),
            Field::Dt => point.dt.map_or(Value::Null, Value::from),
        };
        for key in &self.keys {
            current = match current {
                Value::Object(mut map) => map.remove(key).unwrap_or(Value::Null),
                _ => Value::Null,
            };
        }
        current
    }
}

/// Object-key coverage over a column: `all` counts how often each key
/// appears, `min` holds the keys present in every datapoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFacts {
    pub all: BTreeMap<String, usize>,
    pub min: BTreeSet<String>,
}

/// Numeric interpretation of a column. `key` is set when a single-key
/// object column was unwrapped through that key.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericFacts {
    pub key: Option<String>,
    pub all_bool: bool,
    pub all_int: bool,
    pub min: f64,
    pub max: f64,
    path: FieldPath,
}

impl NumericFacts {
    /// Map a value into `[0, 1]` over the observed range.
    #[must_use]
    pub fn normalize(&self, x: f64) -> f64 {
        if self.min == self.max {
            0.0
        } else {
            (x - self.min) / (self.max - self.min)
        }
    }

    /// The numeric value of one datapoint under this column's effective
    /// extractor (including any single-key unwrap).
    #[must_use]
    pub fn number_of(&self, point: &DataPoint) -> Option<f64> {
        as_number(&self.path.extract(point))
    }

    /// Effective extractor, including the unwrapped key if any.
    #[must_use]
    pub fn effective_path(&self) -> &FieldPath {
        &self.path
    }
}

/// Category key preserving the distinction between `1` and `"1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CategoryKey {
    Bool(bool),
    Int(i64),
    FloatBits(u64),
    Text(String),
}

impl CategoryKey {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(|f| Self::FloatBits(f.to_bits()))
                }
            }
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

/// Categorical interpretation: present when distinct values are few
/// relative to the column size. `category_map` preserves first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoricalFacts {
    pub categories: usize,
    pub total: usize,
    pub category_map: Vec<(CategoryKey, usize)>,
}

/// Location interpretation: every value is an object with numeric
/// latitude/longitude. Carries the bounding box of the column.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFacts {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

const CATEGORY_HARD_CAP: usize = 200;
const CATEGORY_SMALL_SET: usize = 20;

#[must_use]
pub fn key_facts(points: &[DataPoint], path: &FieldPath) -> Option<KeyFacts> {
    if points.is_empty() {
        return None;
    }

    let mut all = BTreeMap::<String, usize>::new();
    for point in points {
        let Value::Object(map) = path.extract(point) else {
            return None;
        };
        for key in map.keys() {
            *all.entry(key.clone()).or_insert(0) += 1;
        }
    }

    let min = all
        .iter()
        .filter(|(_, count)| **count == points.len())
        .map(|(key, _)| key.clone())
        .collect();

    Some(KeyFacts { all, min })
}

#[must_use]
pub fn numeric_facts(points: &[DataPoint], path: &FieldPath) -> Option<NumericFacts> {
    if points.is_empty() {
        return None;
    }

    // A column of single-key objects is still numeric through that key;
    // merged event streams commonly look like {"steps": 410}.
    let mut effective = path.clone();
    let mut key = None;
    if path.extract(&points[0]).is_object() {
        let facts = key_facts(points, path)?;
        if facts.all.len() != 1 || facts.min.len() != 1 {
            return None;
        }
        let only = facts.min.iter().next()?.clone();
        effective = path.child(only.clone());
        if effective.extract(&points[0]).is_object() {
            return None;
        }
        key = Some(only);
    }

    let mut all_bool = true;
    let mut all_int = true;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for point in points {
        let value = effective.extract(point);
        if !is_number_like(&value) {
            return None;
        }
        if all_bool && !is_bool_like(&value) {
            all_bool = false;
        }
        let n = as_number(&value)?;
        if all_int && n.fract() != 0.0 {
            all_int = false;
        }
        if n < min {
            min = n;
        }
        if n > max {
            max = n;
        }
    }

    Some(NumericFacts {
        key,
        all_bool,
        all_int,
        min,
        max,
        path: effective,
    })
}

#[must_use]
pub fn categorical_facts(points: &[DataPoint], path: &FieldPath) -> Option<CategoricalFacts> {
    if points.is_empty() {
        return None;
    }

    let mut ordering = Vec::<(CategoryKey, usize)>::new();
    let mut slots = HashMap::<CategoryKey, usize>::new();
    for point in points {
        let value = path.extract(point);
        if !is_key_like(&value) {
            return None;
        }
        let key = CategoryKey::from_value(&value)?;
        match slots.get(&key) {
            Some(&slot) => ordering[slot].1 += 1,
            None => {
                if ordering.len() >= CATEGORY_HARD_CAP {
                    return None;
                }
                slots.insert(key.clone(), ordering.len());
                ordering.push((key, 1));
            }
        }
    }

    let categories = ordering.len();
    let total = points.len();
    let sparse = (categories as f64) / (total as f64) < 0.5
        || (categories < total && categories < CATEGORY_SMALL_SET);
    if !sparse {
        return None;
    }

    Some(CategoricalFacts {
        categories,
        total,
        category_map: ordering,
    })
}

#[must_use]
pub fn location_facts(points: &[DataPoint], path: &FieldPath) -> Option<LocationFacts> {
    if points.is_empty() {
        return None;
    }

    let mut out = LocationFacts {
        min_latitude: f64::INFINITY,
        max_latitude: f64::NEG_INFINITY,
        min_longitude: f64::INFINITY,
        max_longitude: f64::NEG_INFINITY,
    };
    for point in points {
        let value = path.extract(point);
        if !is_location(&value) {
            return None;
        }
        let lat = as_number(&value["latitude"])?;
        let lon = as_number(&value["longitude"])?;
        out.min_latitude = out.min_latitude.min(lat);
        out.max_latitude = out.max_latitude.max(lat);
        out.min_longitude = out.min_longitude.min(lon);
        out.max_longitude = out.max_longitude.max(lon);
    }
    Some(out)
}

#[derive(Debug, Default)]
struct CacheEntry {
    keys: Option<Option<Arc<KeyFacts>>>,
    numeric: Option<Option<Arc<NumericFacts>>>,
    categorical: Option<Option<Arc<CategoricalFacts>>>,
    location: Option<Option<Arc<LocationFacts>>>,
    values: Option<Arc<Vec<Value>>>,
}

/// Memoization over `(array identity, field path)`. The array key is the
/// `Arc` pointer, so substituting a new array implicitly invalidates every
/// entry; the cache must not outlive the arrays it has seen.
#[derive(Debug, Default)]
pub struct FactsCache {
    entries: Mutex<HashMap<(usize, FieldPath), CacheEntry>>,
}

impl FactsCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(
        &self,
        points: &Arc<Vec<DataPoint>>,
        path: &FieldPath,
        f: impl FnOnce(&mut CacheEntry) -> R,
    ) -> R {
        let key = (Arc::as_ptr(points) as usize, path.clone());
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(entries.entry(key).or_default())
    }

    pub fn keys(&self, points: &Arc<Vec<DataPoint>>, path: &FieldPath) -> Option<Arc<KeyFacts>> {
        self.with_entry(points, path, |entry| {
            entry
                .keys
                .get_or_insert_with(|| key_facts(points, path).map(Arc::new))
                .clone()
        })
    }

    pub fn numeric(
        &self,
        points: &Arc<Vec<DataPoint>>,
        path: &FieldPath,
    ) -> Option<Arc<NumericFacts>> {
        self.with_entry(points, path, |entry| {
            entry
                .numeric
                .get_or_insert_with(|| numeric_facts(points, path).map(Arc::new))
                .clone()
        })
    }

    pub fn categorical(
        &self,
        points: &Arc<Vec<DataPoint>>,
        path: &FieldPath,
    ) -> Option<Arc<CategoricalFacts>> {
        self.with_entry(points, path, |entry| {
            entry
                .categorical
                .get_or_insert_with(|| categorical_facts(points, path).map(Arc::new))
                .clone()
        })
    }

    pub fn location(
        &self,
        points: &Arc<Vec<DataPoint>>,
        path: &FieldPath,
    ) -> Option<Arc<LocationFacts>> {
        self.with_entry(points, path, |entry| {
            entry
                .location
                .get_or_insert_with(|| location_facts(points, path).map(Arc::new))
                .clone()
        })
    }

    /// The full extracted column, computed once per `(array, path)`.
    pub fn values(&self, points: &Arc<Vec<DataPoint>>, path: &FieldPath) -> Arc<Vec<Value>> {
        self.with_entry(points, path, |entry| {
            entry
                .values
                .get_or_insert_with(|| {
                    Arc::new(points.iter().map(|point| path.extract(point)).collect())
                })
                .clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lq_types::DataPoint;
    use serde_json::json;

    use super::{CategoryKey, FactsCache, FieldPath, categorical_facts, key_facts, numeric_facts};

    fn points(values: &[serde_json::Value]) -> Arc<Vec<DataPoint>> {
        Arc::new(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| DataPoint::new(i as f64, v.clone()))
                .collect(),
        )
    }

    #[test]
    fn numeric_facts_match_plain_integer_column() {
        let arr = points(&[json!(5), json!(7)]);
        let facts = numeric_facts(&arr, &FieldPath::data()).expect("numeric");
        assert_eq!(facts.min, 5.0);
        assert_eq!(facts.max, 7.0);
        assert!(facts.all_int);
        assert!(!facts.all_bool);
        assert_eq!(facts.normalize(6.0), 0.5);
    }

    #[test]
    fn numeric_facts_unwrap_single_key_objects() {
        let arr = points(&[json!({"steps": 100}), json!({"steps": 250.5})]);
        let facts = numeric_facts(&arr, &FieldPath::data()).expect("numeric");
        assert_eq!(facts.key.as_deref(), Some("steps"));
        assert!(!facts.all_int);
        assert_eq!(facts.max, 250.5);
        assert_eq!(facts.number_of(&arr[0]), Some(100.0));
    }

    #[test]
    fn numeric_facts_reject_mixed_columns() {
        let arr = points(&[json!(1), json!("pizza")]);
        assert!(numeric_facts(&arr, &FieldPath::data()).is_none());

        let multi = points(&[json!({"a": 1, "b": 2})]);
        assert!(numeric_facts(&multi, &FieldPath::data()).is_none());
    }

    #[test]
    fn key_facts_split_total_and_partial_coverage() {
        let arr = points(&[
            json!({"a": 1, "b": 2}),
            json!({"a": 3}),
            json!({"a": 5, "c": 6}),
        ]);
        let facts = key_facts(&arr, &FieldPath::data()).expect("keys");
        assert_eq!(facts.all["a"], 3);
        assert_eq!(facts.all["b"], 1);
        assert!(facts.min.contains("a"));
        assert!(!facts.min.contains("b"));
    }

    #[test]
    fn categorical_facts_apply_sparsity_heuristics() {
        let sparse = points(&[json!("a"), json!("b"), json!("a"), json!("a")]);
        let facts = categorical_facts(&sparse, &FieldPath::data()).expect("categorical");
        assert_eq!(facts.categories, 2);
        assert_eq!(facts.total, 4);
        assert_eq!(facts.category_map[0], (CategoryKey::Text("a".into()), 3));

        // All-distinct medium column: not categorical.
        let dense_values: Vec<_> = (0..40).map(|i| json!(format!("v{i}"))).collect();
        let dense = points(&dense_values);
        assert!(categorical_facts(&dense, &FieldPath::data()).is_none());
    }

    #[test]
    fn cache_returns_identical_facts_for_same_array_and_path() {
        let cache = FactsCache::new();
        let arr = points(&[json!(5), json!(7)]);

        let first = cache.numeric(&arr, &FieldPath::data()).expect("first");
        let second = cache.numeric(&arr, &FieldPath::data()).expect("second");
        assert!(Arc::ptr_eq(&first, &second));

        let fresh = points(&[json!(5), json!(7)]);
        let third = cache.numeric(&fresh, &FieldPath::data()).expect("third");
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn cache_memoizes_extracted_columns() {
        let cache = FactsCache::new();
        let arr = points(&[json!({"v": 1}), json!({"v": 2})]);
        let path = FieldPath::data().child("v");

        let first = cache.values(&arr, &path);
        let second = cache.values(&arr, &path);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, vec![json!(1), json!(2)]);
    }
}
