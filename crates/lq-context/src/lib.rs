#![forbid(unsafe_code)]

mod registry;

pub use registry::{AnalysisFn, AnalysisRegistry};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use lq_accessor::{
    CategoricalFacts, FactsCache, FieldPath, KeyFacts, LocationFacts, NumericFacts,
};
use lq_query::{DatasetQuery, QueryElement, QueryError, canonical_key};
use lq_types::{DataPoint, SeriesId, SeriesMetadata, clamp_durations};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Query(#[from] QueryError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("unknown analysis function: {0}")]
    UnknownFunction(String),
    #[error("analysis function {name} failed: {message}")]
    Failed { name: String, message: String },
}

/// Per-element view of the raw query, answering questions without mutating
/// the underlying request.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    raw: Value,
    canonical: String,
    parsed: DatasetQuery,
}

impl QueryInfo {
    pub fn new(raw: Value) -> Result<Self, QueryError> {
        let canonical = canonical_key(&raw)?;
        let parsed = DatasetQuery::from_value(&raw)?;
        Ok(Self {
            raw,
            canonical,
            parsed,
        })
    }

    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    #[must_use]
    pub fn element(&self, key: &str) -> Option<&QueryElement> {
        self.parsed.get(key)
    }

    #[must_use]
    pub fn is_simple(&self, key: &str) -> bool {
        self.element(key).is_some_and(QueryElement::is_simple)
    }

    #[must_use]
    pub fn all_timeseries(&self) -> BTreeSet<SeriesId> {
        self.parsed.referenced_series()
    }

    /// Canonical equality against a freshly canonicalized incoming query.
    #[must_use]
    pub fn is_equal(&self, other: &Value) -> bool {
        canonical_key(other).is_ok_and(|key| key == self.canonical)
    }
}

#[derive(Default)]
struct CallCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl CallCache {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn insert(&self, key: String, value: Value) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value);
    }
}

/// A lazily-evaluated column: one element's datapoint array narrowed to a
/// field path, with facts and named analysis calls memoized behind it.
#[derive(Clone)]
pub struct ColumnView {
    element: String,
    index: usize,
    points: Arc<Vec<DataPoint>>,
    path: FieldPath,
    facts: Arc<FactsCache>,
    calls: Arc<CallCache>,
    registry: Arc<AnalysisRegistry>,
}

impl ColumnView {
    #[must_use]
    pub fn element(&self) -> &str {
        &self.element
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    #[must_use]
    pub fn points(&self) -> &Arc<Vec<DataPoint>> {
        &self.points
    }

    /// Narrow into a nested field of the current path.
    #[must_use]
    pub fn field(&self, key: impl Into<String>) -> Self {
        let mut narrowed = self.clone();
        narrowed.path = self.path.child(key);
        narrowed
    }

    /// The full extracted column, computed once and shared.
    #[must_use]
    pub fn values(&self) -> Arc<Vec<Value>> {
        self.facts.values(&self.points, &self.path)
    }

    #[must_use]
    pub fn value_at(&self, idx: usize) -> Option<Value> {
        self.points.get(idx).map(|point| self.path.extract(point))
    }

    #[must_use]
    pub fn key_facts(&self) -> Option<Arc<KeyFacts>> {
        self.facts.keys(&self.points, &self.path)
    }

    #[must_use]
    pub fn numeric_facts(&self) -> Option<Arc<NumericFacts>> {
        self.facts.numeric(&self.points, &self.path)
    }

    #[must_use]
    pub fn categorical_facts(&self) -> Option<Arc<CategoricalFacts>> {
        self.facts.categorical(&self.points, &self.path)
    }

    #[must_use]
    pub fn location_facts(&self) -> Option<Arc<LocationFacts>> {
        self.facts.location(&self.points, &self.path)
    }

    /// Invoke a registered analysis function by name. Cacheable functions
    /// are memoized by `(element, path, function, args)`.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, AnalysisError> {
        let (f, cacheable) = self
            .registry
            .lookup(name)
            .ok_or_else(|| AnalysisError::UnknownFunction(name.to_owned()))?;

        if !cacheable {
            return f(self, args);
        }

        let key = self.call_key(name, args);
        if let Some(hit) = self.calls.get(&key) {
            trace!(key = %key, "analysis cache hit");
            return Ok(hit);
        }
        trace!(key = %key, "analysis cache miss");
        let value = f(self, args)?;
        self.calls.insert(key, value.clone());
        Ok(value)
    }

    fn call_key(&self, name: &str, args: &[Value]) -> String {
        let args = serde_json::to_string(args).unwrap_or_default();
        format!("{}[{}].{name}({args})", self.element, self.path.dotted())
    }

    pub fn min(&self) -> Result<Value, AnalysisError> {
        self.call("min", &[])
    }

    pub fn max(&self) -> Result<Value, AnalysisError> {
        self.call("max", &[])
    }

    pub fn sum(&self) -> Result<Value, AnalysisError> {
        self.call("sum", &[])
    }

    pub fn mean(&self) -> Result<Value, AnalysisError> {
        self.call("mean", &[])
    }

    pub fn stdev(&self) -> Result<Value, AnalysisError> {
        self.call("stdev", &[])
    }

    pub fn non_null(&self) -> Result<Value, AnalysisError> {
        self.call("non_null", &[])
    }

    /// Consistent scalar type name of the column, or `""` when mixed.
    pub fn value_type(&self) -> Result<String, AnalysisError> {
        let value = self.call("value_type", &[])?;
        Ok(value.as_str().unwrap_or_default().to_owned())
    }
}

/// One element of the dataset: the raw array plus field-level views.
#[derive(Clone)]
pub struct DataColumn {
    element: String,
    index: usize,
    points: Arc<Vec<DataPoint>>,
    facts: Arc<FactsCache>,
    calls: Arc<CallCache>,
    registry: Arc<AnalysisRegistry>,
}

impl DataColumn {
    #[must_use]
    pub fn element(&self) -> &str {
        &self.element
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn points(&self) -> &Arc<Vec<DataPoint>> {
        &self.points
    }

    /// View of this column narrowed to an explicit field path.
    #[must_use]
    pub fn view(&self, path: FieldPath) -> ColumnView {
        ColumnView {
            element: self.element.clone(),
            index: self.index,
            points: Arc::clone(&self.points),
            path,
            facts: Arc::clone(&self.facts),
            calls: Arc::clone(&self.calls),
            registry: Arc::clone(&self.registry),
        }
    }

    #[must_use]
    pub fn d(&self) -> ColumnView {
        self.view(FieldPath::data())
    }

    #[must_use]
    pub fn t(&self) -> ColumnView {
        self.view(FieldPath::time())
    }

    #[must_use]
    pub fn m(&self) -> ColumnView {
        self.view(FieldPath::meta())
    }

    #[must_use]
    pub fn dt(&self) -> ColumnView {
        self.view(FieldPath::duration())
    }
}

/// Derived, read-only snapshot combining fetched data, resolved series
/// metadata, and settings. Built once per fetched dataset; a settings-only
/// change swaps `settings` in place and leaves every cache valid.
pub struct DatasetContext {
    keys: Vec<String>,
    data: BTreeMap<String, DataColumn>,
    query: QueryInfo,
    timeseries: BTreeMap<SeriesId, SeriesMetadata>,
    settings: RwLock<Arc<Value>>,
}

impl DatasetContext {
    pub fn new(
        raw_query: Value,
        dataset: BTreeMap<String, Vec<DataPoint>>,
        timeseries: BTreeMap<SeriesId, SeriesMetadata>,
        settings: Value,
        registry: Arc<AnalysisRegistry>,
    ) -> Result<Self, ContextError> {
        let query = QueryInfo::new(raw_query)?;
        let keys = dataset.keys().cloned().collect::<Vec<_>>();

        let facts = Arc::new(FactsCache::new());
        let calls = Arc::new(CallCache::default());

        let mut data = BTreeMap::new();
        for (index, (element, mut points)) in dataset.into_iter().enumerate() {
            clamp_durations(&mut points);
            data.insert(
                element.clone(),
                DataColumn {
                    element,
                    index,
                    points: Arc::new(points),
                    facts: Arc::clone(&facts),
                    calls: Arc::clone(&calls),
                    registry: Arc::clone(&registry),
                },
            );
        }

        Ok(Self {
            keys,
            data,
            query,
            timeseries,
            settings: RwLock::new(Arc::new(settings)),
        })
    }

    /// Sorted element names.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[must_use]
    pub fn query(&self) -> &QueryInfo {
        &self.query
    }

    #[must_use]
    pub fn column(&self, key: &str) -> Option<&DataColumn> {
        self.data.get(key)
    }

    /// Columns in `keys` order.
    pub fn columns(&self) -> impl Iterator<Item = &DataColumn> {
        self.keys.iter().filter_map(|key| self.data.get(key))
    }

    #[must_use]
    pub fn timeseries(&self) -> &BTreeMap<SeriesId, SeriesMetadata> {
        &self.timeseries
    }

    #[must_use]
    pub fn series(&self, id: &SeriesId) -> Option<&SeriesMetadata> {
        self.timeseries.get(id)
    }

    #[must_use]
    pub fn settings(&self) -> Arc<Value> {
        Arc::clone(&self.settings.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace settings in place without invalidating cached derived
    /// values; analysis results are keyed by array identity and stay valid.
    pub fn swap_settings(&self, settings: Value) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(settings);
    }

    /// Earliest timestamp across all elements.
    #[must_use]
    pub fn min_timestamp(&self) -> Option<f64> {
        self.columns()
            .filter_map(|column| column.points.first().map(|p| p.t))
            .min_by(f64::total_cmp)
    }

    /// Latest timestamp across all elements.
    #[must_use]
    pub fn max_timestamp(&self) -> Option<f64> {
        self.columns()
            .filter_map(|column| column.points.last().map(|p| p.t))
            .max_by(f64::total_cmp)
    }

    /// Display label for an element: the resolved series name for simple
    /// references, the element key otherwise.
    #[must_use]
    pub fn series_label(&self, key: &str) -> String {
        if let Some(element) = self.query.element(key)
            && element.is_simple()
            && let Some(id) = &element.timeseries
            && let Some(meta) = self.timeseries.get(id)
        {
            return meta.name.clone();
        }
        key.to_owned()
    }
}
