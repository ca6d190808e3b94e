use std::collections::HashMap;
use std::sync::Arc;

use lq_types::as_number;
use serde_json::Value;

use crate::{AnalysisError, ColumnView};

pub type AnalysisFn =
    Arc<dyn Fn(&ColumnView, &[Value]) -> Result<Value, AnalysisError> + Send + Sync>;

#[derive(Clone)]
struct AnalysisSpec {
    f: AnalysisFn,
    cacheable: bool,
}

/// Named analysis functions callable on any column view. Constructed at
/// startup and passed by reference into context construction; there is no
/// process-global registry.
#[derive(Clone, Default)]
pub struct AnalysisRegistry {
    functions: HashMap<String, AnalysisSpec>,
}

impl AnalysisRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard statistics set.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("min", true, |view, _| {
            Ok(fold_numbers(view, f64::INFINITY, f64::min)
                .map_or(Value::Null, Value::from))
        });
        registry.register("max", true, |view, _| {
            Ok(fold_numbers(view, f64::NEG_INFINITY, f64::max)
                .map_or(Value::Null, Value::from))
        });
        registry.register("sum", true, |view, _| {
            Ok(Value::from(numbers(view).sum::<f64>()))
        });
        registry.register("non_null", true, |view, _| {
            let count = view.values().iter().filter(|v| !v.is_null()).count();
            Ok(Value::from(count))
        });
        registry.register("mean", true, |view, _| Ok(mean(view).map_or(Value::Null, Value::from)));
        registry.register("var", true, |view, _| {
            Ok(variance(view).map_or(Value::Null, Value::from))
        });
        registry.register("stdev", true, |view, _| {
            Ok(variance(view).map_or(Value::Null, |v| Value::from(v.sqrt())))
        });
        registry.register("value_type", true, |view, _| {
            Ok(Value::from(value_type(view)))
        });
        registry.register("keys", true, |view, _| {
            Ok(view.key_facts().map_or(Value::Null, |facts| {
                Value::Object(
                    facts
                        .all
                        .iter()
                        .map(|(key, count)| (key.clone(), Value::from(*count)))
                        .collect(),
                )
            }))
        });
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        cacheable: bool,
        f: impl Fn(&ColumnView, &[Value]) -> Result<Value, AnalysisError> + Send + Sync + 'static,
    ) {
        self.functions.insert(
            name.into(),
            AnalysisSpec {
                f: Arc::new(f),
                cacheable,
            },
        );
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<(AnalysisFn, bool)> {
        self.functions
            .get(name)
            .map(|spec| (Arc::clone(&spec.f), spec.cacheable))
    }
}

fn numbers<'a>(view: &'a ColumnView) -> impl Iterator<Item = f64> + 'a {
    let values = view.values();
    (0..values.len()).filter_map(move |i| as_number(&values[i]))
}

fn fold_numbers(view: &ColumnView, init: f64, f: fn(f64, f64) -> f64) -> Option<f64> {
    let mut seen = false;
    let mut acc = init;
    for n in numbers(view) {
        acc = f(acc, n);
        seen = true;
    }
    seen.then_some(acc)
}

fn mean(view: &ColumnView) -> Option<f64> {
    let mut count = 0usize;
    let mut sum = 0.0;
    for n in numbers(view) {
        sum += n;
        count += 1;
    }
    (count > 0).then(|| sum / count as f64)
}

/// Sample variance over the non-null numeric values.
fn variance(view: &ColumnView) -> Option<f64> {
    let mu = mean(view)?;
    let mut count = 0usize;
    let mut acc = 0.0;
    for n in numbers(view) {
        acc += (n - mu).powi(2);
        count += 1;
    }
    (count > 1).then(|| acc / (count - 1) as f64)
}

const ENUM_UNIQUE_CAP: usize = 100;

/// Consistent scalar type of a column: `number`, `boolean`, `string`,
/// `object`, `enum` for low-cardinality strings, or `""` when mixed/empty.
fn value_type(view: &ColumnView) -> &'static str {
    let values = view.values();
    let Some(first) = values.iter().find(|v| !v.is_null()) else {
        return "";
    };

    let kind = |v: &Value| match v {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::Null => "null",
    };

    let expected = kind(first);
    if !values
        .iter()
        .all(|v| v.is_null() || kind(v) == expected)
    {
        return "";
    }
    if expected != "string" {
        return expected;
    }

    let mut uniques = std::collections::HashSet::new();
    for value in values.iter() {
        if let Value::String(s) = value {
            uniques.insert(s.clone());
            if uniques.len() > ENUM_UNIQUE_CAP || uniques.len() * 3 > values.len() {
                return "string";
            }
        }
    }
    "enum"
}
