use lq_accessor::FieldPath;
use lq_context::{AnalysisError, ColumnView, DataColumn, DatasetContext};
use serde_json::{Value, json};

use crate::{PreprocessError, Visualization, VisualizationSet};

const MAX_SERIES: usize = 4;
const DOWNSAMPLE_LIMIT: usize = 50_000;
const HISTOGRAM_MIN_POINTS: usize = 40;

/// Keys of an object-valued column worth plotting: present in at least half
/// the datapoints and numeric or boolean, coordinates excluded, at most
/// four (preferring the best-covered).
fn useful_keys(column: &DataColumn) -> Result<Vec<String>, AnalysisError> {
    let view = column.d();
    let Some(facts) = view.key_facts() else {
        return Ok(Vec::new());
    };
    if facts.all.contains_key("latitude") || facts.all.contains_key("longitude") {
        return Ok(Vec::new());
    }

    let mut keys = Vec::new();
    for (key, count) in &facts.all {
        if *count * 2 < column.len() {
            continue;
        }
        let kind = view.field(key.clone()).value_type()?;
        if kind == "number" || kind == "boolean" {
            keys.push(key.clone());
        }
    }
    keys.sort();
    if keys.len() > MAX_SERIES {
        keys.sort_by_key(|key| std::cmp::Reverse(facts.all[key]));
        keys.truncate(MAX_SERIES);
        keys.sort();
    }
    Ok(keys)
}

fn series_config(label: &str, element: &str, field: &[&str]) -> Value {
    json!({
        "label": label,
        "element": element,
        "field": field,
    })
}

/// Raw line plot over numeric series, or over the useful numeric keys of a
/// single object-valued series.
pub fn linechart(ctx: &DatasetContext, set: &mut VisualizationSet) -> Result<(), AnalysisError> {
    let columns = ctx.columns().collect::<Vec<_>>();
    if columns.is_empty()
        || columns.len() > MAX_SERIES
        || columns.iter().any(|column| column.len() < 2)
    {
        return Ok(());
    }

    let mut series = Vec::new();
    if columns
        .iter()
        .all(|column| column.d().numeric_facts().is_some())
    {
        for column in &columns {
            let label = ctx.series_label(column.element());
            series.push(series_config(&label, column.element(), &[]));
        }
    } else if columns.len() == 1 && columns[0].d().value_type()? == "object" {
        for key in useful_keys(columns[0])? {
            series.push(series_config(&key, columns[0].element(), &[key.as_str()]));
        }
        if series.is_empty() {
            return Ok(());
        }
    } else {
        return Ok(());
    }

    set.insert(Visualization {
        key: "linechart".to_owned(),
        vis_type: "linechart".to_owned(),
        title: "Raw Plot".to_owned(),
        weight: 9.0,
        config: json!({ "series": series }),
        data: None,
    });
    Ok(())
}

/// Histogram over sufficiently large numeric series.
pub fn histogram(ctx: &DatasetContext, set: &mut VisualizationSet) -> Result<(), AnalysisError> {
    let columns = ctx.columns().collect::<Vec<_>>();
    if columns.is_empty() || columns.len() > MAX_SERIES {
        return Ok(());
    }
    if !columns.iter().all(|column| {
        column.len() > HISTOGRAM_MIN_POINTS && column.d().numeric_facts().is_some()
    }) {
        return Ok(());
    }

    let charts = columns
        .iter()
        .map(|column| {
            json!({
                "element": column.element(),
                "label": ctx.series_label(column.element()),
                "bins": if column.len() > 500 { 20 } else { 10 },
            })
        })
        .collect::<Vec<_>>();

    set.insert(Visualization {
        key: "histogram".to_owned(),
        vis_type: "histogram".to_owned(),
        title: "Histogram".to_owned(),
        weight: 11.0,
        config: json!({ "charts": charts }),
        data: None,
    });
    Ok(())
}

/// Tabular fallback, available whenever any element has data.
pub fn table(ctx: &DatasetContext, set: &mut VisualizationSet) -> Result<(), AnalysisError> {
    if ctx.columns().all(DataColumn::is_empty) {
        return Ok(());
    }
    let columns = ctx
        .columns()
        .map(|column| {
            json!({
                "element": column.element(),
                "label": ctx.series_label(column.element()),
                "count": column.len(),
            })
        })
        .collect::<Vec<_>>();

    set.insert(Visualization {
        key: "table".to_owned(),
        vis_type: "table".to_owned(),
        title: "Table".to_owned(),
        weight: 0.0,
        config: json!({ "columns": columns }),
        data: None,
    });
    Ok(())
}

fn config_series_view(
    ctx: &DatasetContext,
    entry: &Value,
    key: &str,
) -> Result<ColumnView, PreprocessError> {
    let element = entry["element"].as_str().ok_or_else(|| PreprocessError::BadConfig {
        key: key.to_owned(),
        message: "series entry is missing an element name".to_owned(),
    })?;
    let column = ctx.column(element).ok_or_else(|| PreprocessError::BadConfig {
        key: key.to_owned(),
        message: format!("unknown dataset element {element:?}"),
    })?;

    let mut path = FieldPath::data();
    if let Some(fields) = entry["field"].as_array() {
        for field in fields {
            if let Some(name) = field.as_str() {
                path = path.child(name);
            }
        }
    }
    Ok(column.view(path))
}

/// Materialize plot points for each configured series: null values are
/// dropped, oversized series are strided down to the downsample limit.
pub fn preprocess_linechart(
    ctx: &DatasetContext,
    vis: &Visualization,
) -> Result<Value, PreprocessError> {
    let empty = Vec::new();
    let series = vis.config["series"].as_array().unwrap_or(&empty);

    let mut out = Vec::with_capacity(series.len());
    for entry in series {
        let view = config_series_view(ctx, entry, &vis.key)?;
        let values = view.values();
        let mut points = Vec::new();
        for (point, value) in view.points().iter().zip(values.iter()) {
            if let Some(n) = lq_types::as_number(value) {
                points.push(json!([point.t, n]));
            }
        }
        if points.len() > DOWNSAMPLE_LIMIT {
            let stride = points.len().div_ceil(DOWNSAMPLE_LIMIT);
            points = points.into_iter().step_by(stride).collect();
        }
        out.push(json!({
            "label": entry["label"],
            "points": points,
        }));
    }
    Ok(json!({ "series": out }))
}

/// Bucket each configured element into equal-width bins over its range.
pub fn preprocess_histogram(
    ctx: &DatasetContext,
    vis: &Visualization,
) -> Result<Value, PreprocessError> {
    let empty = Vec::new();
    let charts = vis.config["charts"].as_array().unwrap_or(&empty);

    let mut out = Vec::with_capacity(charts.len());
    for entry in charts {
        let view = config_series_view(ctx, entry, &vis.key)?;
        let facts = view.numeric_facts().ok_or_else(|| PreprocessError::BadConfig {
            key: vis.key.clone(),
            message: "histogram requires a numeric series".to_owned(),
        })?;
        let bins = entry["bins"].as_u64().unwrap_or(10).max(1) as usize;
        let mut counts = vec![0u64; bins];
        for point in view.points().iter() {
            if let Some(n) = facts.number_of(point) {
                let slot = (facts.normalize(n) * bins as f64) as usize;
                counts[slot.min(bins - 1)] += 1;
            }
        }
        let edges = (0..=bins)
            .map(|i| facts.min + (facts.max - facts.min) * i as f64 / bins as f64)
            .collect::<Vec<_>>();
        out.push(json!({
            "label": entry["label"],
            "edges": edges,
            "counts": counts,
        }));
    }
    Ok(json!({ "charts": out }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use lq_context::{AnalysisRegistry, DatasetContext};
    use lq_types::DataPoint;
    use serde_json::json;

    use super::{histogram, linechart, preprocess_histogram, preprocess_linechart, table};
    use crate::VisualizationSet;

    fn numeric_context(len: usize) -> DatasetContext {
        let mut dataset = BTreeMap::new();
        dataset.insert(
            "y".to_owned(),
            (0..len)
                .map(|i| DataPoint::new(i as f64, json!(i)))
                .collect(),
        );
        DatasetContext::new(
            json!({"y": {"timeseries": "abc"}}),
            dataset,
            BTreeMap::new(),
            json!({}),
            Arc::new(AnalysisRegistry::with_builtins()),
        )
        .expect("context")
    }

    #[test]
    fn linechart_selects_numeric_series() {
        let ctx = numeric_context(10);
        let mut set = VisualizationSet::new();
        linechart(&ctx, &mut set).expect("analyze");
        let vis = set.get("linechart").expect("selected");
        assert_eq!(vis.weight, 9.0);
        assert_eq!(vis.config["series"][0]["element"], json!("y"));
    }

    #[test]
    fn linechart_expands_object_series_through_useful_keys() {
        let mut dataset = BTreeMap::new();
        dataset.insert(
            "y".to_owned(),
            (0..10)
                .map(|i| DataPoint::new(i as f64, json!({"steps": i, "note": "walk"})))
                .collect(),
        );
        let ctx = DatasetContext::new(
            json!({"y": {"timeseries": "abc"}}),
            dataset,
            BTreeMap::new(),
            json!({}),
            Arc::new(AnalysisRegistry::with_builtins()),
        )
        .expect("context");

        let mut set = VisualizationSet::new();
        linechart(&ctx, &mut set).expect("analyze");
        let vis = set.get("linechart").expect("selected");
        assert_eq!(vis.config["series"], json!([{
            "label": "steps",
            "element": "y",
            "field": ["steps"],
        }]));
    }

    #[test]
    fn histogram_needs_enough_points() {
        let small = numeric_context(10);
        let mut set = VisualizationSet::new();
        histogram(&small, &mut set).expect("analyze");
        assert!(set.get("histogram").is_none());

        let large = numeric_context(100);
        let mut set = VisualizationSet::new();
        histogram(&large, &mut set).expect("analyze");
        let vis = set.get("histogram").expect("selected");
        assert_eq!(vis.config["charts"][0]["bins"], json!(10));
    }

    #[test]
    fn table_lists_columns() {
        let ctx = numeric_context(3);
        let mut set = VisualizationSet::new();
        table(&ctx, &mut set).expect("analyze");
        let vis = set.get("table").expect("selected");
        assert_eq!(vis.config["columns"][0]["count"], json!(3));
    }

    #[test]
    fn linechart_preprocessor_materializes_points() {
        let ctx = numeric_context(5);
        let mut set = VisualizationSet::new();
        linechart(&ctx, &mut set).expect("analyze");
        let vis = set.get("linechart").expect("selected").clone();

        let data = preprocess_linechart(&ctx, &vis).expect("preprocess");
        assert_eq!(data["series"][0]["points"][2], json!([2.0, 2.0]));
    }

    #[test]
    fn histogram_preprocessor_counts_all_points() {
        let ctx = numeric_context(100);
        let mut set = VisualizationSet::new();
        histogram(&ctx, &mut set).expect("analyze");
        let vis = set.get("histogram").expect("selected").clone();

        let data = preprocess_histogram(&ctx, &vis).expect("preprocess");
        let counts = data["charts"][0]["counts"].as_array().expect("counts");
        let total: u64 = counts.iter().map(|c| c.as_u64().unwrap_or(0)).sum();
        assert_eq!(total, 100);
        assert_eq!(counts.len(), 10);
    }
}
