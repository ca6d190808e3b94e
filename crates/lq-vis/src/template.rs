use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lq_context::{AnalysisError, ColumnView, DatasetContext};
use lq_query::canonical_json;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemplateError {
    #[error("template expression parse error: {0}")]
    Parse(String),
    #[error("template reference cannot be resolved: {0}")]
    Resolve(String),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// One step of a template expression: a named segment, optionally a call.
#[derive(Debug, Clone, PartialEq)]
struct Segment {
    name: String,
    args: Option<Vec<Value>>,
}

/// A parsed `${{ ... }}` expression: dotted segments rooted at one of the
/// context bindings (`data`, `timeseries`, `settings`, `keys`).
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateExpr {
    segments: Vec<Segment>,
}

impl TemplateExpr {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(TemplateError::Parse("empty expression".to_owned()));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            let part = part.trim();
            if part.is_empty() {
                return Err(TemplateError::Parse(format!(
                    "empty segment in {trimmed:?}"
                )));
            }
            if let Some(open) = part.find('(') {
                let Some(stripped) = part.strip_suffix(')') else {
                    return Err(TemplateError::Parse(format!(
                        "unterminated call in {part:?}"
                    )));
                };
                let name = &part[..open];
                let body = &stripped[open + 1..];
                segments.push(Segment {
                    name: name.to_owned(),
                    args: Some(parse_args(body)?),
                });
            } else {
                segments.push(Segment {
                    name: part.to_owned(),
                    args: None,
                });
            }
        }
        Ok(Self { segments })
    }

    pub fn evaluate(&self, ctx: &DatasetContext) -> Result<Value, TemplateError> {
        let mut segments = self.segments.iter();
        let root = segments.next().ok_or_else(|| {
            TemplateError::Parse("expression has no root binding".to_owned())
        })?;

        let mut cursor = match root.name.as_str() {
            "data" => Cursor::Dataset,
            "timeseries" => Cursor::SeriesMap,
            "settings" => Cursor::Value(ctx.settings().as_ref().clone()),
            "keys" => Cursor::Value(Value::from(
                ctx.keys().iter().cloned().collect::<Vec<_>>(),
            )),
            other => {
                return Err(TemplateError::Resolve(format!(
                    "unknown root binding {other:?}"
                )));
            }
        };

        for segment in segments {
            cursor = cursor.step(ctx, segment)?;
        }
        cursor.finish()
    }
}

fn parse_args(body: &str) -> Result<Vec<Value>, TemplateError> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(Vec::new());
    }
    body.split(',')
        .map(|arg| {
            let arg = arg.trim();
            serde_json::from_str(arg)
                .map_err(|_| TemplateError::Parse(format!("bad call argument {arg:?}")))
        })
        .collect()
}

enum Cursor {
    Dataset,
    SeriesMap,
    Column(ColumnView),
    Value(Value),
}

impl Cursor {
    fn step(self, ctx: &DatasetContext, segment: &Segment) -> Result<Cursor, TemplateError> {
        match self {
            Cursor::Dataset => {
                let column = ctx.column(&segment.name).ok_or_else(|| {
                    TemplateError::Resolve(format!("unknown dataset element {:?}", segment.name))
                })?;
                Ok(Cursor::Column(column.d()))
            }
            Cursor::SeriesMap => {
                let series = ctx.series(&segment.name.as_str().into()).ok_or_else(|| {
                    TemplateError::Resolve(format!("unknown series {:?}", segment.name))
                })?;
                let value = serde_json::to_value(series)
                    .map_err(|e| TemplateError::Resolve(e.to_string()))?;
                Ok(Cursor::Value(value))
            }
            Cursor::Column(view) => step_column(view, segment),
            Cursor::Value(value) => {
                if segment.args.is_some() {
                    return Err(TemplateError::Resolve(format!(
                        "{:?} is not callable on a plain value",
                        segment.name
                    )));
                }
                let next = value.get(&segment.name).cloned().ok_or_else(|| {
                    TemplateError::Resolve(format!("missing field {:?}", segment.name))
                })?;
                Ok(Cursor::Value(next))
            }
        }
    }

    fn finish(self) -> Result<Value, TemplateError> {
        match self {
            Cursor::Value(value) => Ok(value),
            Cursor::Column(view) => Ok(Value::Array(view.values().as_ref().clone())),
            Cursor::Dataset | Cursor::SeriesMap => Err(TemplateError::Resolve(
                "expression stops at a container binding".to_owned(),
            )),
        }
    }
}

fn step_column(view: ColumnView, segment: &Segment) -> Result<Cursor, TemplateError> {
    if let Some(args) = &segment.args {
        let out = view.call(&segment.name, args)?;
        return Ok(Cursor::Value(out));
    }
    match segment.name.as_str() {
        "values" => Ok(Cursor::Value(Value::Array(view.values().as_ref().clone()))),
        "length" => Ok(Cursor::Value(Value::from(view.len()))),
        "t" => {
            let times = view
                .points()
                .iter()
                .map(|point| Value::from(point.t))
                .collect::<Vec<_>>();
            Ok(Cursor::Value(Value::Array(times)))
        }
        other => Ok(Cursor::Column(view.field(other))),
    }
}

/// A config value with its `${{ ... }}` markers pre-parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledTemplate {
    Literal(Value),
    Expr(TemplateExpr),
    Splice(Vec<SplicePart>),
    Array(Vec<CompiledTemplate>),
    Object(Vec<(String, CompiledTemplate)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SplicePart {
    Text(String),
    Expr(TemplateExpr),
}

impl CompiledTemplate {
    pub fn compile(config: &Value) -> Result<Self, TemplateError> {
        match config {
            Value::String(text) => compile_string(text),
            Value::Array(items) => Ok(Self::Array(
                items.iter().map(Self::compile).collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => Ok(Self::Object(
                map.iter()
                    .map(|(key, inner)| Ok((key.clone(), Self::compile(inner)?)))
                    .collect::<Result<_, TemplateError>>()?,
            )),
            other => Ok(Self::Literal(other.clone())),
        }
    }

    pub fn evaluate(&self, ctx: &DatasetContext) -> Result<Value, TemplateError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Expr(expr) => expr.evaluate(ctx),
            Self::Splice(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        SplicePart::Text(text) => out.push_str(text),
                        SplicePart::Expr(expr) => {
                            let value = expr.evaluate(ctx)?;
                            match value {
                                Value::String(s) => out.push_str(&s),
                                other => out.push_str(&other.to_string()),
                            }
                        }
                    }
                }
                Ok(Value::from(out))
            }
            Self::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| item.evaluate(ctx))
                    .collect::<Result<_, _>>()?,
            )),
            Self::Object(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, inner) in entries {
                    map.insert(key.clone(), inner.evaluate(ctx)?);
                }
                Ok(Value::Object(map))
            }
        }
    }
}

const MARKER_OPEN: &str = "${{";
const MARKER_CLOSE: &str = "}}";

fn compile_string(text: &str) -> Result<CompiledTemplate, TemplateError> {
    if !text.contains(MARKER_OPEN) {
        return Ok(CompiledTemplate::Literal(Value::from(text)));
    }

    // Whole-string markers evaluate to the raw value; embedded markers
    // splice stringified results.
    if let Some(inner) = text.strip_prefix(MARKER_OPEN).and_then(|rest| rest.strip_suffix(MARKER_CLOSE))
        && !inner.contains(MARKER_CLOSE)
    {
        return Ok(CompiledTemplate::Expr(TemplateExpr::parse(inner)?));
    }

    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(MARKER_OPEN) {
        if open > 0 {
            parts.push(SplicePart::Text(rest[..open].to_owned()));
        }
        let after = &rest[open + MARKER_OPEN.len()..];
        let close = after.find(MARKER_CLOSE).ok_or_else(|| {
            TemplateError::Parse(format!("unterminated template marker in {text:?}"))
        })?;
        parts.push(SplicePart::Expr(TemplateExpr::parse(&after[..close])?));
        rest = &after[close + MARKER_CLOSE.len()..];
    }
    if !rest.is_empty() {
        parts.push(SplicePart::Text(rest.to_owned()));
    }
    Ok(CompiledTemplate::Splice(parts))
}

/// Compiled templates keyed by the template's canonical JSON, so repeated
/// identical configs do not recompile.
#[derive(Default)]
pub struct TemplateCache {
    entries: Mutex<HashMap<String, Arc<CompiledTemplate>>>,
}

impl TemplateCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, config: &Value) -> Result<Arc<CompiledTemplate>, TemplateError> {
        let key = canonical_json(config)
            .map_err(|e| TemplateError::Parse(e.to_string()))?;
        if let Some(hit) = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(Arc::clone(hit));
        }
        let compiled = Arc::new(CompiledTemplate::compile(config)?);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }
}
