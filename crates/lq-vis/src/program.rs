use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lq_context::DatasetContext;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{Visualization, VisualizationSet};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("failed to compile visualization {name:?}: {message}")]
    Invalid { name: String, message: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProgramError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("program {name:?} failed: {message}")]
    Run { name: String, message: String },
}

/// A user-supplied visualization as it arrives in settings: a name, an
/// enabled flag, and the program source text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserVisualization {
    pub name: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    pub code: String,
}

fn enabled_default() -> bool {
    true
}

/// Predicates gating a program against a context.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WhenSpec {
    #[serde(default)]
    min_elements: Option<usize>,
    #[serde(default)]
    max_elements: Option<usize>,
    #[serde(default)]
    require_numeric: bool,
    #[serde(default)]
    require_key: Option<String>,
}

impl WhenSpec {
    fn matches(&self, ctx: &DatasetContext) -> bool {
        let count = ctx.keys().len();
        if self.min_elements.is_some_and(|min| count < min) {
            return false;
        }
        if self.max_elements.is_some_and(|max| count > max) {
            return false;
        }
        if let Some(key) = &self.require_key
            && ctx.column(key).is_none()
        {
            return false;
        }
        if self.require_numeric
            && !ctx
                .columns()
                .all(|column| column.d().numeric_facts().is_some())
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct EmitSpec {
    key: String,
    #[serde(rename = "type")]
    vis_type: String,
    title: String,
    #[serde(default)]
    weight: f64,
    config: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramSource {
    #[serde(default)]
    when: WhenSpec,
    emit: Vec<EmitSpec>,
}

/// A compiled user visualization. A source that failed to compile becomes a
/// poisoned stand-in whose error resurfaces deterministically at run time,
/// turning a load-time failure into a normal runtime error path.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledVisualization {
    name: String,
    kind: ProgramKind,
}

#[derive(Debug, Clone, PartialEq)]
enum ProgramKind {
    Program(ProgramSource),
    Poisoned(CompileError),
}

impl CompiledVisualization {
    fn compile(name: &str, code: &str) -> Self {
        let kind = match serde_json::from_str::<ProgramSource>(code) {
            Ok(source) => ProgramKind::Program(source),
            Err(err) => ProgramKind::Poisoned(CompileError::Invalid {
                name: name.to_owned(),
                message: err.to_string(),
            }),
        };
        Self {
            name: name.to_owned(),
            kind,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        matches!(self.kind, ProgramKind::Poisoned(_))
    }

    pub fn run(
        &self,
        ctx: &DatasetContext,
        set: &mut VisualizationSet,
    ) -> Result<(), ProgramError> {
        match &self.kind {
            ProgramKind::Poisoned(error) => Err(error.clone().into()),
            ProgramKind::Program(source) => {
                if !source.when.matches(ctx) {
                    return Ok(());
                }
                debug!(program = %self.name, "user visualization matched");
                for emit in &source.emit {
                    set.insert(Visualization {
                        key: emit.key.clone(),
                        vis_type: emit.vis_type.clone(),
                        title: emit.title.clone(),
                        weight: emit.weight,
                        config: emit.config.clone(),
                        data: None,
                    });
                }
                Ok(())
            }
        }
    }
}

/// Compiled programs keyed by their exact source text. A channel reconnect
/// re-imports the same sources; they must not recompile.
#[derive(Default)]
pub struct ProgramCache {
    entries: Mutex<HashMap<String, Arc<CompiledVisualization>>>,
}

impl ProgramCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile the enabled user visualizations, caching by source text when
    /// `cache` is set (per-subscription overrides skip the shared cache).
    pub fn prepare(
        &self,
        sources: &[UserVisualization],
        cache: bool,
    ) -> Vec<Arc<CompiledVisualization>> {
        sources
            .iter()
            .filter(|source| source.enabled)
            .map(|source| {
                if !cache {
                    return Arc::new(CompiledVisualization::compile(&source.name, &source.code));
                }
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(hit) = entries.get(&source.code) {
                    return Arc::clone(hit);
                }
                debug!(program = %source.name, "compiling user visualization");
                let compiled =
                    Arc::new(CompiledVisualization::compile(&source.name, &source.code));
                entries.insert(source.code.clone(), Arc::clone(&compiled));
                compiled
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use lq_context::{AnalysisRegistry, DatasetContext};
    use lq_types::DataPoint;
    use serde_json::json;

    use super::{ProgramCache, UserVisualization};
    use crate::VisualizationSet;

    fn context() -> DatasetContext {
        let mut dataset = BTreeMap::new();
        dataset.insert(
            "y".to_owned(),
            vec![DataPoint::new(1.0, json!(5)), DataPoint::new(2.0, json!(7))],
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

    fn program(code: &str) -> UserVisualization {
        UserVisualization {
            name: "custom".to_owned(),
            enabled: true,
            code: code.to_owned(),
        }
    }

    #[test]
    fn matching_programs_emit_descriptors() {
        let cache = ProgramCache::new();
        let compiled = cache.prepare(
            &[program(
                r#"{
                    "when": {"max_elements": 2, "require_numeric": true},
                    "emit": [{
                        "key": "custom",
                        "type": "linechart",
                        "title": "Custom",
                        "weight": 5,
                        "config": {"points": "${{data.y.values}}"}
                    }]
                }"#,
            )],
            true,
        );

        let ctx = context();
        let mut set = VisualizationSet::new();
        compiled[0].run(&ctx, &mut set).expect("run");
        let vis = set.get("custom").expect("descriptor");
        assert_eq!(vis.title, "Custom");
        assert_eq!(vis.weight, 5.0);
    }

    #[test]
    fn non_matching_programs_change_nothing() {
        let cache = ProgramCache::new();
        let compiled = cache.prepare(
            &[program(r#"{"when": {"min_elements": 3}, "emit": []}"#)],
            true,
        );
        let ctx = context();
        let mut set = VisualizationSet::new();
        compiled[0].run(&ctx, &mut set).expect("run");
        assert!(set.is_empty());
    }

    #[test]
    fn broken_source_becomes_a_poisoned_standin() {
        let cache = ProgramCache::new();
        let compiled = cache.prepare(&[program("this is not json")], true);
        assert!(compiled[0].is_poisoned());

        let ctx = context();
        let mut set = VisualizationSet::new();
        let err = compiled[0].run(&ctx, &mut set).expect_err("poisoned");
        assert!(err.to_string().contains("custom"));
    }

    #[test]
    fn identical_sources_compile_once() {
        let cache = ProgramCache::new();
        let code = r#"{"emit": []}"#;
        let first = cache.prepare(&[program(code)], true);
        let second = cache.prepare(&[program(code)], true);
        assert!(Arc::ptr_eq(&first[0], &second[0]));

        let uncached = cache.prepare(&[program(code)], false);
        assert!(!Arc::ptr_eq(&first[0], &uncached[0]));
    }

    #[test]
    fn disabled_programs_are_skipped() {
        let cache = ProgramCache::new();
        let mut source = program(r#"{"emit": []}"#);
        source.enabled = false;
        assert!(cache.prepare(&[source], true).is_empty());
    }
}
