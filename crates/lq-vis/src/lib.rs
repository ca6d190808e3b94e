#![forbid(unsafe_code)]

mod builtins;
mod program;
mod template;

pub use builtins::{histogram, linechart, preprocess_histogram, preprocess_linechart, table};
pub use program::{CompileError, CompiledVisualization, ProgramCache, ProgramError, UserVisualization};
pub use template::{CompiledTemplate, TemplateCache, TemplateError, TemplateExpr};

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use lq_context::{AnalysisError, DatasetContext};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

/// A named visualization descriptor. `config` is declarative; `data` is
/// attached by the preprocessing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visualization {
    pub key: String,
    #[serde(rename = "type")]
    pub vis_type: String,
    pub title: String,
    pub weight: f64,
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Accumulator passed through the selection stage: descriptors by key,
/// later emitted in weight order (lowest first, so negative weights lead).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisualizationSet {
    entries: BTreeMap<String, Visualization>,
}

impl VisualizationSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vis: Visualization) {
        self.entries.insert(vis.key.clone(), vis);
    }

    pub fn remove(&mut self, key: &str) -> Option<Visualization> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Visualization> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn into_sorted(self) -> Vec<Visualization> {
        let mut out = self.entries.into_values().collect::<Vec<_>>();
        out.sort_by(|a, b| {
            a.weight
                .total_cmp(&b.weight)
                .then_with(|| a.key.cmp(&b.key))
        });
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerSource {
    Plugin,
    User,
}

/// One isolated analyzer failure, reported through the synthetic errors
/// visualization instead of aborting the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerFailure {
    pub source: AnalyzerSource,
    pub name: String,
    pub error: String,
}

pub type BuiltinAnalyzerFn =
    fn(&DatasetContext, &mut VisualizationSet) -> Result<(), AnalysisError>;

/// An analyzer is either a built-in function reference or a compiled
/// user-supplied program.
#[derive(Clone)]
pub enum Analyzer {
    Builtin {
        name: &'static str,
        f: BuiltinAnalyzerFn,
    },
    External(Arc<CompiledVisualization>),
}

impl Analyzer {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin { name, .. } => name,
            Self::External(program) => program.name(),
        }
    }

    #[must_use]
    pub fn source(&self) -> AnalyzerSource {
        match self {
            Self::Builtin { .. } => AnalyzerSource::Plugin,
            Self::External(_) => AnalyzerSource::User,
        }
    }

    fn run(&self, ctx: &DatasetContext, set: &mut VisualizationSet) -> Result<(), String> {
        let outcome = catch_unwind(AssertUnwindSafe(|| match self {
            Self::Builtin { f, .. } => f(ctx, set).map_err(|e| e.to_string()),
            Self::External(program) => program.run(ctx, set).map_err(|e| e.to_string()),
        }));
        match outcome {
            Ok(result) => result,
            Err(panic) => Err(panic_message(&panic)),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "analyzer panicked".to_owned()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PreprocessError {
    #[error("visualization {key:?} has an invalid config: {message}")]
    BadConfig { key: String, message: String },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

pub type PreprocessorFn =
    Arc<dyn Fn(&DatasetContext, &Visualization) -> Result<Value, PreprocessError> + Send + Sync>;

/// Type-keyed preprocessors, constructed explicitly and passed into the
/// pipeline rather than registered globally.
#[derive(Clone, Default)]
pub struct PreprocessorRegistry {
    map: HashMap<String, PreprocessorFn>,
}

impl PreprocessorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("linechart", preprocess_linechart);
        registry.register("histogram", preprocess_histogram);
        registry
    }

    pub fn register(
        &mut self,
        vis_type: impl Into<String>,
        f: impl Fn(&DatasetContext, &Visualization) -> Result<Value, PreprocessError>
        + Send
        + Sync
        + 'static,
    ) {
        self.map.insert(vis_type.into(), Arc::new(f));
    }

    #[must_use]
    pub fn get(&self, vis_type: &str) -> Option<&PreprocessorFn> {
        self.map.get(vis_type)
    }
}

const ERRORS_KEY: &str = "errors";
const ERRORS_WEIGHT: f64 = -100.0;

/// The full context-to-renderable pipeline: analyzer selection with
/// per-contributor isolation, then per-descriptor preprocessing.
pub struct VisualizationPipeline {
    builtins: Vec<Analyzer>,
    user: Mutex<Vec<Arc<CompiledVisualization>>>,
    preprocessors: PreprocessorRegistry,
    templates: TemplateCache,
    programs: ProgramCache,
}

impl Default for VisualizationPipeline {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl VisualizationPipeline {
    /// Empty pipeline: no analyzers, no preprocessors.
    #[must_use]
    pub fn new() -> Self {
        Self {
            builtins: Vec::new(),
            user: Mutex::new(Vec::new()),
            preprocessors: PreprocessorRegistry::new(),
            templates: TemplateCache::new(),
            programs: ProgramCache::new(),
        }
    }

    /// The standard set: linechart/histogram/table analyzers plus their
    /// preprocessors.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut pipeline = Self::new();
        pipeline.preprocessors = PreprocessorRegistry::with_builtins();
        pipeline.add_builtin("linechart", linechart);
        pipeline.add_builtin("histogram", histogram);
        pipeline.add_builtin("table", table);
        pipeline
    }

    pub fn add_builtin(&mut self, name: &'static str, f: BuiltinAnalyzerFn) {
        self.builtins.push(Analyzer::Builtin { name, f });
    }

    pub fn add_preprocessor(
        &mut self,
        vis_type: impl Into<String>,
        f: impl Fn(&DatasetContext, &Visualization) -> Result<Value, PreprocessError>
        + Send
        + Sync
        + 'static,
    ) {
        self.preprocessors.register(vis_type, f);
    }

    /// Recompile the user visualization set (cached by source text).
    pub fn set_user_visualizations(&self, sources: &[UserVisualization]) {
        let compiled = self.programs.prepare(sources, true);
        *self.user.lock().unwrap_or_else(|e| e.into_inner()) = compiled;
    }

    /// Compile a per-subscription override set, bypassing the shared cache.
    #[must_use]
    pub fn prepare_override(
        &self,
        sources: &[UserVisualization],
    ) -> Vec<Arc<CompiledVisualization>> {
        self.programs.prepare(sources, false)
    }

    /// Run selection and preprocessing for one context.
    #[must_use]
    pub fn run(&self, ctx: &DatasetContext) -> Vec<Visualization> {
        self.run_with_overrides(ctx, None)
    }

    #[must_use]
    pub fn run_with_overrides(
        &self,
        ctx: &DatasetContext,
        overrides: Option<&[Arc<CompiledVisualization>]>,
    ) -> Vec<Visualization> {
        let set = self.select(ctx, overrides);
        self.preprocess(ctx, set)
    }

    fn select(
        &self,
        ctx: &DatasetContext,
        overrides: Option<&[Arc<CompiledVisualization>]>,
    ) -> VisualizationSet {
        let shared;
        let user: &[Arc<CompiledVisualization>] = match overrides {
            Some(programs) => programs,
            None => {
                shared = self
                    .user
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                &shared
            }
        };

        let mut set = VisualizationSet::new();
        let mut failures = Vec::new();

        let externals = user.iter().cloned().map(Analyzer::External);
        for analyzer in self.builtins.iter().cloned().chain(externals) {
            if let Err(error) = analyzer.run(ctx, &mut set) {
                warn!(analyzer = %analyzer.name(), %error, "analyzer failed");
                failures.push(AnalyzerFailure {
                    source: analyzer.source(),
                    name: analyzer.name().to_owned(),
                    error,
                });
            }
        }

        if !failures.is_empty() {
            set.insert(Visualization {
                key: ERRORS_KEY.to_owned(),
                vis_type: "visualization_errors".to_owned(),
                title: "Visualization Errors".to_owned(),
                weight: ERRORS_WEIGHT,
                config: json!({ "errors": failures }),
                data: None,
            });
        }
        set
    }

    fn preprocess(&self, ctx: &DatasetContext, set: VisualizationSet) -> Vec<Visualization> {
        let mut out = set.into_sorted();
        for vis in &mut out {
            let result = match self.preprocessors.get(&vis.vis_type) {
                Some(f) => f(ctx, vis),
                // No registered preprocessor: the config is a declarative
                // template over the context.
                None => self
                    .templates
                    .compile(&vis.config)
                    .and_then(|template| template.evaluate(ctx))
                    .map_err(PreprocessError::from),
            };
            match result {
                Ok(data) => vis.data = Some(data),
                Err(error) => {
                    warn!(key = %vis.key, %error, "preprocessing failed");
                    *vis = failed_visualization(vis, &error);
                }
            }
        }
        out
    }
}

/// A preprocessing failure collapses one descriptor into an `error`-typed
/// one carrying the original config for diagnostics.
fn failed_visualization(vis: &Visualization, error: &PreprocessError) -> Visualization {
    Visualization {
        key: vis.key.clone(),
        vis_type: "error".to_owned(),
        title: vis.title.clone(),
        weight: vis.weight,
        config: json!({
            "error": error.to_string(),
            "config": vis.config,
        }),
        data: None,
    }
}
