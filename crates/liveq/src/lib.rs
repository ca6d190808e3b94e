#![forbid(unsafe_code)]

//! Facade crate re-exporting the liveq public surface.
//!
//! The engine turns declarative time-series dataset queries into live,
//! incrementally-updated visualization data: queries are canonicalized and
//! deduplicated, fetches are coalesced, and every subscriber of a query
//! receives contexts built over a lazily-memoized analysis layer.

pub use lq_accessor::{
    CategoricalFacts, CategoryKey, FactsCache, Field, FieldPath, KeyFacts, LocationFacts,
    NumericFacts, categorical_facts, key_facts, location_facts, numeric_facts,
};
pub use lq_context::{
    AnalysisError, AnalysisRegistry, ColumnView, ContextError, DataColumn, DatasetContext,
    QueryInfo,
};
pub use lq_engine::{
    ChangeEvent, ChangeKind, ChannelMessage, DatasetHandler, DatasetResponse, EngineConfig,
    EngineError, InMemoryBackend, SeriesResolver, Subscriber, Transport, TransportError,
    spawn_channel_adapter,
};
pub use lq_query::{
    DatasetQuery, QueryElement, QueryError, canonical_json, canonical_key, clean,
    referenced_series,
};
pub use lq_types::{DataPoint, SeriesId, SeriesMetadata, ValueError, epoch_to_datetime};
pub use lq_vis::{
    Analyzer, AnalyzerFailure, AnalyzerSource, CompileError, CompiledVisualization,
    PreprocessError, PreprocessorRegistry, ProgramCache, ProgramError, TemplateCache,
    TemplateError, TemplateExpr, UserVisualization, Visualization, VisualizationPipeline,
    VisualizationSet,
};
