//! # Rowflow - record-oriented streaming pipelines
//!
//! Rowflow moves rows of named, typed values through chains of lazy stages:
//! sources, mutators, key-based matching against a right-hand side, and
//! group-by aggregation. Every stage of a run shares one
//! [`ExecutionContext`] that hands out row UIDs, tracks row ownership,
//! carries the cancellation flag and collects fatal errors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Source    │◀────│  Mutators   │◀────│  Matching / │◀────│   Writer /  │
//! │ (CSV, chan) │     │ (filter...) │     │ Aggregation │     │  consumer   │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                              pull ◀── rows flow right
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rowflow::{collect_rows, CsvOptions, CsvSource, EngineConfig, ExecutionContext};
//! use rowflow::{GroupBy, Sum, UnorderedAggregation};
//!
//! let ctx = ExecutionContext::new(EngineConfig::default());
//! let source = CsvSource::open(&ctx, "sales.csv", CsvOptions::default())?;
//! let transform = GroupBy::new(&["city"]).with(Sum::new("amount"));
//! let mut agg = UnorderedAggregation::new(&ctx, source, &["city"], transform);
//! for row in collect_rows(&ctx, &mut agg)? {
//!     println!("{}", row.to_json());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Hierarchical error types
//! - [`config`] - Engine settings (defaults, JSON, environment)
//! - [`models`] - Values and rows
//! - [`context`] - Execution context, sinks and IO commands
//! - [`key`] - Group keys and key selectors
//! - [`sequence`] - The pull protocol, sources, basic mutators and writers
//! - [`matching`] - Expand, Join and KeyTest, eager or deferred
//! - [`aggregate`] - Unordered, ordered and continuous aggregation
//! - [`parser`] - CSV source with auto-detection

// Core modules
pub mod config;
pub mod error;
pub mod models;

// Run state
pub mod context;

// Pipeline
pub mod key;
pub mod sequence;

// Operations
pub mod aggregate;
pub mod matching;

// Parsing
pub mod parser;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    AggregationError, BoxError, ConfigError, CsvError, OperationError, PipelineError, PipelineFailure,
    PipelineResult, SinkError, ValidationError, ValueError,
};

// =============================================================================
// Re-exports - Configuration
// =============================================================================

pub use config::EngineConfig;

// =============================================================================
// Re-exports - Models
// =============================================================================

pub use models::{FromValue, Row, RowError, StageRef, Value, ValueKind};

// =============================================================================
// Re-exports - Context
// =============================================================================

pub use context::{ExecutionContext, IoCommand, IoCommandKind, IoCommandStats, OwnershipChange, Sink};

// =============================================================================
// Re-exports - Sequences
// =============================================================================

pub use key::{group_key, KeySelector};
pub use sequence::{
    collect_rows, record, run_to_end, shared_writer, BatchedWriter, BoxedSequence, ChannelSource,
    ConvertColumns, Evaluate, Filter, JsonLinesWriter, MemoryWriter, PromoteRowErrors, Record, RowSource,
    RowWriter, Sequence, SequenceExt, SharedWriter, StageCore, Take, WriterOptions,
};

// =============================================================================
// Re-exports - Matching
// =============================================================================

pub use matching::{
    ColumnCopy, CustomExpand, DeferredMatch, DeferredOptions, DeferredStats, LookupMatch, LookupMode,
    LookupTable, MatchAction, MatchKind, MatchRules, NoMatchAction, RightProvider,
};

// =============================================================================
// Re-exports - Aggregation
// =============================================================================

pub use aggregate::{
    Aggregator, Avg, ContinuousAggregation, ContinuousGroupBy, ContinuousOperation, Count,
    FnGroupTransform, GroupBy, GroupTransform, LinearRegression, Max, Min, OrderedAggregation, Sum,
    UnorderedAggregation,
};

// =============================================================================
// Re-exports - CSV
// =============================================================================

pub use parser::{CsvOptions, CsvSource};
