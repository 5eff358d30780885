//! Error types for the rowflow pipeline engine.
//!
//! This module defines a hierarchy of error types, one per concern:
//!
//! - [`ValueError`] - Typed getter mismatches (programming errors)
//! - [`ValidationError`] - Bad stage configuration, detected before rows flow
//! - [`OperationError`] - Failures inside key selectors, handlers and right-hand sources
//! - [`AggregationError`] - Failures inside group transforms and aggregators
//! - [`SinkError`] - Row writer failures
//! - [`CsvError`] - CSV source errors
//! - [`ConfigError`] - Engine configuration errors
//! - [`PipelineError`] - Top-level wrapper registered with the execution context
//!
//! Per-cell conversion failures are *not* errors here: they travel as
//! [`crate::models::RowError`] values inside rows.
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by caller-supplied closures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Value Errors
// =============================================================================

/// Errors raised by typed column getters.
#[derive(Debug, Error)]
pub enum ValueError {
    /// The column holds a value of another kind.
    #[error("Column '{column}' holds {actual}, cannot read it as {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        actual: &'static str,
    },
}

// =============================================================================
// Validation Errors
// =============================================================================

/// Stage configuration errors. Always fatal at start.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required parameter was not supplied.
    #[error("{stage}: missing required parameter '{parameter}'")]
    MissingParameter {
        stage: String,
        parameter: &'static str,
    },

    /// A parameter has an unusable value.
    #[error("{stage}: invalid parameter '{parameter}': {message}")]
    InvalidParameter {
        stage: String,
        parameter: &'static str,
        message: String,
    },

    /// Match and no-match actions make the stage meaningless.
    #[error("{stage}: {message}")]
    ContradictoryActions { stage: String, message: String },
}

// =============================================================================
// Operation Errors
// =============================================================================

/// Errors raised while a stage processes a row. Pipeline-fatal.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The key selector returned an error.
    #[error("{stage}: key selector failed: {source}\n{row}")]
    KeySelector {
        stage: String,
        row: String,
        source: BoxError,
    },

    /// A custom match or no-match handler returned an error.
    #[error("{stage}: handler failed: {source}\n{row}")]
    Handler {
        stage: String,
        row: String,
        source: BoxError,
    },

    /// No-match action is `Throw` and the row had no match.
    #[error("{stage}: no match found for row\n{row}")]
    NoMatch { stage: String, row: String },

    /// Match action is `Throw` and the row had a match.
    #[error("{stage}: unexpected match found for row\n{row}")]
    UnexpectedMatch { stage: String, row: String },

    /// The right-hand source could not be built or evaluated.
    #[error("{stage}: right-hand source failed: {source}")]
    RightSource { stage: String, source: BoxError },

    /// A row carried a `RowError` cell into a stage that refuses them.
    #[error("{stage}: column '{column}' holds an error: {message}\n{row}")]
    RowErrorPromoted {
        stage: String,
        column: String,
        message: String,
        row: String,
    },
}

// =============================================================================
// Aggregation Errors
// =============================================================================

/// Errors raised while aggregating a group. Pipeline-fatal.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// A group transform failed; carries a dump of the group's rows.
    #[error("{operation} failed for group '{key}': {message}\n{rows}")]
    GroupTransform {
        operation: String,
        key: String,
        message: String,
        rows: String,
    },

    /// An aggregator met a value it cannot fold.
    #[error("{aggregator}: column '{column}' holds non-numeric value {value}")]
    NonNumeric {
        aggregator: String,
        column: String,
        value: String,
    },

    /// Min / max met two values that have no order.
    #[error("{aggregator}: column '{column}' holds {value}, which cannot be ordered against the others")]
    Incomparable {
        aggregator: String,
        column: String,
        value: String,
    },
}

// =============================================================================
// Sink Errors
// =============================================================================

/// Errors from row writers.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The destination rejected the batch.
    #[error("Failed to write to {location}/{path}: {message}")]
    Write {
        location: String,
        path: String,
        message: String,
    },

    /// IO error.
    #[error("Sink IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Sink JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// CSV Source Errors
// =============================================================================

/// Errors from the CSV source.
#[derive(Debug, Error)]
pub enum CsvError {
    /// Failed to read file.
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to decode the content.
    #[error("Failed to decode content: {0}")]
    EncodingError(String),

    /// Invalid CSV format.
    #[error("Invalid CSV format at line {line}: {message}")]
    ParseError { line: u64, message: String },

    /// Empty file.
    #[error("CSV file is empty")]
    EmptyFile,

    /// No headers found.
    #[error("No headers found in CSV")]
    NoHeaders,
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Errors while loading or validating [`crate::config::EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid JSON.
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An environment variable could not be parsed.
    #[error("Invalid value '{value}' for {key}")]
    InvalidEnv { key: &'static str, value: String },

    /// A setting is out of range.
    #[error("Invalid setting '{key}': {message}")]
    InvalidValue { key: &'static str, message: String },
}

// =============================================================================
// Pipeline Errors (top-level)
// =============================================================================

/// Top-level error registered with the execution context.
///
/// Every fatal failure ends up here; the context keeps them as
/// `Arc<PipelineError>` so the same instance can be observed by several
/// stages and is still registered only once.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Typed getter error.
    #[error("Value error: {0}")]
    Value(#[from] ValueError),

    /// Stage configuration error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Row processing error.
    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    /// Group transform error.
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Writer error.
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// CSV source error.
    #[error("CSV error: {0}")]
    Csv(#[from] CsvError),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// A run that collected one or more fatal errors.
#[derive(Debug, Error)]
#[error("pipeline aborted with {} error(s): {}", .errors.len(), summarize(.errors))]
pub struct PipelineFailure {
    /// Every collected error, in registration order.
    pub errors: Vec<Arc<PipelineError>>,
}

fn summarize(errors: &[Arc<PipelineError>]) -> String {
    errors
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no error recorded".to_string())
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for typed getters.
pub type ValueResult<T> = Result<T, ValueError>;

/// Result type for stage construction.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Result type for aggregators.
pub type AggregationResult<T> = Result<T, AggregationError>;

/// Result type for row writers.
pub type SinkResult<T> = Result<T, SinkError>;

/// Result type for the CSV source.
pub type CsvResult<T> = Result<T, CsvError>;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for whole runs.
pub type PipelineResult<T> = Result<T, PipelineFailure>;
