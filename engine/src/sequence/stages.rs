//! Basic single-upstream mutators.

use regex::Regex;
use std::sync::Arc;

use super::{BoxedSequence, Sequence, StageCore};
use crate::context::ExecutionContext;
use crate::error::{BoxError, OperationError, ValidationError, ValidationResult};
use crate::models::{Row, StageRef, ValueKind};

// =============================================================================
// Filter
// =============================================================================

/// Keeps the rows a predicate accepts; rejected rows are released.
pub struct Filter {
    core: StageCore,
    upstream: BoxedSequence,
    predicate: Box<dyn FnMut(&Row) -> bool>,
}

impl Filter {
    pub fn new<S, F>(ctx: &Arc<ExecutionContext>, upstream: S, predicate: F) -> Self
    where
        S: Sequence + 'static,
        F: FnMut(&Row) -> bool + 'static,
    {
        Self {
            core: StageCore::new(ctx, "Filter"),
            upstream: Box::new(upstream),
            predicate: Box::new(predicate),
        }
    }

    /// Keeps rows whose `column` text matches `pattern`. Null never matches.
    pub fn matching<S>(
        ctx: &Arc<ExecutionContext>,
        upstream: S,
        column: &str,
        pattern: &str,
    ) -> ValidationResult<Self>
    where
        S: Sequence + 'static,
    {
        let regex = Regex::new(pattern).map_err(|e| ValidationError::InvalidParameter {
            stage: "Filter".to_string(),
            parameter: "pattern",
            message: e.to_string(),
        })?;
        let column = column.to_string();
        Ok(Self::new(ctx, upstream, move |row| {
            let value = row.get(&column);
            !value.is_null() && regex.is_match(&value.to_string())
        }))
    }
}

impl Sequence for Filter {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        loop {
            let mut row = self.core.pull_from(self.upstream.as_mut())?;
            if row.is_control() || (self.predicate)(&row) {
                return Some(row);
            }
            self.core.release(&mut row);
        }
    }
}

// =============================================================================
// Evaluate
// =============================================================================

/// Runs a fallible in-place mutation on every data row.
pub struct Evaluate {
    core: StageCore,
    upstream: BoxedSequence,
    mutation: Box<dyn FnMut(&mut Row) -> Result<(), BoxError>>,
    failed: bool,
}

impl Evaluate {
    pub fn new<S, F>(ctx: &Arc<ExecutionContext>, upstream: S, mutation: F) -> Self
    where
        S: Sequence + 'static,
        F: FnMut(&mut Row) -> Result<(), BoxError> + 'static,
    {
        Self {
            core: StageCore::new(ctx, "Evaluate"),
            upstream: Box::new(upstream),
            mutation: Box::new(mutation),
            failed: false,
        }
    }
}

impl Sequence for Evaluate {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        if self.failed {
            return None;
        }
        let mut row = self.core.pull_from(self.upstream.as_mut())?;
        if row.is_control() {
            return Some(row);
        }
        match (self.mutation)(&mut row) {
            Ok(()) => Some(row),
            Err(source) => {
                self.failed = true;
                self.core.fail(OperationError::Handler {
                    stage: self.core.stage().to_string(),
                    row: row.to_debug_string(),
                    source,
                });
                self.core.release(&mut row);
                None
            }
        }
    }
}

// =============================================================================
// ConvertColumns
// =============================================================================

/// Casts columns to one kind; failures become [`crate::models::RowError`] cells.
pub struct ConvertColumns {
    core: StageCore,
    upstream: BoxedSequence,
    columns: Vec<String>,
    kind: ValueKind,
}

impl ConvertColumns {
    pub fn new<S>(ctx: &Arc<ExecutionContext>, upstream: S, columns: &[&str], kind: ValueKind) -> Self
    where
        S: Sequence + 'static,
    {
        Self {
            core: StageCore::new(ctx, "ConvertColumns"),
            upstream: Box::new(upstream),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            kind,
        }
    }
}

impl Sequence for ConvertColumns {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        let mut row = self.core.pull_from(self.upstream.as_mut())?;
        if row.is_control() {
            return Some(row);
        }
        for column in &self.columns {
            let converted = match row.get_opt(column) {
                Some(value) if !value.is_null() && !value.is_error() => {
                    value.convert(self.kind, self.core.name())
                }
                _ => continue,
            };
            row.set(column.as_str(), converted);
        }
        Some(row)
    }
}

// =============================================================================
// PromoteRowErrors
// =============================================================================

/// Turns the first row error it sees into a fatal pipeline error.
pub struct PromoteRowErrors {
    core: StageCore,
    upstream: BoxedSequence,
    failed: bool,
}

impl PromoteRowErrors {
    pub fn new<S>(ctx: &Arc<ExecutionContext>, upstream: S) -> Self
    where
        S: Sequence + 'static,
    {
        Self {
            core: StageCore::new(ctx, "PromoteRowErrors"),
            upstream: Box::new(upstream),
            failed: false,
        }
    }
}

impl Sequence for PromoteRowErrors {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        if self.failed {
            return None;
        }
        let mut row = self.core.pull_from(self.upstream.as_mut())?;
        if row.is_control() {
            return Some(row);
        }
        let promoted = row.errors().next().map(|(column, err)| OperationError::RowErrorPromoted {
            stage: self.core.stage().to_string(),
            column: column.to_string(),
            message: err.to_string(),
            row: row.to_debug_string(),
        });
        match promoted {
            None => Some(row),
            Some(err) => {
                self.failed = true;
                self.core.fail(err);
                self.core.release(&mut row);
                None
            }
        }
    }
}

// =============================================================================
// Take
// =============================================================================

/// Passes the first `limit` data rows, then ends without draining upstream.
pub struct Take {
    core: StageCore,
    upstream: BoxedSequence,
    remaining: usize,
}

impl Take {
    pub fn new<S>(ctx: &Arc<ExecutionContext>, upstream: S, limit: usize) -> Self
    where
        S: Sequence + 'static,
    {
        Self {
            core: StageCore::new(ctx, "Take"),
            upstream: Box::new(upstream),
            remaining: limit,
        }
    }
}

impl Sequence for Take {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        if self.remaining == 0 {
            return None;
        }
        let row = self.core.pull_from(self.upstream.as_mut())?;
        if !row.is_control() {
            self.remaining -= 1;
        }
        Some(row)
    }
}
