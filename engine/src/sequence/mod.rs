//! Lazy, pull-based row sequences.
//!
//! A [`Sequence`] yields rows one at a time through [`Sequence::pull`];
//! `None` means end of stream. A mutator wraps exactly one upstream
//! sequence and pulls from it on demand, so a chain is only driven by its
//! outermost consumer.
//!
//! Every stage follows the same discipline, implemented by [`StageCore`]:
//!
//! - check the cancellation flag before pulling upstream
//! - take ownership of each row it receives (fires the ownership notification)
//! - forward control rows (heartbeats and markers) unmodified and never
//!   count them as data
//! - stop yielding rows, buffered ones included, once the run is cancelled
//! - register fatal errors with the context, run its shutdown, then end
//!
//! ```text
//! ┌──────────┐ pull ┌──────────┐ pull ┌──────────┐
//! │  source  │◀─────│ mutator  │◀─────│ consumer │
//! └──────────┘ row  └──────────┘ row  └──────────┘
//! ```

mod source;
mod stages;
mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use source::{record, ChannelSource, Record, RowSource};
pub use stages::{ConvertColumns, Evaluate, Filter, PromoteRowErrors, Take};
pub use writer::{
    shared_writer, BatchedWriter, JsonLinesWriter, MemoryWriter, RowWriter, SharedWriter, WriterOptions,
};

use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{BoxError, PipelineError, PipelineResult, ValidationResult};
use crate::models::{Row, StageRef, ValueKind};

/// A lazy, single-pass source of rows.
pub trait Sequence {
    /// Identity of this stage.
    fn stage(&self) -> &StageRef;

    /// Next row, or `None` at end of stream (also after cancellation or a
    /// fatal error, which the context records).
    fn pull(&mut self) -> Option<Row>;
}

impl<S: Sequence + ?Sized> Sequence for Box<S> {
    fn stage(&self) -> &StageRef {
        (**self).stage()
    }

    fn pull(&mut self) -> Option<Row> {
        (**self).pull()
    }
}

/// Type-erased sequence, the form in which stages hold their upstream.
pub type BoxedSequence = Box<dyn Sequence>;

/// State and helpers every stage shares.
pub struct StageCore {
    ctx: Arc<ExecutionContext>,
    stage: StageRef,
}

impl StageCore {
    pub fn new(ctx: &Arc<ExecutionContext>, name: &str) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            stage: ctx.register_stage(name),
        }
    }

    pub fn ctx(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    pub fn stage(&self) -> &StageRef {
        &self.stage
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    /// Pulls one row from `upstream` and takes ownership of it.
    ///
    /// Returns `None` without pulling when the run is cancelled.
    pub fn pull_from(&self, upstream: &mut dyn Sequence) -> Option<Row> {
        if self.ctx.is_cancelled() {
            return None;
        }
        let mut row = upstream.pull()?;
        self.ctx.transfer(&mut row, &self.stage);
        Some(row)
    }

    /// New empty row owned by this stage.
    pub fn create_row(&self) -> Row {
        self.ctx.create_row(&self.stage)
    }

    /// Copy of `source` with a fresh UID, owned by this stage.
    pub fn clone_row(&self, source: &Row) -> Row {
        self.ctx.clone_row(&self.stage, source)
    }

    /// Leaves a consumed row unowned.
    pub fn release(&self, row: &mut Row) {
        self.ctx.release(row);
    }

    pub fn release_all(&self, rows: impl IntoIterator<Item = Row>) {
        for mut row in rows {
            self.ctx.release(&mut row);
        }
    }

    /// Registers a fatal error with the context (which cancels the run).
    pub fn fail(&self, err: impl Into<PipelineError>) -> Arc<PipelineError> {
        self.ctx.fail(err)
    }
}

/// Chaining helpers available on every sized sequence.
pub trait SequenceExt: Sequence + Sized + 'static {
    fn boxed(self) -> BoxedSequence {
        Box::new(self)
    }

    /// Keeps rows for which `predicate` returns true.
    fn filter<F>(self, ctx: &Arc<ExecutionContext>, predicate: F) -> Filter
    where
        F: FnMut(&Row) -> bool + 'static,
    {
        Filter::new(ctx, self, predicate)
    }

    /// Keeps rows whose `column` text matches `pattern`.
    fn filter_matching(
        self,
        ctx: &Arc<ExecutionContext>,
        column: &str,
        pattern: &str,
    ) -> ValidationResult<Filter> {
        Filter::matching(ctx, self, column, pattern)
    }

    /// Mutates every data row in place.
    fn evaluate<F>(self, ctx: &Arc<ExecutionContext>, f: F) -> Evaluate
    where
        F: FnMut(&mut Row) -> Result<(), BoxError> + 'static,
    {
        Evaluate::new(ctx, self, f)
    }

    /// Casts `columns` to `kind`; failures become row errors.
    fn convert_columns(
        self,
        ctx: &Arc<ExecutionContext>,
        columns: &[&str],
        kind: ValueKind,
    ) -> ConvertColumns {
        ConvertColumns::new(ctx, self, columns, kind)
    }

    /// Aborts the run on the first row carrying a row error.
    fn promote_row_errors(self, ctx: &Arc<ExecutionContext>) -> PromoteRowErrors {
        PromoteRowErrors::new(ctx, self)
    }

    /// First `limit` data rows.
    fn take_rows(self, ctx: &Arc<ExecutionContext>, limit: usize) -> Take {
        Take::new(ctx, self, limit)
    }

    fn into_rows(self) -> SequenceIter<Self> {
        SequenceIter { inner: self }
    }
}

impl<S: Sequence + Sized + 'static> SequenceExt for S {}

/// [`Iterator`] view of a sequence. Control rows are yielded too.
pub struct SequenceIter<S> {
    inner: S,
}

impl<S: Sequence> Iterator for SequenceIter<S> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.inner.pull()
    }
}

/// Drains `sequence` and returns its data rows.
///
/// Control rows are dropped. If the context collected any fatal error during
/// the run, the rows are discarded and the failure is returned instead.
pub fn collect_rows(ctx: &ExecutionContext, sequence: &mut dyn Sequence) -> PipelineResult<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(mut row) = sequence.pull() {
        if row.is_control() {
            ctx.release(&mut row);
            continue;
        }
        rows.push(row);
    }
    match ctx.failure() {
        Some(failure) => Err(failure),
        None => Ok(rows),
    }
}

/// Drains `sequence`, releasing every row, and returns the data row count.
pub fn run_to_end(ctx: &ExecutionContext, sequence: &mut dyn Sequence) -> PipelineResult<usize> {
    let mut count = 0;
    while let Some(mut row) = sequence.pull() {
        if !row.is_control() {
            count += 1;
        }
        ctx.release(&mut row);
    }
    match ctx.failure() {
        Some(failure) => Err(failure),
        None => Ok(count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn ctx() -> Arc<ExecutionContext> {
        ExecutionContext::new(EngineConfig::default())
    }

    fn numbers(ctx: &Arc<ExecutionContext>, n: i32) -> RowSource {
        RowSource::new(ctx, "Numbers", (1..=n).map(|i| record([("n", i)])))
    }

    #[test]
    fn test_chain_pulls_lazily() {
        let ctx = ctx();
        let pulled = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&pulled);
        let mut seq = numbers(&ctx, 100)
            .evaluate(&ctx, move |_row| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .take_rows(&ctx, 3);
        let rows = collect_rows(&ctx, &mut seq).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(*pulled.lock().unwrap(), 3);
    }

    #[test]
    fn test_ownership_follows_the_row() {
        let ctx = ctx();
        let mut seq = numbers(&ctx, 2).filter(&ctx, |_| true);
        let filter_stage = seq.stage().clone();
        let rows = collect_rows(&ctx, &mut seq).unwrap();
        assert!(rows.iter().all(|r| r.owner() == Some(&filter_stage)));
    }

    #[test]
    fn test_single_owner_at_all_times() {
        let ctx = ctx();
        let owners: Arc<Mutex<HashMap<u64, Option<u32>>>> = Arc::new(Mutex::new(HashMap::new()));
        let seen = Arc::clone(&owners);
        ctx.set_ownership_listener(Arc::new(move |change: &crate::context::OwnershipChange| {
            let mut owners = seen.lock().unwrap();
            let recorded = owners.insert(change.row_uid, change.current.as_ref().map(|s| s.id()));
            // the previous owner must be exactly the one we last recorded
            if let Some(recorded) = recorded {
                assert_eq!(recorded, change.previous.as_ref().map(|s| s.id()));
            }
        }));
        let mut seq = numbers(&ctx, 5)
            .filter(&ctx, |r| r.get_as::<i32>("n").ok().flatten().unwrap_or(0) % 2 == 1)
            .take_rows(&ctx, 10);
        assert_eq!(run_to_end(&ctx, &mut seq).unwrap(), 3);
        assert!(owners.lock().unwrap().values().all(|o| o.is_none()));
    }

    #[test]
    fn test_cancellation_stops_pulling() {
        let ctx = ctx();
        let mut seq = numbers(&ctx, 10).filter(&ctx, |_| true);
        assert!(seq.pull().is_some());
        ctx.cancel();
        assert!(seq.pull().is_none());
        assert!(collect_rows(&ctx, &mut seq).unwrap().is_empty());
    }

    #[test]
    fn test_failure_surfaces_from_run_helpers() {
        let ctx = ctx();
        let mut seq = numbers(&ctx, 3).evaluate(&ctx, |row| {
            if row.get("n") == &Value::Int(2) {
                return Err("two is not allowed".into());
            }
            Ok(())
        });
        let failure = run_to_end(&ctx, &mut seq).unwrap_err();
        assert_eq!(failure.errors.len(), 1);
        assert!(failure.to_string().contains("two is not allowed"));
    }

    #[test]
    fn test_iterator_adapter() {
        let ctx = ctx();
        let values: Vec<Value> = numbers(&ctx, 3).into_rows().map(|r| r.get("n").clone()).collect();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }
}
