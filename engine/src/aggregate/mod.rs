//! Aggregation engine.
//!
//! Three strategies share one contract: consume the upstream, partition its
//! rows by [`group_key`](crate::key::group_key) over the key columns, and
//! emit aggregate rows in place of the source rows.
//!
//! ```text
//! ┌──────────────────────┐
//! │ a=1 v=2 │ a=1 v=3    │      ┌───────────────┐
//! │ a=2 v=5              │ ───▶ │ a=1 sum_v=5   │
//! └──────────────────────┘      │ a=2 sum_v=5   │
//!                               └───────────────┘
//! ```
//!
//! - [`UnorderedAggregation`] - buffers everything, any input order
//! - [`OrderedAggregation`] - input sorted by key, buffers one group
//! - [`ContinuousAggregation`] - one running aggregate per key, no buffering
//!
//! The first two run a [`GroupTransform`] over the full row list of each
//! group; [`GroupBy`] is the restricted shape emitting exactly one row.
//! The continuous strategy folds rows one by one through a
//! [`ContinuousOperation`]; [`ContinuousGroupBy`] is its group-by shape.

mod aggregators;
mod continuous;
mod ordered;
mod unordered;

pub use aggregators::{Accumulator, Aggregator, Avg, Count, LinearRegression, Max, Min, Sum};
pub use continuous::{ContinuousAggregation, ContinuousGroupBy, ContinuousOperation};
pub use ordered::OrderedAggregation;
pub use unordered::UnorderedAggregation;

use std::collections::VecDeque;

use crate::context::ExecutionContext;
use crate::error::{AggregationError, BoxError};
use crate::models::{Row, StageRef};
use crate::sequence::StageCore;

/// Turns the rows of one group into zero or more aggregate rows.
pub trait GroupTransform {
    /// Operation name reported in errors.
    fn name(&self) -> &str;

    /// `rows` is the whole group, in arrival order. New rows must be
    /// created through `ctx` and owned by `stage`.
    fn transform(
        &mut self,
        ctx: &ExecutionContext,
        stage: &StageRef,
        key: &str,
        rows: &[Row],
    ) -> Result<Vec<Row>, BoxError>;
}

/// Emits one row per group: the key columns of the first row, followed by
/// one result per aggregator.
pub struct GroupBy {
    key_columns: Vec<String>,
    aggregators: Vec<Box<dyn Aggregator>>,
}

impl GroupBy {
    pub fn new<S: AsRef<str>>(key_columns: &[S]) -> Self {
        Self {
            key_columns: key_columns.iter().map(|c| c.as_ref().to_string()).collect(),
            aggregators: Vec::new(),
        }
    }

    pub fn with(mut self, aggregator: impl Aggregator + 'static) -> Self {
        self.aggregators.push(Box::new(aggregator));
        self
    }

    pub fn push(&mut self, aggregator: Box<dyn Aggregator>) {
        self.aggregators.push(aggregator);
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }
}

impl GroupTransform for GroupBy {
    fn name(&self) -> &str {
        "GroupBy"
    }

    fn transform(
        &mut self,
        ctx: &ExecutionContext,
        stage: &StageRef,
        _key: &str,
        rows: &[Row],
    ) -> Result<Vec<Row>, BoxError> {
        let mut aggregate = ctx.create_row(stage);
        if let Some(first) = rows.first() {
            for column in &self.key_columns {
                aggregate.set(column.as_str(), first.get(column).clone());
            }
        }
        for aggregator in &self.aggregators {
            let mut acc = aggregator.accumulator();
            for row in rows {
                acc.add(row)?;
            }
            acc.finish(&mut aggregate);
        }
        Ok(vec![aggregate])
    }
}

/// [`GroupTransform`] backed by a closure.
pub struct FnGroupTransform<F> {
    name: String,
    f: F,
}

impl<F> FnGroupTransform<F>
where
    F: FnMut(&ExecutionContext, &StageRef, &str, &[Row]) -> Result<Vec<Row>, BoxError>,
{
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }
}

impl<F> GroupTransform for FnGroupTransform<F>
where
    F: FnMut(&ExecutionContext, &StageRef, &str, &[Row]) -> Result<Vec<Row>, BoxError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &mut self,
        ctx: &ExecutionContext,
        stage: &StageRef,
        key: &str,
        rows: &[Row],
    ) -> Result<Vec<Row>, BoxError> {
        (self.f)(ctx, stage, key, rows)
    }
}

/// Readable form of a group key for messages.
pub(crate) fn display_key(key: &str) -> String {
    key.replace(crate::key::KEY_SEPARATOR, ", ")
}

/// Wraps a group-level failure with the operation name and a row dump.
pub(crate) fn group_error(operation: &str, key: &str, message: String, rows: &[Row]) -> AggregationError {
    AggregationError::GroupTransform {
        operation: operation.to_string(),
        key: display_key(key),
        message,
        rows: rows
            .iter()
            .map(Row::to_debug_string)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Runs `transform` over one group, wrapping its error.
pub(crate) fn run_transform(
    core: &StageCore,
    transform: &mut dyn GroupTransform,
    key: &str,
    rows: &[Row],
) -> Result<Vec<Row>, AggregationError> {
    transform
        .transform(core.ctx(), core.stage(), key, rows)
        .map_err(|e| group_error(transform.name(), key, e.to_string(), rows))
}

/// Aggregates of one completed group, handed out one per pull. The group's
/// source rows are released once the last aggregate has left.
pub(crate) struct Emission {
    sources: Vec<Row>,
    outputs: VecDeque<Row>,
}

impl Emission {
    pub(crate) fn new(sources: Vec<Row>, outputs: Vec<Row>) -> Self {
        Self {
            sources,
            outputs: outputs.into(),
        }
    }

    pub(crate) fn next(&mut self, core: &StageCore) -> Option<Row> {
        let row = self.outputs.pop_front();
        if self.outputs.is_empty() {
            core.release_all(self.sources.drain(..));
        }
        row
    }

    pub(crate) fn discard(&mut self, core: &StageCore) {
        core.release_all(self.sources.drain(..));
        core.release_all(self.outputs.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::Value;
    use std::sync::Arc;

    #[test]
    fn test_group_by_emits_one_row_with_keys_first() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let stage = ctx.register_stage("Agg");
        let rows = vec![
            ctx.create_row_with(&stage, [("city", Value::from("Oslo")), ("v", Value::Int(1))]),
            ctx.create_row_with(&stage, [("city", Value::from("Oslo")), ("v", Value::Int(4))]),
        ];
        let mut group_by = GroupBy::new(&["city"]).with(Sum::new("v").into_column("total"));
        let out = group_by.transform(&ctx, &stage, "Oslo", &rows).unwrap();
        assert_eq!(out.len(), 1);
        let columns: Vec<&str> = out[0].values().map(|(c, _)| c).collect();
        assert_eq!(columns, vec!["city", "total"]);
        assert_eq!(out[0].get("total"), &Value::Long(5));
    }

    #[test]
    fn test_group_error_carries_row_dump() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let core = StageCore::new(&ctx, "Agg");
        let rows = vec![ctx.create_row_with(core.stage(), [("v", Value::from("x"))])];
        let mut group_by = GroupBy::new(&["v"]).with(Sum::new("v"));
        let err = run_transform(&core, &mut group_by, "x", &rows).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("GroupBy failed for group 'x'"));
        assert!(text.contains("[v] = (String) x"));
    }

    #[test]
    fn test_emission_releases_sources_after_last_output() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let core = StageCore::new(&ctx, "Agg");
        let released = Arc::new(std::sync::Mutex::new(0));
        let counter = Arc::clone(&released);
        ctx.set_ownership_listener(Arc::new(move |change: &crate::context::OwnershipChange| {
            if change.current.is_none() {
                *counter.lock().unwrap() += 1;
            }
        }));
        let sources = vec![core.create_row(), core.create_row()];
        let outputs = vec![core.create_row(), core.create_row()];
        let mut emission = Emission::new(sources, outputs);

        assert!(emission.next(&core).is_some());
        assert_eq!(*released.lock().unwrap(), 0);
        assert!(emission.next(&core).is_some());
        assert_eq!(*released.lock().unwrap(), 2);
        assert!(emission.next(&core).is_none());
    }
}
