//! Running aggregation: one aggregate row per key, updated row by row.

use log::info;
use std::collections::HashMap;
use std::sync::Arc;

use super::{group_error, Accumulator, Aggregator};
use crate::context::ExecutionContext;
use crate::error::BoxError;
use crate::key::group_key;
use crate::models::{Row, StageRef};
use crate::sequence::{BoxedSequence, Sequence, StageCore};

/// Folds incoming rows into the running aggregate of their group.
pub trait ContinuousOperation {
    fn name(&self) -> &str;

    /// `count` is the number of rows already folded into `aggregate`, so
    /// it is 0 for the first row of a group.
    fn fold(&mut self, key: &str, row: &Row, aggregate: &mut Row, count: usize) -> Result<(), BoxError>;

    /// Called once per group after the input is drained.
    fn finish(&mut self, _key: &str, _aggregate: &mut Row) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Group-by shape of [`ContinuousOperation`]: key columns copied from the
/// first row, then one column set per aggregator. Only accumulators are
/// kept between rows.
pub struct ContinuousGroupBy {
    key_columns: Vec<String>,
    aggregators: Vec<Box<dyn Aggregator>>,
    accumulators: HashMap<String, Vec<Box<dyn Accumulator>>>,
}

impl ContinuousGroupBy {
    pub fn new<S: AsRef<str>>(key_columns: &[S]) -> Self {
        Self {
            key_columns: key_columns.iter().map(|c| c.as_ref().to_string()).collect(),
            aggregators: Vec::new(),
            accumulators: HashMap::new(),
        }
    }

    pub fn with(mut self, aggregator: impl Aggregator + 'static) -> Self {
        self.aggregators.push(Box::new(aggregator));
        self
    }

    pub fn push(&mut self, aggregator: Box<dyn Aggregator>) {
        self.aggregators.push(aggregator);
    }
}

impl ContinuousOperation for ContinuousGroupBy {
    fn name(&self) -> &str {
        "ContinuousGroupBy"
    }

    fn fold(&mut self, key: &str, row: &Row, aggregate: &mut Row, count: usize) -> Result<(), BoxError> {
        if count == 0 {
            for column in &self.key_columns {
                aggregate.set(column.as_str(), row.get(column).clone());
            }
        }
        let aggregators = &self.aggregators;
        let accumulators = self
            .accumulators
            .entry(key.to_string())
            .or_insert_with(|| aggregators.iter().map(|a| a.accumulator()).collect());
        for acc in accumulators.iter_mut() {
            acc.add(row)?;
        }
        Ok(())
    }

    fn finish(&mut self, key: &str, aggregate: &mut Row) -> Result<(), BoxError> {
        if let Some(accumulators) = self.accumulators.remove(key) {
            for acc in &accumulators {
                acc.finish(aggregate);
            }
        }
        Ok(())
    }
}

struct RunningGroup {
    aggregate: Row,
    count: usize,
}

/// Holds one running aggregate per key. Source rows are released as soon
/// as they are folded; every aggregate is emitted once the input ends, in
/// first-seen key order.
pub struct ContinuousAggregation {
    core: StageCore,
    upstream: BoxedSequence,
    key_columns: Vec<String>,
    operation: Box<dyn ContinuousOperation>,
    groups: HashMap<String, RunningGroup>,
    order: Vec<String>,
    ready: std::vec::IntoIter<Row>,
    done: bool,
}

impl ContinuousAggregation {
    pub fn new<S, O>(ctx: &Arc<ExecutionContext>, upstream: S, key_columns: &[&str], operation: O) -> Self
    where
        S: Sequence + 'static,
        O: ContinuousOperation + 'static,
    {
        Self {
            core: StageCore::new(ctx, "ContinuousAggregation"),
            upstream: Box::new(upstream),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            operation: Box::new(operation),
            groups: HashMap::new(),
            order: Vec::new(),
            ready: Vec::new().into_iter(),
            done: false,
        }
    }

    fn fold(&mut self, mut row: Row) -> bool {
        let key = group_key(&row, &self.key_columns);
        if !self.groups.contains_key(&key) {
            let aggregate = self.core.create_row();
            self.groups.insert(key.clone(), RunningGroup { aggregate, count: 0 });
            self.order.push(key.clone());
        }
        let result = match self.groups.get_mut(&key) {
            Some(group) => {
                let result = self.operation.fold(&key, &row, &mut group.aggregate, group.count);
                group.count += 1;
                result
            }
            None => Ok(()),
        };
        if let Err(e) = result {
            let err = group_error(self.operation.name(), &key, e.to_string(), std::slice::from_ref(&row));
            self.core.release(&mut row);
            self.core.fail(err);
            self.shutdown();
            return false;
        }
        self.core.release(&mut row);
        true
    }

    fn finish(&mut self) -> bool {
        let mut out = Vec::with_capacity(self.order.len());
        for key in std::mem::take(&mut self.order) {
            let Some(mut group) = self.groups.remove(&key) else {
                continue;
            };
            if let Err(e) = self.operation.finish(&key, &mut group.aggregate) {
                let err = group_error(
                    self.operation.name(),
                    &key,
                    e.to_string(),
                    std::slice::from_ref(&group.aggregate),
                );
                self.core.release_all(out);
                self.core.release(&mut group.aggregate);
                self.core.fail(err);
                self.shutdown();
                return false;
            }
            out.push(group.aggregate);
        }
        info!("{}: {} group(s) aggregated", self.core.stage(), out.len());
        self.ready = out.into_iter();
        true
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.order.clear();
        let groups = std::mem::take(&mut self.groups);
        self.core.release_all(groups.into_values().map(|g| g.aggregate));
        let ready = std::mem::replace(&mut self.ready, Vec::new().into_iter());
        self.core.release_all(ready);
    }
}

impl Sequence for ContinuousAggregation {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        loop {
            if self.core.is_cancelled() {
                self.shutdown();
                return None;
            }
            if let Some(row) = self.ready.next() {
                return Some(row);
            }
            if self.done {
                return None;
            }
            match self.core.pull_from(self.upstream.as_mut()) {
                Some(row) if row.is_control() => return Some(row),
                Some(row) => {
                    if !self.fold(row) {
                        return None;
                    }
                }
                None if self.core.is_cancelled() => {}
                None => {
                    self.done = true;
                    if !self.finish() {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Avg, Count, LinearRegression, Sum};
    use crate::config::EngineConfig;
    use crate::error::PipelineError;
    use crate::models::Value;
    use crate::sequence::testing::{Owners, ScriptedSource, Step};
    use crate::sequence::{collect_rows, record, RowSource};

    fn ctx() -> Arc<ExecutionContext> {
        ExecutionContext::new(EngineConfig::default())
    }

    fn points(ctx: &Arc<ExecutionContext>) -> RowSource {
        RowSource::new(
            ctx,
            "Points",
            vec![
                record([("s", Value::from("a")), ("x", Value::Int(1)), ("y", Value::Int(3))]),
                record([("s", Value::from("b")), ("x", Value::Int(0)), ("y", Value::Int(7))]),
                record([("s", Value::from("a")), ("x", Value::Int(2)), ("y", Value::Int(5))]),
                record([("s", Value::from("a")), ("x", Value::Int(3)), ("y", Value::Int(7))]),
            ],
        )
    }

    #[test]
    fn test_one_aggregate_per_key_in_first_seen_order() {
        let ctx = ctx();
        let op = ContinuousGroupBy::new(&["s"])
            .with(Sum::new("y"))
            .with(Avg::new("x"))
            .with(Count::rows("n"))
            .with(LinearRegression::new("x", "y"));
        let mut agg = ContinuousAggregation::new(&ctx, points(&ctx), &["s"], op);
        let rows = collect_rows(&ctx, &mut agg).unwrap();

        assert_eq!(rows.len(), 2);
        let a = &rows[0];
        assert_eq!(a.get("s"), &Value::from("a"));
        assert_eq!(a.get("y"), &Value::Long(15));
        assert_eq!(a.get("x"), &Value::Double(2.0));
        assert_eq!(a.get("n"), &Value::Long(3));
        assert_eq!(a.get("y_x_slope"), &Value::Double(2.0));
        assert_eq!(a.get("y_x_intercept"), &Value::Double(1.0));

        let b = &rows[1];
        assert_eq!(b.get("n"), &Value::Long(1));
        assert_eq!(b.get("y_x_slope"), &Value::Double(0.0));
        assert_eq!(b.get("y_x_intercept"), &Value::Double(7.0));
    }

    struct Tracker;

    impl ContinuousOperation for Tracker {
        fn name(&self) -> &str {
            "Tracker"
        }

        fn fold(&mut self, _key: &str, row: &Row, aggregate: &mut Row, count: usize) -> Result<(), BoxError> {
            aggregate.set("seen", Value::Long(count as i64 + 1));
            let best = aggregate.get_as::<i32>("max_y")?.unwrap_or(i32::MIN);
            let y = row.get_as::<i32>("y")?.unwrap_or(i32::MIN);
            aggregate.set("max_y", Value::Int(best.max(y)));
            Ok(())
        }
    }

    #[test]
    fn test_operation_sees_running_count() {
        let ctx = ctx();
        let mut agg = ContinuousAggregation::new(&ctx, points(&ctx), &["s"], Tracker);
        let rows = collect_rows(&ctx, &mut agg).unwrap();
        assert_eq!(rows[0].get("max_y"), &Value::Int(7));
        assert_eq!(rows[0].get("seen"), &Value::Long(3));
        assert_eq!(rows[1].get("seen"), &Value::Long(1));
    }

    #[test]
    fn test_fold_failure_reports_row() {
        let ctx = ctx();
        let source = RowSource::new(
            &ctx,
            "Bad",
            vec![
                record([("s", Value::from("a")), ("y", Value::Int(1))]),
                record([("s", Value::from("a")), ("y", Value::from("oops"))]),
            ],
        );
        let op = ContinuousGroupBy::new(&["s"]).with(Sum::new("y"));
        let mut agg = ContinuousAggregation::new(&ctx, source, &["s"], op);
        assert!(agg.pull().is_none());
        let errors = ctx.errors();
        assert_eq!(errors.len(), 1);
        match &*errors[0] {
            PipelineError::Aggregation(err) => {
                let text = err.to_string();
                assert!(text.contains("ContinuousGroupBy"));
                assert!(text.contains("oops"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_control_rows_are_not_folded() {
        let ctx = ctx();
        let input = ScriptedSource::new(
            &ctx,
            vec![
                Step::Marker("m"),
                Step::Data(record([("s", "a")])),
                Step::Heartbeat,
                Step::Data(record([("s", "a")])),
            ],
        );
        let op = ContinuousGroupBy::new(&["s"]).with(Count::rows("n"));
        let mut agg = ContinuousAggregation::new(&ctx, input, &["s"], op);
        let rows: Vec<Row> = std::iter::from_fn(|| agg.pull()).collect();

        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_control() && rows[1].is_heartbeat());
        assert_eq!(rows[2].get("n"), &Value::Long(2));
    }

    #[test]
    fn test_cancel_discards_finished_aggregates() {
        let ctx = ctx();
        let owners = Owners::watch(&ctx);
        let op = ContinuousGroupBy::new(&["s"]).with(Sum::new("y"));
        let mut agg = ContinuousAggregation::new(&ctx, points(&ctx), &["s"], op);

        assert_eq!(agg.pull().unwrap().get("s"), &Value::from("a"));
        ctx.cancel();

        assert!(agg.pull().is_none());
        assert_eq!(owners.owned(), 0);
        // four folded source rows and the unsent aggregate of "b"
        assert_eq!(owners.released(), 5);
    }
}
