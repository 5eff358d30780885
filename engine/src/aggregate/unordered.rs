//! In-memory aggregation over unordered input.

use log::info;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{run_transform, Emission, GroupTransform};
use crate::context::ExecutionContext;
use crate::key::group_key;
use crate::models::{Row, StageRef};
use crate::sequence::{BoxedSequence, Sequence, StageCore};

/// Buffers every row, partitioned by key, then transforms the groups one
/// by one in first-seen key order.
pub struct UnorderedAggregation {
    core: StageCore,
    upstream: BoxedSequence,
    key_columns: Vec<String>,
    transform: Box<dyn GroupTransform>,
    index: HashMap<String, usize>,
    groups: VecDeque<(String, Vec<Row>)>,
    current: Option<Emission>,
    consumed: bool,
    done: bool,
}

impl UnorderedAggregation {
    pub fn new<S, T>(ctx: &Arc<ExecutionContext>, upstream: S, key_columns: &[&str], transform: T) -> Self
    where
        S: Sequence + 'static,
        T: GroupTransform + 'static,
    {
        Self {
            core: StageCore::new(ctx, "UnorderedAggregation"),
            upstream: Box::new(upstream),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            transform: Box::new(transform),
            index: HashMap::new(),
            groups: VecDeque::new(),
            current: None,
            consumed: false,
            done: false,
        }
    }

    fn add(&mut self, row: Row) {
        let key = group_key(&row, &self.key_columns);
        match self.index.get(&key) {
            Some(&i) => self.groups[i].1.push(row),
            None => {
                self.index.insert(key.clone(), self.groups.len());
                self.groups.push_back((key, vec![row]));
            }
        }
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.index.clear();
        if let Some(mut current) = self.current.take() {
            current.discard(&self.core);
        }
        for (_, rows) in self.groups.drain(..) {
            self.core.release_all(rows);
        }
    }
}

impl Sequence for UnorderedAggregation {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        loop {
            if self.core.is_cancelled() {
                self.shutdown();
                return None;
            }
            if let Some(current) = &mut self.current {
                if let Some(row) = current.next(&self.core) {
                    return Some(row);
                }
                self.current = None;
            }
            if self.done {
                return None;
            }

            if !self.consumed {
                match self.core.pull_from(self.upstream.as_mut()) {
                    Some(row) if row.is_control() => return Some(row),
                    Some(row) => self.add(row),
                    None if self.core.is_cancelled() => {}
                    None => {
                        self.consumed = true;
                        // positions are no longer needed once groups are popped
                        self.index.clear();
                        info!(
                            "{}: {} group(s) collected",
                            self.core.stage(),
                            self.groups.len()
                        );
                    }
                }
                continue;
            }

            let (key, rows) = match self.groups.pop_front() {
                Some(group) => group,
                None => {
                    self.done = true;
                    return None;
                }
            };
            match run_transform(&self.core, self.transform.as_mut(), &key, &rows) {
                Ok(outputs) => self.current = Some(Emission::new(rows, outputs)),
                Err(err) => {
                    self.core.release_all(rows);
                    self.core.fail(err);
                    self.shutdown();
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Count, FnGroupTransform, GroupBy, Sum};
    use crate::config::EngineConfig;
    use crate::error::{BoxError, PipelineError};
    use crate::models::Value;
    use crate::models::RowTag;
    use crate::sequence::testing::{Owners, ScriptedSource, Step};
    use crate::sequence::{collect_rows, record, RowSource};

    fn ctx() -> Arc<ExecutionContext> {
        ExecutionContext::new(EngineConfig::default())
    }

    fn sales(ctx: &Arc<ExecutionContext>) -> RowSource {
        RowSource::new(
            ctx,
            "Sales",
            vec![
                record([("city", Value::from("B")), ("v", Value::Int(1))]),
                record([("city", Value::from("A")), ("v", Value::Int(2))]),
                record([("city", Value::from("B")), ("v", Value::Int(3))]),
                record([("city", Value::Null), ("v", Value::Int(4))]),
            ],
        )
    }

    #[test]
    fn test_groups_in_first_seen_order() {
        let ctx = ctx();
        let transform = GroupBy::new(&["city"])
            .with(Sum::new("v").into_column("sum"))
            .with(Count::rows("n"));
        let mut agg = UnorderedAggregation::new(&ctx, sales(&ctx), &["city"], transform);
        let rows = collect_rows(&ctx, &mut agg).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("city"), &Value::from("B"));
        assert_eq!(rows[0].get("sum"), &Value::Long(4));
        assert_eq!(rows[0].get("n"), &Value::Long(2));
        assert_eq!(rows[1].get("city"), &Value::from("A"));
        assert_eq!(rows[2].get("city"), &Value::Null);
    }

    #[test]
    fn test_transform_may_emit_many_or_none() {
        let ctx = ctx();
        let transform = FnGroupTransform::new(
            "Explode",
            |ctx: &ExecutionContext, stage: &StageRef, _key: &str, rows: &[Row]| -> Result<Vec<Row>, BoxError> {
                if rows.len() < 2 {
                    return Ok(Vec::new());
                }
                Ok(rows.iter().map(|r| ctx.clone_row(stage, r)).collect())
            },
        );
        let mut agg = UnorderedAggregation::new(&ctx, sales(&ctx), &["city"], transform);
        let rows = collect_rows(&ctx, &mut agg).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.get("city") == &Value::from("B")));
    }

    #[test]
    fn test_failure_keeps_earlier_aggregates() {
        let ctx = ctx();
        let transform = FnGroupTransform::new(
            "FailOnA",
            |ctx: &ExecutionContext, stage: &StageRef, key: &str, _rows: &[Row]| -> Result<Vec<Row>, BoxError> {
                if key == "A" {
                    return Err("no A allowed".into());
                }
                Ok(vec![ctx.create_row(stage)])
            },
        );
        let mut agg = UnorderedAggregation::new(&ctx, sales(&ctx), &["city"], transform);
        assert!(agg.pull().is_some());
        assert!(agg.pull().is_none());
        let errors = ctx.errors();
        assert_eq!(errors.len(), 1);
        match &*errors[0] {
            PipelineError::Aggregation(err) => {
                let text = err.to_string();
                assert!(text.contains("FailOnA"));
                assert!(text.contains("no A allowed"));
                assert!(text.contains("[v] = (Int) 2"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_control_rows_pass_through_and_form_no_group() {
        let ctx = ctx();
        let input = ScriptedSource::new(
            &ctx,
            vec![
                Step::Marker("checkpoint"),
                Step::Data(record([("k", "a")])),
                Step::Heartbeat,
                Step::Data(record([("k", "b")])),
                Step::Data(record([("k", "a")])),
            ],
        );
        let mut agg = UnorderedAggregation::new(&ctx, input, &["k"], GroupBy::new(&["k"]).with(Count::rows("n")));
        let rows: Vec<Row> = std::iter::from_fn(|| agg.pull()).collect();

        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].tag(), Some(&RowTag::Marker("checkpoint".into())));
        assert!(rows[1].is_heartbeat());
        assert_eq!(rows[2].get("k"), &Value::from("a"));
        assert_eq!(rows[2].get("n"), &Value::Long(2));
        assert_eq!(rows[3].get("k"), &Value::from("b"));
        assert!(rows.iter().all(|r| !r.get("k").is_null() || r.is_control()));
    }

    #[test]
    fn test_cancel_mid_emission_releases_groups() {
        let ctx = ctx();
        let owners = Owners::watch(&ctx);
        let transform = FnGroupTransform::new(
            "Twice",
            |ctx: &ExecutionContext, stage: &StageRef, _key: &str, _rows: &[Row]| -> Result<Vec<Row>, BoxError> {
                Ok(vec![ctx.create_row(stage), ctx.create_row(stage)])
            },
        );
        let mut agg = UnorderedAggregation::new(&ctx, sales(&ctx), &["city"], transform);

        assert!(agg.pull().is_some());
        assert_eq!(owners.held_by("UnorderedAggregation"), 4);
        ctx.cancel();

        assert!(agg.pull().is_none());
        assert!(agg.pull().is_none());
        assert_eq!(owners.owned(), 0);
        // four source rows plus the aggregate still waiting in the emission
        assert_eq!(owners.released(), 5);
    }
}
