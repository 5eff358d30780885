//! Streaming aggregation over input sorted by group key.
//!
//! Only the current group is buffered; it is transformed the moment the key
//! changes. A key that shows up again after another key was processed
//! starts a new, separate group (it is not merged with its earlier
//! occurrence) and a warning is logged, since it usually means the input
//! was not sorted.

use log::{info, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::{display_key, run_transform, Emission, GroupTransform};
use crate::context::ExecutionContext;
use crate::key::group_key;
use crate::models::{Row, StageRef};
use crate::sequence::{BoxedSequence, Sequence, StageCore};

pub struct OrderedAggregation {
    core: StageCore,
    upstream: BoxedSequence,
    key_columns: Vec<String>,
    transform: Box<dyn GroupTransform>,
    group: Option<(String, Vec<Row>)>,
    /// Hashes of completed keys, only used to detect unsorted input.
    completed: HashSet<u64>,
    current: Option<Emission>,
    group_count: usize,
    done: bool,
}

fn key_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl OrderedAggregation {
    pub fn new<S, T>(ctx: &Arc<ExecutionContext>, upstream: S, key_columns: &[&str], transform: T) -> Self
    where
        S: Sequence + 'static,
        T: GroupTransform + 'static,
    {
        Self {
            core: StageCore::new(ctx, "OrderedAggregation"),
            upstream: Box::new(upstream),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            transform: Box::new(transform),
            group: None,
            completed: HashSet::new(),
            current: None,
            group_count: 0,
            done: false,
        }
    }

    /// Transforms the buffered group, if any.
    fn complete_group(&mut self) -> bool {
        let (key, rows) = match self.group.take() {
            Some(group) => group,
            None => return true,
        };
        self.completed.insert(key_hash(&key));
        self.group_count += 1;
        match run_transform(&self.core, self.transform.as_mut(), &key, &rows) {
            Ok(outputs) => {
                self.current = Some(Emission::new(rows, outputs));
                true
            }
            Err(err) => {
                self.core.release_all(rows);
                self.core.fail(err);
                self.shutdown();
                false
            }
        }
    }

    fn shutdown(&mut self) {
        self.done = true;
        if let Some((_, rows)) = self.group.take() {
            self.core.release_all(rows);
        }
        if let Some(mut current) = self.current.take() {
            current.discard(&self.core);
        }
        self.completed.clear();
    }
}

impl Sequence for OrderedAggregation {
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

            let row = match self.core.pull_from(self.upstream.as_mut()) {
                Some(row) => row,
                None if self.core.is_cancelled() => continue,
                None => {
                    if !self.complete_group() {
                        return None;
                    }
                    info!("{}: {} group(s) aggregated", self.core.stage(), self.group_count);
                    self.done = true;
                    continue;
                }
            };
            if row.is_control() {
                return Some(row);
            }

            let key = group_key(&row, &self.key_columns);
            let same_group = matches!(&self.group, Some((current, _)) if *current == key);
            if same_group {
                if let Some((_, rows)) = &mut self.group {
                    rows.push(row);
                }
                continue;
            }
            if !self.complete_group() {
                self.core.release_all([row]);
                return None;
            }
            if self.completed.contains(&key_hash(&key)) {
                warn!(
                    "{}: key '{}' reappeared after other keys, input is not sorted; starting a new group",
                    self.core.stage(),
                    display_key(&key)
                );
            }
            self.group = Some((key, vec![row]));
        }
    }
}
