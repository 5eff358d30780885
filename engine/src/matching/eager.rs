//! Eager key-based operations: the right-hand sequence is fully evaluated
//! into a lookup on the first pull, before any left row is processed.

use std::collections::VecDeque;
use std::sync::Arc;

use super::actions::{MatchKind, MatchRules};
use super::lookup::{LookupMode, LookupTable};
use crate::context::ExecutionContext;
use crate::error::{BoxError, OperationError, ValidationResult};
use crate::key::KeySelector;
use crate::models::{Row, StageRef};
use crate::sequence::{BoxedSequence, Sequence, StageCore};

/// Expand, Join or KeyTest against an eagerly built lookup.
pub struct LookupMatch {
    core: StageCore,
    kind: MatchKind,
    upstream: BoxedSequence,
    right: Option<BoxedSequence>,
    left_key: KeySelector,
    right_key: KeySelector,
    rules: MatchRules,
    lookup: Option<LookupTable>,
    pending: VecDeque<Row>,
    done: bool,
}

impl LookupMatch {
    /// At most one right row per key (last one loaded wins).
    pub fn expand<L, R>(
        ctx: &Arc<ExecutionContext>,
        left: L,
        right: R,
        left_key: KeySelector,
        right_key: KeySelector,
        rules: MatchRules,
    ) -> ValidationResult<Self>
    where
        L: Sequence + 'static,
        R: Sequence + 'static,
    {
        Self::new(ctx, MatchKind::Expand, left, right, left_key, right_key, rules)
    }

    /// Every right row per key; extra matches clone the left row.
    pub fn join<L, R>(
        ctx: &Arc<ExecutionContext>,
        left: L,
        right: R,
        left_key: KeySelector,
        right_key: KeySelector,
        rules: MatchRules,
    ) -> ValidationResult<Self>
    where
        L: Sequence + 'static,
        R: Sequence + 'static,
    {
        Self::new(ctx, MatchKind::Join, left, right, left_key, right_key, rules)
    }

    /// Only tests whether the left key exists on the right.
    pub fn key_test<L, R>(
        ctx: &Arc<ExecutionContext>,
        left: L,
        right: R,
        left_key: KeySelector,
        right_key: KeySelector,
        rules: MatchRules,
    ) -> ValidationResult<Self>
    where
        L: Sequence + 'static,
        R: Sequence + 'static,
    {
        Self::new(ctx, MatchKind::KeyTest, left, right, left_key, right_key, rules)
    }

    fn new<L, R>(
        ctx: &Arc<ExecutionContext>,
        kind: MatchKind,
        left: L,
        right: R,
        left_key: KeySelector,
        right_key: KeySelector,
        rules: MatchRules,
    ) -> ValidationResult<Self>
    where
        L: Sequence + 'static,
        R: Sequence + 'static,
    {
        rules.validate(kind.name(), kind)?;
        Ok(Self {
            core: StageCore::new(ctx, kind.name()),
            kind,
            upstream: Box::new(left),
            right: Some(Box::new(right)),
            left_key,
            right_key,
            rules,
            lookup: None,
            pending: VecDeque::new(),
            done: false,
        })
    }

    fn mode(&self) -> LookupMode {
        match self.kind {
            MatchKind::Join => LookupMode::Multi,
            MatchKind::Expand | MatchKind::KeyTest => LookupMode::Single,
        }
    }

    fn prepare(&mut self) -> Result<(), OperationError> {
        if self.lookup.is_some() {
            return Ok(());
        }
        let mode = self.mode();
        let mut right = match self.right.take() {
            Some(right) => right,
            None => return Ok(()),
        };
        self.lookup = Some(LookupTable::build(&self.core, right.as_mut(), &self.right_key, mode)?);
        Ok(())
    }

    fn process(&mut self, row: Row) -> Result<(), OperationError> {
        let key = match self.left_key.key(&row) {
            Ok(key) => key,
            Err(source) => {
                let mut row = row;
                let err = OperationError::KeySelector {
                    stage: self.core.stage().to_string(),
                    row: row.to_debug_string(),
                    source,
                };
                self.core.release(&mut row);
                return Err(err);
            }
        };
        let matches = match (&key, &self.lookup) {
            (Some(key), Some(lookup)) => lookup.get(key),
            _ => &[],
        };
        let output = self.rules.apply(&self.core, self.kind, row, matches)?;
        self.pending.extend(output);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.done = true;
        if let Some(lookup) = self.lookup.take() {
            self.core.release_all(lookup.into_rows());
        }
        self.right = None;
        self.core.release_all(self.pending.drain(..));
    }
}

impl Sequence for LookupMatch {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        loop {
            if self.core.is_cancelled() {
                self.shutdown();
                return None;
            }
            if let Some(row) = self.pending.pop_front() {
                return Some(row);
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.prepare() {
                self.core.fail(err);
                self.shutdown();
                return None;
            }
            let row = match self.core.pull_from(self.upstream.as_mut()) {
                Some(row) => row,
                None => {
                    self.shutdown();
                    return None;
                }
            };
            if row.is_control() {
                return Some(row);
            }
            if let Err(err) = self.process(row) {
                self.core.fail(err);
                self.shutdown();
                return None;
            }
        }
    }
}

/// Selects the matching right row for a left row; returns an index into
/// the right rows, in load order.
pub type MatchSelector = Box<dyn FnMut(&Row, &[Row]) -> Result<Option<usize>, BoxError>>;

/// Expand whose match selection is supplied by the caller instead of a
/// key lookup.
pub struct CustomExpand {
    core: StageCore,
    upstream: BoxedSequence,
    right: Option<BoxedSequence>,
    right_rows: Option<Vec<Row>>,
    selector: MatchSelector,
    rules: MatchRules,
    pending: VecDeque<Row>,
    done: bool,
}

impl CustomExpand {
    pub fn new<L, R, F>(
        ctx: &Arc<ExecutionContext>,
        left: L,
        right: R,
        selector: F,
        rules: MatchRules,
    ) -> ValidationResult<Self>
    where
        L: Sequence + 'static,
        R: Sequence + 'static,
        F: FnMut(&Row, &[Row]) -> Result<Option<usize>, BoxError> + 'static,
    {
        rules.validate("CustomExpand", MatchKind::Expand)?;
        Ok(Self {
            core: StageCore::new(ctx, "CustomExpand"),
            upstream: Box::new(left),
            right: Some(Box::new(right)),
            right_rows: None,
            selector: Box::new(selector),
            rules,
            pending: VecDeque::new(),
            done: false,
        })
    }

    fn prepare(&mut self) {
        if let Some(mut right) = self.right.take() {
            let mut rows = Vec::new();
            while let Some(mut row) = self.core.pull_from(right.as_mut()) {
                if row.is_control() {
                    self.core.release(&mut row);
                } else {
                    rows.push(row);
                }
            }
            self.right_rows = Some(rows);
        }
    }

    fn process(&mut self, mut row: Row) -> Result<(), OperationError> {
        let right_rows = self.right_rows.as_deref().unwrap_or(&[]);
        let selected = match (self.selector)(&row, right_rows) {
            Ok(selected) => selected,
            Err(source) => {
                let err = OperationError::Handler {
                    stage: self.core.stage().to_string(),
                    row: row.to_debug_string(),
                    source,
                };
                self.core.release(&mut row);
                return Err(err);
            }
        };
        let matches = match selected {
            Some(index) => match right_rows.get(index) {
                Some(right) => std::slice::from_ref(right),
                None => {
                    let err = OperationError::Handler {
                        stage: self.core.stage().to_string(),
                        row: row.to_debug_string(),
                        source: format!("selected right row {} of {}", index, right_rows.len()).into(),
                    };
                    self.core.release(&mut row);
                    return Err(err);
                }
            },
            None => &[],
        };
        let output = self.rules.apply(&self.core, MatchKind::Expand, row, matches)?;
        self.pending.extend(output);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.right = None;
        if let Some(rows) = self.right_rows.take() {
            self.core.release_all(rows);
        }
        self.core.release_all(self.pending.drain(..));
    }
}

impl Sequence for CustomExpand {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        loop {
            if self.core.is_cancelled() {
                self.shutdown();
                return None;
            }
            if let Some(row) = self.pending.pop_front() {
                return Some(row);
            }
            if self.done {
                return None;
            }
            self.prepare();
            let row = match self.core.pull_from(self.upstream.as_mut()) {
                Some(row) => row,
                None => {
                    self.shutdown();
                    return None;
                }
            };
            if row.is_control() {
                return Some(row);
            }
            if let Err(err) = self.process(row) {
                self.core.fail(err);
                self.shutdown();
                return None;
            }
        }
    }
}
