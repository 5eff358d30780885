//! Key to right-row(s) lookup table.

use log::debug;
use std::collections::HashMap;

use crate::error::OperationError;
use crate::key::KeySelector;
use crate::models::Row;
use crate::sequence::{Sequence, StageCore};

/// How a lookup keeps rows that share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Last write wins (Expand).
    Single,
    /// Every row, in load order (Join).
    Multi,
}

/// Result of [`LookupTable::insert`].
#[derive(Debug)]
pub enum Insert {
    Added,
    /// Single mode only: the row that was displaced.
    Replaced(Row),
    /// The key was empty; the row is handed back.
    Rejected(Row),
}

/// Maps a key to one row or an ordered list of rows.
#[derive(Debug)]
pub struct LookupTable {
    mode: LookupMode,
    entries: HashMap<String, Vec<Row>>,
    row_count: usize,
}

impl LookupTable {
    pub fn new(mode: LookupMode) -> Self {
        Self {
            mode,
            entries: HashMap::new(),
            row_count: 0,
        }
    }

    pub fn mode(&self) -> LookupMode {
        self.mode
    }

    pub fn insert(&mut self, key: &str, row: Row) -> Insert {
        if key.is_empty() {
            return Insert::Rejected(row);
        }
        let rows = self.entries.entry(key.to_string()).or_default();
        match self.mode {
            LookupMode::Single if !rows.is_empty() => {
                let old = std::mem::replace(&mut rows[0], row);
                Insert::Replaced(old)
            }
            _ => {
                rows.push(row);
                self.row_count += 1;
                Insert::Added
            }
        }
    }

    /// Rows stored under `key`; empty for unknown or empty keys.
    pub fn get(&self, key: &str) -> &[Row] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes and returns the rows of `key`.
    pub fn take(&mut self, key: &str) -> Vec<Row> {
        let rows = self.entries.remove(key).unwrap_or_default();
        self.row_count -= rows.len();
        rows
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every stored row, consuming the table.
    pub fn into_rows(self) -> impl Iterator<Item = Row> {
        self.entries.into_values().flatten()
    }

    /// Fully evaluates `right` into a table owned by `core`'s stage.
    ///
    /// Control rows and rows without a key are released and skipped. Rows
    /// displaced in single mode are released too.
    pub fn build(
        core: &StageCore,
        right: &mut dyn Sequence,
        selector: &KeySelector,
        mode: LookupMode,
    ) -> Result<Self, OperationError> {
        let mut table = Self::new(mode);
        let mut skipped = 0usize;
        while let Some(mut row) = core.pull_from(right) {
            if row.is_control() {
                core.release(&mut row);
                continue;
            }
            let key = match selector.key(&row) {
                Ok(key) => key,
                Err(source) => {
                    let err = OperationError::KeySelector {
                        stage: core.stage().to_string(),
                        row: row.to_debug_string(),
                        source,
                    };
                    core.release(&mut row);
                    core.release_all(table.into_rows());
                    return Err(err);
                }
            };
            match key {
                None => {
                    skipped += 1;
                    core.release(&mut row);
                }
                Some(key) => match table.insert(&key, row) {
                    Insert::Added => {}
                    Insert::Replaced(mut old) | Insert::Rejected(mut old) => core.release(&mut old),
                },
            }
        }
        debug!(
            "{}: lookup built with {} key(s), {} row(s), {} right row(s) without key",
            core.stage(),
            table.key_count(),
            table.row_count(),
            skipped
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::ExecutionContext;
    use crate::models::Value;
    use crate::sequence::{record, RowSource};
    use std::sync::Arc;

    fn right(ctx: &Arc<ExecutionContext>) -> RowSource {
        RowSource::new(
            ctx,
            "Right",
            vec![
                record([("id", Value::from("a")), ("v", Value::Int(1))]),
                record([("id", Value::from("b")), ("v", Value::Int(2))]),
                record([("id", Value::from("a")), ("v", Value::Int(3))]),
                record([("id", Value::from("")), ("v", Value::Int(4))]),
                record([("id", Value::Null), ("v", Value::Int(5))]),
            ],
        )
    }

    #[test]
    fn test_multi_keeps_load_order() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let core = StageCore::new(&ctx, "Join");
        let table = LookupTable::build(&core, &mut right(&ctx), &KeySelector::columns(&["id"]), LookupMode::Multi).unwrap();
        let values: Vec<&Value> = table.get("a").iter().map(|r| r.get("v")).collect();
        assert_eq!(values, vec![&Value::Int(1), &Value::Int(3)]);
        assert_eq!(table.key_count(), 2);
        assert_eq!(table.row_count(), 3);
    }

    #[test]
    fn test_single_is_last_write_wins() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let core = StageCore::new(&ctx, "Expand");
        let table = LookupTable::build(&core, &mut right(&ctx), &KeySelector::columns(&["id"]), LookupMode::Single).unwrap();
        assert_eq!(table.get("a").len(), 1);
        assert_eq!(table.get("a")[0].get("v"), &Value::Int(3));
    }

    #[test]
    fn test_empty_keys_never_inserted() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let stage = ctx.register_stage("T");
        let mut table = LookupTable::new(LookupMode::Multi);
        assert!(matches!(table.insert("", ctx.create_row(&stage)), Insert::Rejected(_)));
        assert!(table.get("").is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_take_removes_key() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let stage = ctx.register_stage("T");
        let mut table = LookupTable::new(LookupMode::Multi);
        table.insert("k", ctx.create_row(&stage));
        table.insert("k", ctx.create_row(&stage));
        assert_eq!(table.take("k").len(), 2);
        assert_eq!(table.row_count(), 0);
        assert!(!table.contains_key("k"));
    }
}
