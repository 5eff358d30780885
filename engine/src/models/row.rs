//! The row: a named-column, dynamically-typed record.
//!
//! Rows are only created by [`crate::context::ExecutionContext`], which
//! stamps a run-wide unique UID. A row is owned by exactly one stage at a
//! time; the owner is changed through the context so every transfer fires
//! the ownership notification.

use log::trace;
use serde_json::Map;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use super::value::{FromValue, RowError, Value};
use crate::error::{ValueError, ValueResult};

static NULL: Value = Value::Null;

/// Identity of a pipeline stage, used as the row owner reference.
#[derive(Debug, Clone)]
pub struct StageRef {
    id: u32,
    name: Arc<str>,
}

impl StageRef {
    pub(crate) fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: Arc::from(name),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for StageRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for StageRef {}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Control markers carried by a row. Stages forward tagged rows unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowTag {
    /// Gives buffering stages a chance to flush on schedule.
    Heartbeat,
    /// Caller-defined marker.
    Marker(String),
}

/// Progress of a row through a deferred (batched) stage. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DeferState {
    #[default]
    None,
    /// Held in a batch until the batch is resolved.
    DeferWait,
    /// Released into the output after its batch was resolved.
    DeferDone,
}

/// One unit of data flowing through the pipeline.
#[derive(Debug)]
pub struct Row {
    uid: u64,
    values: Vec<(String, Value)>,
    owner: Option<StageRef>,
    debug: bool,
    tag: Option<RowTag>,
    defer_state: DeferState,
}

impl Row {
    pub(crate) fn new(uid: u64, owner: Option<StageRef>, debug: bool) -> Self {
        Self {
            uid,
            values: Vec::new(),
            owner,
            debug,
            tag: None,
            defer_state: DeferState::None,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// The stage currently responsible for this row.
    pub fn owner(&self) -> Option<&StageRef> {
        self.owner.as_ref()
    }

    pub(crate) fn replace_owner(&mut self, owner: Option<StageRef>) -> Option<StageRef> {
        std::mem::replace(&mut self.owner, owner)
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Flags the row; flagged rows trace every column change.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn tag(&self) -> Option<&RowTag> {
        self.tag.as_ref()
    }

    pub(crate) fn set_tag(&mut self, tag: RowTag) {
        self.tag = Some(tag);
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.tag, Some(RowTag::Heartbeat))
    }

    /// True for heartbeats and caller markers. Control rows are never data:
    /// they are not filtered, matched, grouped or counted.
    pub fn is_control(&self) -> bool {
        self.tag.is_some()
    }

    pub fn defer_state(&self) -> DeferState {
        self.defer_state
    }

    pub(crate) fn advance_defer_state(&mut self, next: DeferState) {
        debug_assert!(
            next > self.defer_state,
            "defer state of row {} cannot go from {:?} to {:?}",
            self.uid,
            self.defer_state,
            next
        );
        if next > self.defer_state {
            self.defer_state = next;
        }
    }

    /// Value of a column, [`Value::Null`] when absent.
    pub fn get(&self, column: &str) -> &Value {
        self.get_opt(column).unwrap_or(&NULL)
    }

    pub fn get_opt(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Typed read of a column.
    ///
    /// Absent and null columns read as `Ok(None)`. A value of another kind
    /// is a programming error and reported as [`ValueError::TypeMismatch`].
    pub fn get_as<T: FromValue>(&self, column: &str) -> ValueResult<Option<T>> {
        match self.get(column) {
            Value::Null => Ok(None),
            value => T::from_value(value)
                .map(Some)
                .ok_or_else(|| ValueError::TypeMismatch {
                    column: column.to_string(),
                    expected: T::EXPECTED,
                    actual: value.type_name(),
                }),
        }
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        if self.debug {
            trace!(
                "row {} [{}] set {} = ({}) {}",
                self.uid,
                self.owner_name(),
                column,
                value.type_name(),
                value
            );
        }
        match self.values.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((column, value)),
        }
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let index = self.values.iter().position(|(name, _)| name == column)?;
        if self.debug {
            trace!("row {} [{}] remove {}", self.uid, self.owner_name(), column);
        }
        Some(self.values.remove(index).1)
    }

    /// All `(column, value)` pairs in insertion order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.get_opt(column).is_some()
    }

    /// True when every value is null or an empty string.
    pub fn is_null_or_empty(&self) -> bool {
        self.values.iter().all(|(_, v)| v.is_null_or_empty())
    }

    /// True when any value is a [`RowError`].
    pub fn has_error(&self) -> bool {
        self.values.iter().any(|(_, v)| v.is_error())
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &RowError)> {
        self.values
            .iter()
            .filter_map(|(name, v)| v.as_error().map(|e| (name.as_str(), e)))
    }

    fn owner_name(&self) -> &str {
        self.owner.as_ref().map(|o| o.name()).unwrap_or("-")
    }

    /// Multi-line dump: UID line, then `[column] = (type) value` per column.
    pub fn to_debug_string(&self) -> String {
        let mut out = format!("uid: {}", self.uid);
        if self.debug {
            out.push_str(", flagged");
        }
        if let Some(tag) = &self.tag {
            let _ = write!(out, ", tag: {:?}", tag);
        }
        for (name, value) in &self.values {
            let _ = write!(out, "\n[{}] = ({}) {}", name, value.type_name(), value);
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row::new(1, Some(StageRef::new(1, "Test")), false)
    }

    #[test]
    fn test_missing_column_reads_null() {
        let r = row();
        assert_eq!(r.get("nope"), &Value::Null);
        assert!(r.get_opt("nope").is_none());
        assert_eq!(r.get_as::<i64>("nope").unwrap(), None);
    }

    #[test]
    fn test_set_replaces_in_place_keeping_order() {
        let mut r = row();
        r.set("a", 1);
        r.set("b", "x");
        r.set("a", 2);
        let cols: Vec<&str> = r.values().map(|(c, _)| c).collect();
        assert_eq!(cols, vec!["a", "b"]);
        assert_eq!(r.get("a"), &Value::Int(2));
    }

    #[test]
    fn test_column_names_are_case_sensitive() {
        let mut r = row();
        r.set("Name", "a");
        r.set("name", "b");
        assert_eq!(r.column_count(), 2);
    }

    #[test]
    fn test_remove() {
        let mut r = row();
        r.set("a", 1);
        assert_eq!(r.remove("a"), Some(Value::Int(1)));
        assert_eq!(r.remove("a"), None);
        assert!(!r.has_column("a"));
    }

    #[test]
    fn test_typed_getter_mismatch_is_error() {
        let mut r = row();
        r.set("a", "text");
        let err = r.get_as::<i32>("a").unwrap_err();
        assert!(err.to_string().contains("String"));
    }

    #[test]
    fn test_null_or_empty() {
        let mut r = row();
        assert!(r.is_null_or_empty());
        r.set("a", "");
        r.set("b", Value::Null);
        assert!(r.is_null_or_empty());
        r.set("c", 0);
        assert!(!r.is_null_or_empty());
    }

    #[test]
    fn test_row_error_round_trip() {
        let mut r = row();
        r.set("a", RowError::new("Convert", "bad", Value::from("x")));
        assert!(r.has_error());
        assert_eq!(r.errors().count(), 1);
        r.set("a", 5);
        assert!(!r.has_error());
    }

    #[test]
    fn test_defer_state_moves_forward() {
        let mut r = row();
        assert_eq!(r.defer_state(), DeferState::None);
        r.advance_defer_state(DeferState::DeferWait);
        r.advance_defer_state(DeferState::DeferDone);
        assert_eq!(r.defer_state(), DeferState::DeferDone);
    }

    #[test]
    fn test_debug_string() {
        let mut r = row();
        r.set_debug(true);
        r.set("name", "Ann");
        r.set("age", 30i64);
        let dump = r.to_debug_string();
        assert!(dump.starts_with("uid: 1, flagged"));
        assert!(dump.contains("[name] = (String) Ann"));
        assert!(dump.contains("[age] = (Long) 30"));
    }

    #[test]
    fn test_to_json_keeps_columns() {
        let mut r = row();
        r.set("a", 1);
        r.set("b", Value::Null);
        let json = r.to_json();
        assert_eq!(json["a"], 1);
        assert!(json["b"].is_null());
    }
}
