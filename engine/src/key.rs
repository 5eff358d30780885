//! Group keys and key selectors.
//!
//! Aggregation grouping and matching-engine lookups use the same key
//! algorithm: the text of each configured column, in order, joined by
//! [`KEY_SEPARATOR`]. A missing or null column renders as [`NULL_KEY_PART`].
//! Column text that could be mistaken for the sentinel or the separator is
//! escaped, so two rows share a key exactly when their key columns render
//! to the same text.

use std::fmt;
use std::sync::Arc;

use crate::error::BoxError;
use crate::models::Row;

/// Separator between the parts of a composite key.
pub const KEY_SEPARATOR: char = '\0';

/// Key part of a missing or null value.
pub const NULL_KEY_PART: &str = "-";

/// Builds the group key of `row` over `columns`.
pub fn group_key<S: AsRef<str>>(row: &Row, columns: &[S]) -> String {
    let mut key = String::new();
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        let value = row.get(column.as_ref());
        if value.is_null() {
            key.push_str(NULL_KEY_PART);
        } else {
            push_escaped(&mut key, &value.to_string());
        }
    }
    key
}

fn push_escaped(key: &mut String, text: &str) {
    if text.starts_with('-') || text.starts_with('\\') {
        key.push('\\');
    }
    for c in text.chars() {
        match c {
            KEY_SEPARATOR => key.push_str("\\0"),
            '\\' => key.push_str("\\\\"),
            c => key.push(c),
        }
    }
}

type KeyFn = dyn Fn(&Row) -> Result<Option<String>, BoxError>;

/// Computes the lookup key of a row.
///
/// An empty or absent key means "no key": the row is never inserted into
/// a lookup and never matches.
#[derive(Clone)]
pub struct KeySelector {
    inner: Selector,
}

#[derive(Clone)]
enum Selector {
    Columns(Vec<String>),
    Custom { name: String, f: Arc<KeyFn> },
}

impl KeySelector {
    /// Key over `columns` using [`group_key`]. Rows whose key columns are
    /// all missing or null have no key.
    pub fn columns<S: AsRef<str>>(columns: &[S]) -> Self {
        Self {
            inner: Selector::Columns(columns.iter().map(|c| c.as_ref().to_string()).collect()),
        }
    }

    /// Caller-supplied key function.
    pub fn custom<F>(name: &str, f: F) -> Self
    where
        F: Fn(&Row) -> Result<Option<String>, BoxError> + 'static,
    {
        Self {
            inner: Selector::Custom {
                name: name.to_string(),
                f: Arc::new(f),
            },
        }
    }

    pub fn key(&self, row: &Row) -> Result<Option<String>, BoxError> {
        let key = match &self.inner {
            Selector::Columns(columns) => {
                if columns.iter().all(|c| row.get(c).is_null()) {
                    return Ok(None);
                }
                Some(group_key(row, columns))
            }
            Selector::Custom { f, .. } => f(row)?,
        };
        Ok(key.filter(|k| !k.is_empty()))
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Selector::Columns(columns) => write!(f, "KeySelector::columns({:?})", columns),
            Selector::Custom { name, .. } => write!(f, "KeySelector::custom({})", name),
        }
    }
}
