//! Match and no-match policies, column copies and the per-row match logic
//! shared by the eager and deferred operations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BoxError, OperationError, ValidationError, ValidationResult};
use crate::models::Row;
use crate::sequence::StageCore;

/// Handler invoked with the left row and the matched right row.
pub type MatchHandler = Box<dyn FnMut(&mut Row, &Row) -> Result<(), BoxError>>;

/// Handler invoked with a left row that found no match.
pub type NoMatchHandler = Box<dyn FnMut(&mut Row) -> Result<(), BoxError>>;

/// What happens to a left row that found a match.
pub enum MatchAction {
    /// Drop the row from the stream.
    Remove,
    /// Abort the run.
    Throw,
    /// Invoke a handler (after the configured columns were copied).
    Custom(MatchHandler),
}

impl MatchAction {
    pub fn custom<F>(f: F) -> Self
    where
        F: FnMut(&mut Row, &Row) -> Result<(), BoxError> + 'static,
    {
        MatchAction::Custom(Box::new(f))
    }
}

/// What happens to a left row that found no match.
pub enum NoMatchAction {
    /// Drop the row from the stream.
    Remove,
    /// Abort the run.
    Throw,
    /// Invoke a handler, then keep the row.
    Custom(NoMatchHandler),
}

impl NoMatchAction {
    pub fn custom<F>(f: F) -> Self
    where
        F: FnMut(&mut Row) -> Result<(), BoxError> + 'static,
    {
        NoMatchAction::Custom(Box::new(f))
    }
}

impl fmt::Debug for MatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchAction::Remove => f.write_str("Remove"),
            MatchAction::Throw => f.write_str("Throw"),
            MatchAction::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl fmt::Debug for NoMatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoMatchAction::Remove => f.write_str("Remove"),
            NoMatchAction::Throw => f.write_str("Throw"),
            NoMatchAction::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Copies one right-row column into the left row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnCopy {
    pub from: String,
    pub to: String,
}

impl ColumnCopy {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Copies a column under the same name.
    pub fn same(column: &str) -> Self {
        Self::new(column, column)
    }

    /// Parses `from` or `from:to`.
    pub fn parse(text: &str) -> Self {
        match text.split_once(':') {
            Some((from, to)) => Self::new(from.trim(), to.trim()),
            None => Self::same(text.trim()),
        }
    }

    pub fn apply_all(copies: &[ColumnCopy], source: &Row, target: &mut Row) {
        for copy in copies {
            target.set(copy.to.as_str(), source.get(&copy.from).clone());
        }
    }
}

/// Shape of a key-based operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// At most one match; columns copied into the left row.
    Expand,
    /// Every match; extra matches produce clones of the left row.
    Join,
    /// No copying; only the match / no-match actions apply.
    KeyTest,
}

impl MatchKind {
    pub fn name(self) -> &'static str {
        match self {
            MatchKind::Expand => "Expand",
            MatchKind::Join => "Join",
            MatchKind::KeyTest => "KeyTest",
        }
    }
}

/// Column copies plus match / no-match actions of one operation.
#[derive(Debug, Default)]
pub struct MatchRules {
    pub copies: Vec<ColumnCopy>,
    pub on_match: Option<MatchAction>,
    pub on_no_match: Option<NoMatchAction>,
}

impl MatchRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(mut self, copy: ColumnCopy) -> Self {
        self.copies.push(copy);
        self
    }

    pub fn copies(mut self, copies: impl IntoIterator<Item = ColumnCopy>) -> Self {
        self.copies.extend(copies);
        self
    }

    pub fn on_match(mut self, action: MatchAction) -> Self {
        self.on_match = Some(action);
        self
    }

    pub fn on_no_match(mut self, action: NoMatchAction) -> Self {
        self.on_no_match = Some(action);
        self
    }

    /// Rejects configurations under which the operation would be pointless.
    pub fn validate(&self, stage: &str, kind: MatchKind) -> ValidationResult<()> {
        let contradiction = match (&self.on_match, &self.on_no_match) {
            (Some(MatchAction::Remove), Some(NoMatchAction::Remove)) => {
                Some("both match and no-match actions remove the row, nothing would be kept")
            }
            (Some(MatchAction::Throw), Some(NoMatchAction::Throw)) => {
                Some("both match and no-match actions throw, every row would abort the run")
            }
            _ => None,
        };
        if let Some(message) = contradiction {
            return Err(ValidationError::ContradictoryActions {
                stage: stage.to_string(),
                message: message.to_string(),
            });
        }

        let copies_anything = kind != MatchKind::KeyTest && !self.copies.is_empty();
        if self.on_match.is_none() && self.on_no_match.is_none() && !copies_anything {
            return Err(ValidationError::MissingParameter {
                stage: stage.to_string(),
                parameter: "match_action",
            });
        }
        Ok(())
    }

    /// Applies the rules to one left row and returns the rows to emit.
    ///
    /// `matches` are the right rows found for the row's key, in load order.
    /// Rows that are not emitted are released.
    pub fn apply(
        &mut self,
        core: &StageCore,
        kind: MatchKind,
        mut row: Row,
        matches: &[Row],
    ) -> Result<Vec<Row>, OperationError> {
        if matches.is_empty() {
            return self.no_match(core, row);
        }

        match &mut self.on_match {
            Some(MatchAction::Remove) => {
                core.release(&mut row);
                return Ok(Vec::new());
            }
            Some(MatchAction::Throw) => {
                let err = OperationError::UnexpectedMatch {
                    stage: core.stage().to_string(),
                    row: row.to_debug_string(),
                };
                core.release(&mut row);
                return Err(err);
            }
            _ => {}
        }

        let used = match kind {
            MatchKind::Join => matches.len(),
            MatchKind::Expand | MatchKind::KeyTest => 1,
        };
        // clones come from the untouched left row
        let mut output = Vec::with_capacity(used);
        output.push(row);
        for _ in 1..used {
            let clone = core.clone_row(&output[0]);
            output.push(clone);
        }

        for (i, right) in matches.iter().take(used).enumerate() {
            let target = &mut output[i];
            if kind != MatchKind::KeyTest {
                ColumnCopy::apply_all(&self.copies, right, target);
            }
            if let Some(MatchAction::Custom(handler)) = &mut self.on_match {
                if let Err(source) = handler(target, right) {
                    let err = OperationError::Handler {
                        stage: core.stage().to_string(),
                        row: target.to_debug_string(),
                        source,
                    };
                    core.release_all(output);
                    return Err(err);
                }
            }
        }
        Ok(output)
    }

    /// The no-match path, also used for rows without a key.
    pub fn no_match(&mut self, core: &StageCore, mut row: Row) -> Result<Vec<Row>, OperationError> {
        match &mut self.on_no_match {
            None => Ok(vec![row]),
            Some(NoMatchAction::Remove) => {
                core.release(&mut row);
                Ok(Vec::new())
            }
            Some(NoMatchAction::Throw) => {
                let err = OperationError::NoMatch {
                    stage: core.stage().to_string(),
                    row: row.to_debug_string(),
                };
                core.release(&mut row);
                Err(err)
            }
            Some(NoMatchAction::Custom(handler)) => match handler(&mut row) {
                Ok(()) => Ok(vec![row]),
                Err(source) => {
                    let err = OperationError::Handler {
                        stage: core.stage().to_string(),
                        row: row.to_debug_string(),
                        source,
                    };
                    core.release(&mut row);
                    Err(err)
                }
            },
        }
    }
}
