//! Row and value model.
//!
//! - [`Value`] - Dynamically-typed cell value (tagged union)
//! - [`RowError`] - Per-cell failure carried inline as a value
//! - [`Row`] - Named-column record with UID, owner, debug flag and tag
//! - [`StageRef`] - Identity of the stage owning a row
//! - [`DeferState`] - Progress of a row through a batched stage

mod row;
mod value;

pub use row::{DeferState, Row, RowTag, StageRef};
pub use value::{FromValue, RowError, Value, ValueKind};
