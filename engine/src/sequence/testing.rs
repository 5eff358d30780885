//! Scripted sources and ownership bookkeeping shared by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Record, Sequence, StageCore};
use crate::context::{ExecutionContext, OwnershipChange};
use crate::models::{Row, StageRef};

/// One step of a [`ScriptedSource`].
pub enum Step {
    Data(Record),
    Heartbeat,
    Marker(&'static str),
}

/// Yields data rows, heartbeats and markers in a fixed order.
pub struct ScriptedSource {
    core: StageCore,
    steps: std::vec::IntoIter<Step>,
}

impl ScriptedSource {
    pub fn new(ctx: &Arc<ExecutionContext>, steps: Vec<Step>) -> Self {
        Self {
            core: StageCore::new(ctx, "Scripted"),
            steps: steps.into_iter(),
        }
    }
}

impl Sequence for ScriptedSource {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        if self.core.is_cancelled() {
            return None;
        }
        let ctx = self.core.ctx();
        let stage = self.core.stage();
        Some(match self.steps.next()? {
            Step::Data(values) => ctx.create_row_with(stage, values),
            Step::Heartbeat => ctx.create_heartbeat(stage),
            Step::Marker(marker) => ctx.create_marker(stage, marker),
        })
    }
}

/// Last known owner (by stage name) of every row that changed hands.
#[derive(Clone, Default)]
pub struct Owners {
    last: Arc<Mutex<HashMap<u64, Option<String>>>>,
}

impl Owners {
    pub fn watch(ctx: &ExecutionContext) -> Self {
        let owners = Self::default();
        let last = Arc::clone(&owners.last);
        ctx.set_ownership_listener(Arc::new(move |change: &OwnershipChange| {
            let owner = change.current.as_ref().map(|s| s.name().to_string());
            last.lock().unwrap().insert(change.row_uid, owner);
        }));
        owners
    }

    /// Rows whose last owner is the stage named `name`.
    pub fn held_by(&self, name: &str) -> usize {
        self.last
            .lock()
            .unwrap()
            .values()
            .filter(|owner| owner.as_deref() == Some(name))
            .count()
    }

    pub fn owned(&self) -> usize {
        self.last.lock().unwrap().values().filter(|o| o.is_some()).count()
    }

    /// Rows that ended up without owner.
    pub fn released(&self) -> usize {
        self.last.lock().unwrap().values().filter(|o| o.is_none()).count()
    }
}
