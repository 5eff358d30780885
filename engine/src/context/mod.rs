//! Execution context shared by every stage of a run.
//!
//! The context owns the run-wide mutable state:
//!
//! - row UID allocation (one atomic counter)
//! - the cancellation flag
//! - fatal error collection, deduplicated by instance identity
//! - sink registration and IO command counters
//! - the ownership-changed notification hook
//!
//! It is passed around as `Arc<ExecutionContext>`; nothing here is global,
//! so several pipelines can run isolated in one process.

mod sink;

pub use sink::{IoCommand, IoCommandKind, IoCommandStats, Sink};

use log::{debug, error, info, trace};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{PipelineError, PipelineFailure};
use crate::models::{Row, RowTag, StageRef, Value};
use sink::IoCounters;

/// Notification fired whenever a row changes owner.
#[derive(Debug, Clone)]
pub struct OwnershipChange {
    pub row_uid: u64,
    pub previous: Option<StageRef>,
    pub current: Option<StageRef>,
}

/// Diagnostics hook receiving every [`OwnershipChange`].
pub type OwnershipListener = Arc<dyn Fn(&OwnershipChange) + Send + Sync>;

/// Run-wide services used by every stage.
pub struct ExecutionContext {
    run_id: Uuid,
    config: EngineConfig,
    next_row_uid: AtomicU64,
    next_stage_id: AtomicU32,
    next_io_uid: AtomicU64,
    cancelled: AtomicBool,
    errors: Mutex<Vec<Arc<PipelineError>>>,
    sinks: Mutex<Vec<Arc<Sink>>>,
    io_counters: Arc<IoCounters>,
    ownership_listener: RwLock<Option<OwnershipListener>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutionContext {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let run_id = Uuid::new_v4();
        info!("execution context {} created", run_id);
        Arc::new(Self {
            run_id,
            config,
            next_row_uid: AtomicU64::new(0),
            next_stage_id: AtomicU32::new(0),
            next_io_uid: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            io_counters: Arc::new(IoCounters::default()),
            ownership_listener: RwLock::new(None),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Stages and rows
    // -------------------------------------------------------------------------

    /// Gives a stage its identity.
    pub fn register_stage(&self, name: &str) -> StageRef {
        let id = self.next_stage_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stage = StageRef::new(id, name);
        debug!("run {}: stage {} registered", self.run_id, stage);
        stage
    }

    fn next_uid(&self) -> u64 {
        self.next_row_uid.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Creates an empty row owned by `owner`.
    pub fn create_row(&self, owner: &StageRef) -> Row {
        Row::new(self.next_uid(), Some(owner.clone()), self.config.trace_rows)
    }

    /// Creates a row owned by `owner` holding `values`.
    pub fn create_row_with<K, V, I>(&self, owner: &StageRef, values: I) -> Row
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut row = self.create_row(owner);
        for (column, value) in values {
            row.set(column, value);
        }
        row
    }

    /// Creates a heartbeat marker row.
    pub fn create_heartbeat(&self, owner: &StageRef) -> Row {
        let mut row = Row::new(self.next_uid(), Some(owner.clone()), false);
        row.set_tag(RowTag::Heartbeat);
        row
    }

    /// Creates a row with a custom marker tag.
    pub fn create_marker(&self, owner: &StageRef, marker: &str) -> Row {
        let mut row = Row::new(self.next_uid(), Some(owner.clone()), false);
        row.set_tag(RowTag::Marker(marker.to_string()));
        row
    }

    /// Copies the values of `source` into a new row with a fresh UID.
    pub fn clone_row(&self, owner: &StageRef, source: &Row) -> Row {
        let mut row = Row::new(self.next_uid(), Some(owner.clone()), source.is_debug());
        for (column, value) in source.values() {
            row.set(column, value.clone());
        }
        row
    }

    /// Hands `row` to `stage`.
    pub fn transfer(&self, row: &mut Row, stage: &StageRef) {
        if row.owner() == Some(stage) {
            return;
        }
        let previous = row.replace_owner(Some(stage.clone()));
        self.notify_ownership(row.uid(), previous, Some(stage.clone()));
    }

    /// Leaves `row` without owner; used when a stage consumes a row without
    /// forwarding it.
    pub fn release(&self, row: &mut Row) {
        if let Some(previous) = row.replace_owner(None) {
            self.notify_ownership(row.uid(), Some(previous), None);
        }
    }

    pub fn set_ownership_listener(&self, listener: OwnershipListener) {
        let mut slot = self
            .ownership_listener
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(listener);
    }

    fn notify_ownership(&self, row_uid: u64, previous: Option<StageRef>, current: Option<StageRef>) {
        trace!(
            "row {} owner {} -> {}",
            row_uid,
            previous.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            current.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "-".into())
        );
        let listener = self
            .ownership_listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(&OwnershipChange {
                row_uid,
                previous,
                current,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Cancellation and errors
    // -------------------------------------------------------------------------

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!("run {} cancelled", self.run_id);
        }
    }

    /// Records a fatal error and cancels the run.
    ///
    /// Returns `false` when this very instance was already registered.
    pub fn register_error(&self, err: &Arc<PipelineError>) -> bool {
        {
            let mut errors = lock(&self.errors);
            if errors.iter().any(|known| Arc::ptr_eq(known, err)) {
                return false;
            }
            errors.push(Arc::clone(err));
        }
        error!("run {}: {}", self.run_id, err);
        self.cancel();
        true
    }

    /// Wraps `err`, registers it and returns the shared instance.
    pub fn fail(&self, err: impl Into<PipelineError>) -> Arc<PipelineError> {
        let err = Arc::new(err.into());
        self.register_error(&err);
        err
    }

    pub fn errors(&self) -> Vec<Arc<PipelineError>> {
        lock(&self.errors).clone()
    }

    pub fn has_errors(&self) -> bool {
        !lock(&self.errors).is_empty()
    }

    /// The collected errors as a failure, `None` when the run is clean.
    pub fn failure(&self) -> Option<PipelineFailure> {
        let errors = self.errors();
        (!errors.is_empty()).then_some(PipelineFailure { errors })
    }

    // -------------------------------------------------------------------------
    // Sinks and IO commands
    // -------------------------------------------------------------------------

    /// The sink for `{location, path}`, registered on first use.
    pub fn get_sink(&self, location: &str, path: &str) -> Arc<Sink> {
        let mut sinks = lock(&self.sinks);
        if let Some(sink) = sinks
            .iter()
            .find(|s| s.location() == location && s.path() == path)
        {
            return Arc::clone(sink);
        }
        let sink = Arc::new(Sink::new(sinks.len() as u64 + 1, location, path));
        info!("run {}: sink #{} registered: {}/{}", self.run_id, sink.uid(), location, path);
        sinks.push(Arc::clone(&sink));
        sink
    }

    pub fn sinks(&self) -> Vec<Arc<Sink>> {
        lock(&self.sinks).clone()
    }

    pub fn begin_io_command(
        &self,
        kind: IoCommandKind,
        location: &str,
        path: &str,
        sink: Option<Arc<Sink>>,
        message: &str,
    ) -> IoCommand {
        let uid = self.next_io_uid.fetch_add(1, Ordering::Relaxed) + 1;
        IoCommand::begin(
            uid,
            kind,
            location,
            path,
            sink,
            Arc::clone(&self.io_counters),
            message,
        )
    }

    pub fn io_stats(&self) -> IoCommandStats {
        self.io_counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CsvError;
    use std::collections::HashSet;
    use std::thread;

    fn ctx() -> Arc<ExecutionContext> {
        ExecutionContext::new(EngineConfig::default())
    }

    #[test]
    fn test_uids_strictly_increase() {
        let ctx = ctx();
        let stage = ctx.register_stage("Source");
        let uids: Vec<u64> = (0..5).map(|_| ctx.create_row(&stage).uid()).collect();
        assert!(uids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_uids_unique_across_threads() {
        let ctx = ctx();
        let stage = ctx.register_stage("Source");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                let stage = stage.clone();
                thread::spawn(move || (0..500).map(|_| ctx.create_row(&stage).uid()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for uid in handle.join().unwrap() {
                assert!(seen.insert(uid));
            }
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn test_clone_row_gets_fresh_uid() {
        let ctx = ctx();
        let stage = ctx.register_stage("Join");
        let original = ctx.create_row_with(&stage, [("a", 1), ("b", 2)]);
        let copy = ctx.clone_row(&stage, &original);
        assert_ne!(copy.uid(), original.uid());
        assert_eq!(copy.get("b"), &Value::Int(2));
    }

    #[test]
    fn test_transfer_fires_notification() {
        let ctx = ctx();
        let a = ctx.register_stage("A");
        let b = ctx.register_stage("B");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.set_ownership_listener(Arc::new(move |change: &OwnershipChange| {
            sink.lock().unwrap().push((change.previous.clone(), change.current.clone()));
        }));

        let mut row = ctx.create_row(&a);
        ctx.transfer(&mut row, &b);
        ctx.transfer(&mut row, &b);
        ctx.release(&mut row);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (Some(a), Some(b.clone())));
        assert_eq!(seen[1], (Some(b), None));
        assert!(row.owner().is_none());
    }

    #[test]
    fn test_error_registered_once_and_cancels() {
        let ctx = ctx();
        assert!(!ctx.is_cancelled());
        let err = Arc::new(PipelineError::Csv(CsvError::EmptyFile));
        assert!(ctx.register_error(&err));
        assert!(!ctx.register_error(&err));
        assert!(ctx.is_cancelled());

        // a distinct instance with the same content is a new error
        ctx.fail(CsvError::EmptyFile);
        assert_eq!(ctx.errors().len(), 2);
        assert_eq!(ctx.failure().unwrap().errors.len(), 2);
    }

    #[test]
    fn test_sink_registered_once() {
        let ctx = ctx();
        let a = ctx.get_sink("db", "dbo.people");
        let b = ctx.get_sink("db", "dbo.people");
        let c = ctx.get_sink("db", "dbo.orders");
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(a.uid(), c.uid());
        assert_eq!(ctx.sinks().len(), 2);
    }

    #[test]
    fn test_io_command_updates_sink_and_stats() {
        let ctx = ctx();
        let sink = ctx.get_sink("file", "out.jsonl");
        let cmd = ctx.begin_io_command(IoCommandKind::Write, "file", "out.jsonl", Some(Arc::clone(&sink)), "batch");
        cmd.end(4);
        assert_eq!(sink.rows_written(), 4);
        assert_eq!(ctx.io_stats().succeeded, 1);
    }
}
