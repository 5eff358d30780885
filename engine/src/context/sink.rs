//! Sink and IO command tracking.
//!
//! A [`Sink`] is one external write destination, registered once per
//! `{location, path}`. An [`IoCommand`] is one external call with a
//! `begin -> end | failed` lifecycle; both endings record the affected row
//! delta so the counters stay consistent on error.

use log::{debug, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One external write destination.
#[derive(Debug)]
pub struct Sink {
    uid: u64,
    location: String,
    path: String,
    rows_written: AtomicU64,
}

impl Sink {
    pub(crate) fn new(uid: u64, location: &str, path: &str) -> Self {
        Self {
            uid,
            location: location.to_string(),
            path: path.to_string(),
            rows_written: AtomicU64::new(0),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Rows written so far. Never decreases.
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn increase_rows_written(&self, count: u64) {
        self.rows_written.fetch_add(count, Ordering::Relaxed);
    }
}

/// What an IO command talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoCommandKind {
    Read,
    Write,
    Query,
    HttpRequest,
    Other,
}

#[derive(Debug, Default)]
pub(crate) struct IoCounters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    affected_rows: AtomicU64,
}

impl IoCounters {
    pub(crate) fn snapshot(&self) -> IoCommandStats {
        IoCommandStats {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            affected_rows: self.affected_rows.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the IO command counters of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IoCommandStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub affected_rows: u64,
}

/// One in-flight external call.
///
/// Finish it with [`IoCommand::end`] or [`IoCommand::failed`]. A command
/// dropped without either is counted as failed.
pub struct IoCommand {
    uid: u64,
    kind: IoCommandKind,
    location: String,
    path: String,
    sink: Option<Arc<Sink>>,
    started: Instant,
    counters: Arc<IoCounters>,
    finished: bool,
}

impl IoCommand {
    pub(crate) fn begin(
        uid: u64,
        kind: IoCommandKind,
        location: &str,
        path: &str,
        sink: Option<Arc<Sink>>,
        counters: Arc<IoCounters>,
        message: &str,
    ) -> Self {
        counters.started.fetch_add(1, Ordering::Relaxed);
        debug!("io #{} {:?} {}/{} begin: {}", uid, kind, location, path, message);
        Self {
            uid,
            kind,
            location: location.to_string(),
            path: path.to_string(),
            sink,
            started: Instant::now(),
            counters,
            finished: false,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn kind(&self) -> IoCommandKind {
        self.kind
    }

    pub fn sink(&self) -> Option<&Arc<Sink>> {
        self.sink.as_ref()
    }

    /// Successful completion.
    pub fn end(mut self, affected_rows: u64) -> Duration {
        let elapsed = self.record(affected_rows);
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        debug!(
            "io #{} {}/{} end: {} row(s) in {:?}",
            self.uid, self.location, self.path, affected_rows, elapsed
        );
        elapsed
    }

    /// Failed completion; still records the rows that were affected.
    pub fn failed(mut self, affected_rows: u64, error: &dyn fmt::Display) -> Duration {
        let elapsed = self.record(affected_rows);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            "io #{} {}/{} failed after {} row(s) in {:?}: {}",
            self.uid, self.location, self.path, affected_rows, elapsed, error
        );
        elapsed
    }

    fn record(&mut self, affected_rows: u64) -> Duration {
        self.finished = true;
        self.counters
            .affected_rows
            .fetch_add(affected_rows, Ordering::Relaxed);
        if self.kind == IoCommandKind::Write {
            if let Some(sink) = &self.sink {
                sink.increase_rows_written(affected_rows);
            }
        }
        self.started.elapsed()
    }
}

impl Drop for IoCommand {
    fn drop(&mut self) {
        if !self.finished {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("io #{} {}/{} dropped without completion", self.uid, self.location, self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(kind: IoCommandKind, sink: Option<Arc<Sink>>, counters: &Arc<IoCounters>) -> IoCommand {
        IoCommand::begin(1, kind, "db", "dbo.t", sink, Arc::clone(counters), "test")
    }

    #[test]
    fn test_end_records_rows_on_sink() {
        let counters = Arc::new(IoCounters::default());
        let sink = Arc::new(Sink::new(1, "db", "dbo.t"));
        command(IoCommandKind::Write, Some(Arc::clone(&sink)), &counters).end(10);
        command(IoCommandKind::Write, Some(Arc::clone(&sink)), &counters).end(5);
        assert_eq!(sink.rows_written(), 15);
        let stats = counters.snapshot();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.affected_rows, 15);
    }

    #[test]
    fn test_failed_keeps_bookkeeping() {
        let counters = Arc::new(IoCounters::default());
        let sink = Arc::new(Sink::new(1, "db", "dbo.t"));
        command(IoCommandKind::Write, Some(Arc::clone(&sink)), &counters).failed(3, &"timeout");
        let stats = counters.snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.affected_rows, 3);
        assert_eq!(sink.rows_written(), 3);
    }

    #[test]
    fn test_read_does_not_touch_sink() {
        let counters = Arc::new(IoCounters::default());
        let sink = Arc::new(Sink::new(1, "db", "dbo.t"));
        command(IoCommandKind::Read, Some(Arc::clone(&sink)), &counters).end(7);
        assert_eq!(sink.rows_written(), 0);
    }

    #[test]
    fn test_dropped_command_counts_as_failed() {
        let counters = Arc::new(IoCounters::default());
        drop(command(IoCommandKind::Query, None, &counters));
        assert_eq!(counters.snapshot().failed, 1);
    }
}
