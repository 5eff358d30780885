//! Row writers and the batched writer stage.
//!
//! A [`RowWriter`] persists one batch at a time. [`BatchedWriter`] is the
//! pipeline stage in front of it: it registers a sink with the context,
//! buffers rows, and flushes on size, on idle timeout (checked on every
//! pull, control rows included) and at end of input. Each flush is one IO
//! command and holds the writer lock for its whole duration, so a caller
//! sharing the writer through [`SharedWriter`] never sees half a batch.

use log::debug;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{BoxedSequence, Sequence, StageCore};
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, IoCommandKind, Sink};
use crate::error::{SinkError, SinkResult};
use crate::models::{Row, StageRef};

/// Destination for batches of rows.
pub trait RowWriter: Send {
    /// Writes `rows` and returns how many were written.
    fn write_batch(&mut self, rows: &[Row]) -> SinkResult<usize>;
}

/// Writes one JSON object per line.
pub struct JsonLinesWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> RowWriter for JsonLinesWriter<W> {
    fn write_batch(&mut self, rows: &[Row]) -> SinkResult<usize> {
        for row in rows {
            serde_json::to_writer(&mut self.out, &row.to_json())?;
            self.out.write_all(b"\n")?;
        }
        self.out.flush()?;
        Ok(rows.len())
    }
}

/// Keeps written rows as JSON in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    rows: Arc<Mutex<Vec<JsonValue>>>,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<JsonValue> {
        lock(&self.rows).clone()
    }

    /// Size of every batch written so far.
    pub fn batches(&self) -> Vec<usize> {
        lock(&self.batches).clone()
    }
}

impl RowWriter for MemoryWriter {
    fn write_batch(&mut self, rows: &[Row]) -> SinkResult<usize> {
        lock(&self.rows).extend(rows.iter().map(Row::to_json));
        lock(&self.batches).push(rows.len());
        Ok(rows.len())
    }
}

/// Writer handle that several stages or threads can hold at once.
pub type SharedWriter = Arc<Mutex<Box<dyn RowWriter>>>;

/// Wraps a writer into a [`SharedWriter`].
pub fn shared_writer<W: RowWriter + 'static>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Batching knobs of [`BatchedWriter`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    pub batch_size: usize,
    pub idle_timeout: Duration,
}

impl WriterOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.writer_batch_size,
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Stage writing every data row to a [`RowWriter`], then forwarding it.
pub struct BatchedWriter {
    core: StageCore,
    upstream: BoxedSequence,
    writer: SharedWriter,
    sink: Arc<Sink>,
    options: WriterOptions,
    buffer: Vec<Row>,
    ready: VecDeque<Row>,
    last_added: Instant,
    done: bool,
}

impl BatchedWriter {
    pub fn new<S, W>(
        ctx: &Arc<ExecutionContext>,
        upstream: S,
        writer: W,
        location: &str,
        path: &str,
        options: WriterOptions,
    ) -> Self
    where
        S: Sequence + 'static,
        W: RowWriter + 'static,
    {
        Self::shared(ctx, upstream, shared_writer(writer), location, path, options)
    }

    /// Writes through a writer the caller keeps a handle to.
    pub fn shared<S>(
        ctx: &Arc<ExecutionContext>,
        upstream: S,
        writer: SharedWriter,
        location: &str,
        path: &str,
        options: WriterOptions,
    ) -> Self
    where
        S: Sequence + 'static,
    {
        Self {
            core: StageCore::new(ctx, "BatchedWriter"),
            upstream: Box::new(upstream),
            writer,
            sink: ctx.get_sink(location, path),
            options,
            buffer: Vec::new(),
            ready: VecDeque::new(),
            last_added: Instant::now(),
            done: false,
        }
    }

    pub fn sink(&self) -> &Arc<Sink> {
        &self.sink
    }

    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    fn flush(&mut self, reason: &str) -> SinkResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let mut writer = lock(&self.writer);
        let command = self.core.ctx().begin_io_command(
            IoCommandKind::Write,
            self.sink.location(),
            self.sink.path(),
            Some(Arc::clone(&self.sink)),
            &format!("{} row(s), flush on {}", batch.len(), reason),
        );
        match writer.write_batch(&batch) {
            Ok(written) => {
                command.end(written as u64);
                debug!("{}: flushed {} row(s) on {}", self.core.stage(), written, reason);
                self.ready.extend(batch);
                Ok(())
            }
            Err(err) => {
                command.failed(0, &err);
                self.core.release_all(batch);
                Err(err)
            }
        }
    }

    fn abort(&mut self, err: Option<SinkError>) {
        if let Some(err) = err {
            self.core.fail(err);
        }
        self.done = true;
        self.core.release_all(self.buffer.drain(..));
        self.core.release_all(self.ready.drain(..));
    }

    fn idle_expired(&self) -> bool {
        !self.buffer.is_empty() && self.last_added.elapsed() >= self.options.idle_timeout
    }
}

impl Sequence for BatchedWriter {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        loop {
            if self.core.is_cancelled() {
                self.abort(None);
                return None;
            }
            if let Some(row) = self.ready.pop_front() {
                return Some(row);
            }
            if self.done {
                return None;
            }
            if self.idle_expired() {
                if let Err(err) = self.flush("idle") {
                    self.abort(Some(err));
                    return None;
                }
                continue;
            }

            match self.core.pull_from(self.upstream.as_mut()) {
                None => {
                    if self.core.is_cancelled() {
                        self.abort(None);
                        return None;
                    }
                    if let Err(err) = self.flush("end") {
                        self.abort(Some(err));
                        return None;
                    }
                    self.done = true;
                }
                Some(row) if row.is_control() => {
                    if self.idle_expired() {
                        if let Err(err) = self.flush("idle") {
                            self.abort(Some(err));
                            return None;
                        }
                    }
                    self.ready.push_back(row);
                }
                Some(row) => {
                    self.buffer.push(row);
                    self.last_added = Instant::now();
                    if self.buffer.len() >= self.options.batch_size {
                        if let Err(err) = self.flush("size") {
                            self.abort(Some(err));
                            return None;
                        }
                    }
                }
            }
        }
    }
}
