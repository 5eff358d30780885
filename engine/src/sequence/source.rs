//! Row producers.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use super::{Sequence, StageCore};
use crate::context::ExecutionContext;
use crate::models::{Row, StageRef, Value};

/// Column values of a row to be created, in column order.
pub type Record = Vec<(String, Value)>;

/// Builds a [`Record`] from `(column, value)` pairs.
pub fn record<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Record
where
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(column, value)| (column.into(), value.into()))
        .collect()
}

/// Produces one row per record of an iterator.
pub struct RowSource {
    core: StageCore,
    records: Box<dyn Iterator<Item = Record>>,
}

impl RowSource {
    pub fn new<I>(ctx: &Arc<ExecutionContext>, name: &str, records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
        I::IntoIter: 'static,
    {
        Self {
            core: StageCore::new(ctx, name),
            records: Box::new(records.into_iter()),
        }
    }
}

impl Sequence for RowSource {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        if self.core.is_cancelled() {
            return None;
        }
        let values = self.records.next()?;
        Some(self.core.ctx().create_row_with(self.core.stage(), values))
    }
}

/// Produces rows sent through a channel by another thread.
///
/// When nothing arrives within the heartbeat interval a heartbeat row is
/// emitted instead, so downstream buffering stages can flush on time. The
/// stream ends when every sender is dropped.
pub struct ChannelSource {
    core: StageCore,
    receiver: Receiver<Record>,
    heartbeat_interval: Duration,
}

impl ChannelSource {
    pub fn new(
        ctx: &Arc<ExecutionContext>,
        name: &str,
        receiver: Receiver<Record>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            core: StageCore::new(ctx, name),
            receiver,
            heartbeat_interval,
        }
    }

    /// A bounded channel and the source reading from it.
    pub fn channel(
        ctx: &Arc<ExecutionContext>,
        name: &str,
        capacity: usize,
        heartbeat_interval: Duration,
    ) -> (SyncSender<Record>, Self) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (sender, Self::new(ctx, name, receiver, heartbeat_interval))
    }
}

impl Sequence for ChannelSource {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        if self.core.is_cancelled() {
            return None;
        }
        match self.receiver.recv_timeout(self.heartbeat_interval) {
            Ok(values) => Some(self.core.ctx().create_row_with(self.core.stage(), values)),
            Err(RecvTimeoutError::Timeout) => {
                Some(self.core.ctx().create_heartbeat(self.core.stage()))
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::thread;

    #[test]
    fn test_row_source_creates_owned_rows() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let mut source = RowSource::new(
            &ctx,
            "People",
            vec![record([("name", "Ann")]), record([("name", "Bob")])],
        );
        let first = source.pull().unwrap();
        assert_eq!(first.get("name"), &Value::from("Ann"));
        assert_eq!(first.owner(), Some(source.stage()));
        assert!(source.pull().is_some());
        assert!(source.pull().is_none());
    }

    #[test]
    fn test_channel_source_emits_heartbeats_while_idle() {
        let ctx = ExecutionContext::new(EngineConfig::default());
        let (tx, mut source) = ChannelSource::channel(&ctx, "Feed", 4, Duration::from_millis(10));

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            tx.send(record([("id", 1)])).unwrap();
        });

        let mut heartbeats = 0;
        let mut data = Vec::new();
        while let Some(row) = source.pull() {
            if row.is_heartbeat() {
                heartbeats += 1;
            } else {
                data.push(row);
            }
        }
        producer.join().unwrap();

        assert!(heartbeats >= 1);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].get("id"), &Value::Int(1));
    }
}
