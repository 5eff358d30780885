//! Deferred (batched) key-based operations.
//!
//! Left rows are held in a batch until it reaches `batch_size`, or until
//! `idle_timeout` passes without a new row (checked on every pull,
//! control rows included), or the input ends. On flush the right-hand
//! provider is asked only for the batch's keys that the result cache does
//! not know yet; the answer is merged into the cache and every held row is
//! evaluated against it. The cache is cleared wholesale once it grows past
//! `cache_capacity`.

use log::debug;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::actions::{MatchKind, MatchRules};
use super::lookup::{LookupMode, LookupTable};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{BoxError, OperationError, ValidationError, ValidationResult};
use crate::key::KeySelector;
use crate::models::{DeferState, Row, StageRef};
use crate::sequence::{BoxedSequence, Sequence, StageCore};

/// Builds the right-hand sequence for a batch from its distinct, uncached keys.
pub type RightProvider = Box<dyn FnMut(&Arc<ExecutionContext>, &[String]) -> Result<BoxedSequence, BoxError>>;

/// Batching knobs of [`DeferredMatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredOptions {
    pub batch_size: usize,
    pub idle_timeout: Duration,
    pub cache_capacity: usize,
}

impl DeferredOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            idle_timeout: config.idle_timeout(),
            cache_capacity: config.cache_capacity,
        }
    }
}

impl Default for DeferredOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Counters of one deferred stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredStats {
    pub flushes: usize,
    pub provider_calls: usize,
    pub cache_hits: usize,
    pub cache_resets: usize,
}

/// Expand, Join or KeyTest resolved batch by batch.
pub struct DeferredMatch {
    core: StageCore,
    kind: MatchKind,
    upstream: BoxedSequence,
    left_key: KeySelector,
    right_key: KeySelector,
    provider: RightProvider,
    pre_filter: Option<Box<dyn Fn(&str) -> bool>>,
    rules: MatchRules,
    options: DeferredOptions,
    batch: Vec<(Row, String)>,
    cache: HashMap<String, Vec<Row>>,
    ready: VecDeque<Row>,
    last_added: Instant,
    stats: DeferredStats,
    done: bool,
}

impl DeferredMatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new<L, P>(
        ctx: &Arc<ExecutionContext>,
        kind: MatchKind,
        left: L,
        left_key: KeySelector,
        right_key: KeySelector,
        provider: P,
        rules: MatchRules,
        options: DeferredOptions,
    ) -> ValidationResult<Self>
    where
        L: Sequence + 'static,
        P: FnMut(&Arc<ExecutionContext>, &[String]) -> Result<BoxedSequence, BoxError> + 'static,
    {
        let name = format!("Deferred{}", kind.name());
        rules.validate(&name, kind)?;
        if options.batch_size == 0 {
            return Err(ValidationError::InvalidParameter {
                stage: name,
                parameter: "batch_size",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            core: StageCore::new(ctx, &name),
            kind,
            upstream: Box::new(left),
            left_key,
            right_key,
            provider: Box::new(provider),
            pre_filter: None,
            rules,
            options,
            batch: Vec::new(),
            cache: HashMap::new(),
            ready: VecDeque::new(),
            last_added: Instant::now(),
            stats: DeferredStats::default(),
            done: false,
        })
    }

    /// Rows whose left key fails `filter` skip batching and take the
    /// no-match path right away.
    pub fn with_pre_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> bool + 'static,
    {
        self.pre_filter = Some(Box::new(filter));
        self
    }

    pub fn stats(&self) -> DeferredStats {
        self.stats
    }

    fn mode(&self) -> LookupMode {
        match self.kind {
            MatchKind::Join => LookupMode::Multi,
            MatchKind::Expand | MatchKind::KeyTest => LookupMode::Single,
        }
    }

    fn accept(&mut self, mut row: Row) -> Result<(), OperationError> {
        let key = match self.left_key.key(&row) {
            Ok(key) => key,
            Err(source) => {
                let err = OperationError::KeySelector {
                    stage: self.core.stage().to_string(),
                    row: row.to_debug_string(),
                    source,
                };
                self.core.release(&mut row);
                return Err(err);
            }
        };
        let key = match key {
            Some(key) if self.pre_filter.as_ref().map_or(true, |f| f(&key)) => key,
            _ => {
                let output = self.rules.no_match(&self.core, row)?;
                self.ready.extend(output);
                return Ok(());
            }
        };
        row.advance_defer_state(DeferState::DeferWait);
        self.batch.push((row, key));
        self.last_added = Instant::now();
        if self.batch.len() >= self.options.batch_size {
            self.flush("size")?;
        }
        Ok(())
    }

    fn idle_expired(&self) -> bool {
        !self.batch.is_empty() && self.last_added.elapsed() >= self.options.idle_timeout
    }

    fn flush(&mut self, reason: &str) -> Result<(), OperationError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.stats.flushes += 1;
        let batch = std::mem::take(&mut self.batch);

        let mut seen = HashSet::new();
        let missing: Vec<String> = batch
            .iter()
            .map(|(_, key)| key)
            .filter(|key| !self.cache.contains_key(*key) && seen.insert(*key))
            .cloned()
            .collect();
        self.stats.cache_hits += batch.iter().filter(|(_, key)| !seen.contains(key)).count();
        debug!(
            "{}: flushing {} row(s) on {}, {} key(s) to resolve",
            self.core.stage(),
            batch.len(),
            reason,
            missing.len()
        );

        if !missing.is_empty() {
            let resolved = self.resolve(&missing);
            // a cancelled right side answers nothing; its rows are not misses
            if resolved.is_err() || self.core.is_cancelled() {
                self.core.release_all(batch.into_iter().map(|(row, _)| row));
                return resolved;
            }
        }

        let mut rows = batch.into_iter();
        while let Some((mut row, key)) = rows.next() {
            row.advance_defer_state(DeferState::DeferDone);
            let matches = self.cache.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            match self.rules.apply(&self.core, self.kind, row, matches) {
                Ok(output) => self.ready.extend(output),
                Err(err) => {
                    self.core.release_all(rows.map(|(row, _)| row));
                    return Err(err);
                }
            }
        }

        if self.cache.len() > self.options.cache_capacity {
            debug!("{}: result cache reset at {} key(s)", self.core.stage(), self.cache.len());
            self.stats.cache_resets += 1;
            self.clear_cache();
        }
        Ok(())
    }

    /// Loads the right rows of `keys` into the cache; unknown keys are
    /// cached as misses. Caches nothing when the run got cancelled while
    /// the right side was read.
    fn resolve(&mut self, keys: &[String]) -> Result<(), OperationError> {
        self.stats.provider_calls += 1;
        let mut right = (self.provider)(self.core.ctx(), keys).map_err(|source| {
            OperationError::RightSource {
                stage: self.core.stage().to_string(),
                source,
            }
        })?;
        let mode = self.mode();
        let mut table = LookupTable::build(&self.core, right.as_mut(), &self.right_key, mode)?;
        if self.core.is_cancelled() {
            debug!("{}: right side cancelled, {} key(s) left unresolved", self.core.stage(), keys.len());
            self.core.release_all(table.into_rows());
            return Ok(());
        }
        for key in keys {
            let rows = table.take(key);
            self.cache.insert(key.clone(), rows);
        }
        // rows for keys nobody asked for
        self.core.release_all(table.into_rows());
        Ok(())
    }

    fn clear_cache(&mut self) {
        for (_, rows) in self.cache.drain() {
            self.core.release_all(rows);
        }
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.core.release_all(self.batch.drain(..).map(|(row, _)| row));
        self.clear_cache();
    }

    fn discard(&mut self) {
        self.shutdown();
        self.core.release_all(self.ready.drain(..));
    }

    fn abort(&mut self, err: OperationError) {
        self.core.fail(err);
        self.discard();
    }
}

impl Sequence for DeferredMatch {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        loop {
            if self.core.is_cancelled() {
                self.discard();
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
                    self.abort(err);
                    return None;
                }
                continue;
            }

            let step = match self.core.pull_from(self.upstream.as_mut()) {
                None if self.core.is_cancelled() => {
                    self.discard();
                    return None;
                }
                None => {
                    let flushed = self.flush("end");
                    self.shutdown();
                    flushed
                }
                Some(row) if row.is_control() => {
                    let flushed = if self.idle_expired() {
                        self.flush("idle")
                    } else {
                        Ok(())
                    };
                    self.ready.push_back(row);
                    flushed
                }
                Some(row) => self.accept(row),
            };
            if let Err(err) = step {
                self.abort(err);
                return None;
            }
        }
    }
}
