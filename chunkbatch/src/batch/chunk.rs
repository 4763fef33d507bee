//! The chunk engine: read, process and write one bounded chunk as a unit.
//!
//! A [`ChunkRunner`] reads up to `chunk_size` items, passes each through the
//! processor (a `None` result filters the item) and hands the survivors to
//! the writer in one call. Every fault is routed through the step's
//! [`FaultTolerance`]:
//!
//! ```text
//!   read error ──► skip? ──► yes: drop, keep reading ──► no: fatal
//!
//!   process/write error ──► retry? ──► yes: back off, then
//!                                    │     Chunk mode: roll back, replay cached items
//!                                    │     Item mode:  re-invoke the one operation
//!                           no ──► skip? ──► yes: exclude item (writes: scan one by one)
//!                                        no ──► recoverer? ──► fallback value
//!                                                       no ──► fatal
//! ```
//!
//! Counter deltas and context changes are staged in a [`ChunkTransaction`]
//! and applied to the [`StepExecution`] only by an explicit
//! [`commit`](ChunkTransaction::commit); [`rollback`](ChunkTransaction::rollback)
//! discards them. The one exception is a write scan: every item it writes is
//! committed on its own through [`ScanCommit`] before the next item is tried.
//! Skips are reported to listeners only after the chunk commits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::error::{BatchError, ItemError};
use super::execution::{StepContribution, StepExecution};
use super::fault::{FaultTolerance, RetryContext, RetryMode, SkipDecision};
use super::item::{ItemProcessor, ItemReader, ItemWriter};
use super::listener::StepListeners;

// =============================================================================
// Configuration
// =============================================================================

/// Default commit interval.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Chunk sizing for a chunk step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Number of items read per transaction. Must be at least 1.
    pub chunk_size: usize,
}

impl ChunkConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.chunk_size == 0 {
            return Err(BatchError::InvalidChunkSize(self.chunk_size));
        }
        Ok(())
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&crate::config::StepSettings> for ChunkConfig {
    fn from(settings: &crate::config::StepSettings) -> Self {
        Self::new(settings.chunk_size)
    }
}

/// Supplies a fallback result for an item whose processing failed for good.
pub type ItemRecoverer<I, O> =
    Arc<dyn Fn(&I, &ItemError) -> Result<Option<O>, ItemError> + Send + Sync>;

// =============================================================================
// Chunk Context
// =============================================================================

/// Identifies the chunk being processed, for listeners and logs.
#[derive(Clone, Debug)]
pub struct ChunkContext {
    pub step_name: String,
    pub step_execution_id: u64,
    /// 1-based index of the chunk within its worker.
    pub chunk_index: u64,
    /// Worker number; always 0 for single-threaded steps.
    pub worker: usize,
}

// =============================================================================
// Transaction Scope
// =============================================================================

/// Explicit transaction scope for one chunk.
///
/// Begun from the step's committed context, mutated while the chunk is in
/// flight, and consumed by exactly one of [`commit`](Self::commit) or
/// [`rollback`](Self::rollback).
#[derive(Debug)]
pub struct ChunkTransaction {
    contribution: StepContribution,
    context: ExecutionContext,
    rollbacks: u64,
}

impl ChunkTransaction {
    pub fn begin(committed: &ExecutionContext) -> Self {
        Self {
            contribution: StepContribution::new(),
            context: committed.clone(),
            rollbacks: 0,
        }
    }

    pub fn contribution(&self) -> &StepContribution {
        &self.contribution
    }

    pub fn contribution_mut(&mut self) -> &mut StepContribution {
        &mut self.contribution
    }

    /// Staged copy of the step context; becomes the committed context on commit.
    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Records an intermediate rollback (a chunk replay or the start of a write scan).
    pub(crate) fn mark_rollback(&mut self) {
        self.rollbacks += 1;
    }

    /// Applies the staged deltas and context to the step and counts the commit.
    pub fn commit(self, step: &mut StepExecution) {
        step.apply(&self.contribution);
        step.rollback_count += self.rollbacks;
        step.execution_context = self.context;
    }

    /// Discards the staged deltas and context.
    pub fn rollback(self, step: &mut StepExecution) {
        step.rollback_count += self.rollbacks + 1;
    }
}

/// Commits the single-item transactions of a write scan.
///
/// A scanned item that writes successfully is committed immediately, outside
/// the chunk transaction that is still in flight.
pub trait ScanCommit {
    fn commit_scanned(&self, contribution: &StepContribution) -> Result<(), BatchError>;
}

impl ScanCommit for Mutex<StepExecution> {
    fn commit_scanned(&self, contribution: &StepContribution) -> Result<(), BatchError> {
        self.lock().apply(contribution);
        Ok(())
    }
}

// =============================================================================
// Chunk State
// =============================================================================

/// Items read for one chunk, cached for replay.
struct Chunk<I> {
    items: Vec<I>,
    /// Process skip per item; a skipped item is left out of replays.
    skipped: Vec<Option<ItemError>>,
    process_attempts: Vec<u32>,
    write_attempts: u32,
    read_skips: Vec<ItemError>,
    end_of_input: bool,
}

impl<I> Chunk<I> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            skipped: Vec::with_capacity(capacity),
            process_attempts: Vec::with_capacity(capacity),
            write_attempts: 0,
            read_skips: Vec::new(),
            end_of_input: false,
        }
    }

    fn push(&mut self, item: I) {
        self.items.push(item);
        self.skipped.push(None);
        self.process_attempts.push(0);
    }
}

/// Skips recorded while a chunk was in flight.
///
/// Held back until the chunk commits; a rolled-back chunk drops them unheard.
pub struct SkippedItems<I, O> {
    read: Vec<ItemError>,
    process: Vec<(I, ItemError)>,
    write: Vec<(O, ItemError)>,
}

impl<I, O> SkippedItems<I, O> {
    pub fn len(&self) -> usize {
        self.read.len() + self.process.len() + self.write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reports every skip to the skip listeners, read skips first.
    pub fn notify(&self, listeners: &StepListeners<I, O>) {
        for error in &self.read {
            listeners.on_skip_in_read(error);
        }
        for (item, error) in &self.process {
            listeners.on_skip_in_process(item, error);
        }
        for (item, error) in &self.write {
            listeners.on_skip_in_write(item, error);
        }
    }
}

/// Result of one [`ChunkRunner::run_chunk`] call.
pub enum ChunkResult<I, O> {
    /// A chunk was read and handled; the transaction should be committed.
    Processed {
        items: usize,
        end_of_input: bool,
        skipped: SkippedItems<I, O>,
    },
    /// The reader was already exhausted; nothing to commit, the step is done.
    EndOfInput,
}

enum Processed<O> {
    Ready { outputs: Vec<O>, filtered: u64 },
    Replay,
}

enum Written {
    /// Chunk written; after a scan, holds the write skip (if any) per output.
    Done(Vec<Option<ItemError>>),
    Replay,
}

// =============================================================================
// Chunk Runner
// =============================================================================

/// Runs the read-process-write cycle for one chunk at a time.
pub struct ChunkRunner<'a, P: ItemProcessor, W> {
    processor: &'a P,
    writer: &'a W,
    fault: &'a FaultTolerance,
    listeners: &'a StepListeners<P::Input, P::Output>,
    recoverer: Option<&'a ItemRecoverer<P::Input, P::Output>>,
    skips: &'a AtomicU64,
    chunk_size: usize,
}

impl<'a, P, W> ChunkRunner<'a, P, W>
where
    P: ItemProcessor,
    W: ItemWriter<Item = P::Output>,
{
    /// Creates a runner.
    ///
    /// `skips` is the step-wide skip tally checked against the skip limit;
    /// share one counter between all workers of a step.
    pub fn new(
        processor: &'a P,
        writer: &'a W,
        fault: &'a FaultTolerance,
        listeners: &'a StepListeners<P::Input, P::Output>,
        skips: &'a AtomicU64,
        chunk_size: usize,
    ) -> Result<Self, BatchError> {
        ChunkConfig::new(chunk_size).validate()?;
        Ok(Self {
            processor,
            writer,
            fault,
            listeners,
            recoverer: None,
            skips,
            chunk_size,
        })
    }

    pub fn with_recoverer(
        mut self,
        recoverer: Option<&'a ItemRecoverer<P::Input, P::Output>>,
    ) -> Self {
        self.recoverer = recoverer;
        self
    }

    /// Reads, processes and writes one chunk, staging its effects in `tx`.
    ///
    /// Items written by a write scan are committed one by one through
    /// `scans`. On `Err` the caller must roll `tx` back.
    pub async fn run_chunk<R, C>(
        &self,
        reader: &mut R,
        tx: &mut ChunkTransaction,
        scans: &C,
    ) -> Result<ChunkResult<P::Input, P::Output>, BatchError>
    where
        R: ItemReader<Item = P::Input>,
        C: ScanCommit + ?Sized,
    {
        let mut chunk = self.read_chunk(reader).await?;
        if chunk.items.is_empty() && chunk.read_skips.is_empty() {
            return Ok(ChunkResult::EndOfInput);
        }

        tx.contribution.read_count += chunk.items.len() as u64;
        tx.contribution.read_skip_count += chunk.read_skips.len() as u64;

        let rewind = self.fault.retry_mode == RetryMode::Chunk;
        let (outputs, write_skips) = loop {
            let (outputs, filtered) = match self.process_chunk(&mut chunk, tx, rewind).await? {
                Processed::Ready { outputs, filtered } => (outputs, filtered),
                Processed::Replay => continue,
            };
            match self.write_outputs(&mut chunk, &outputs, tx, rewind, scans).await? {
                Written::Done(write_skips) => {
                    tx.contribution.filter_count += filtered;
                    break (outputs, write_skips);
                }
                Written::Replay => continue,
            }
        };

        let items = chunk.items.len();
        let end_of_input = chunk.end_of_input;
        let skipped = SkippedItems {
            read: chunk.read_skips,
            process: chunk
                .items
                .into_iter()
                .zip(chunk.skipped)
                .filter_map(|(item, error)| error.map(|e| (item, e)))
                .collect(),
            write: outputs
                .into_iter()
                .zip(write_skips)
                .filter_map(|(item, error)| error.map(|e| (item, e)))
                .collect(),
        };

        Ok(ChunkResult::Processed {
            items,
            end_of_input,
            skipped,
        })
    }

    // -------------------------------------------------------------------------
    // Read
    // -------------------------------------------------------------------------

    async fn read_chunk<R>(&self, reader: &mut R) -> Result<Chunk<P::Input>, BatchError>
    where
        R: ItemReader<Item = P::Input>,
    {
        let mut chunk = Chunk::with_capacity(self.chunk_size);
        while chunk.items.len() < self.chunk_size {
            self.listeners.before_read();
            match reader.read().await {
                Ok(Some(item)) => {
                    self.listeners.after_read(&item);
                    chunk.push(item);
                }
                Ok(None) => {
                    chunk.end_of_input = true;
                    break;
                }
                Err(error) => {
                    self.listeners.on_read_error(&error);
                    if let Err(decision) = self.reserve_skip(&error) {
                        return Err(self.escalate(error, 1, decision));
                    }
                    warn!(error = %error, "Skipping item in read");
                    chunk.read_skips.push(error);
                }
            }
        }
        Ok(chunk)
    }

    // -------------------------------------------------------------------------
    // Process
    // -------------------------------------------------------------------------

    async fn process_chunk(
        &self,
        chunk: &mut Chunk<P::Input>,
        tx: &mut ChunkTransaction,
        rewind: bool,
    ) -> Result<Processed<P::Output>, BatchError> {
        let mut outputs = Vec::with_capacity(chunk.items.len());
        let mut filtered = 0u64;

        for idx in 0..chunk.items.len() {
            if chunk.skipped[idx].is_some() {
                continue;
            }
            loop {
                let item = &chunk.items[idx];
                self.listeners.before_process(item);
                let error = match self.processor.process(item).await {
                    Ok(Some(output)) => {
                        self.listeners.after_process(item, Some(&output));
                        outputs.push(output);
                        break;
                    }
                    Ok(None) => {
                        self.listeners.after_process(item, None);
                        filtered += 1;
                        break;
                    }
                    Err(error) => error,
                };
                self.listeners.on_process_error(item, &error);

                chunk.process_attempts[idx] += 1;
                let attempts = chunk.process_attempts[idx];
                if self.fault.can_retry(&error, attempts) {
                    self.note_retry(tx, attempts, &error).await;
                    if rewind && self.fault.rolls_back(&error) {
                        debug!(attempt = attempts, "Rolling back chunk for replay");
                        tx.mark_rollback();
                        return Ok(Processed::Replay);
                    }
                    continue;
                }

                match self.reserve_skip(&error) {
                    Ok(()) => {
                        warn!(error = %error, attempts, "Skipping item in process");
                        tx.contribution.process_skip_count += 1;
                        chunk.skipped[idx] = Some(error);
                    }
                    Err(decision) => match self.recoverer {
                        Some(recover) => {
                            debug!(error = %error, attempts, "Recovering item");
                            match recover(item, &error)? {
                                Some(output) => outputs.push(output),
                                None => filtered += 1,
                            }
                        }
                        None => return Err(self.escalate(error, attempts, decision)),
                    },
                }
                break;
            }
        }

        Ok(Processed::Ready { outputs, filtered })
    }

    // -------------------------------------------------------------------------
    // Write
    // -------------------------------------------------------------------------

    async fn write_outputs<C>(
        &self,
        chunk: &mut Chunk<P::Input>,
        outputs: &[P::Output],
        tx: &mut ChunkTransaction,
        rewind: bool,
        scans: &C,
    ) -> Result<Written, BatchError>
    where
        C: ScanCommit + ?Sized,
    {
        if outputs.is_empty() {
            return Ok(Written::Done(Vec::new()));
        }

        loop {
            self.listeners.before_write(outputs);
            let error = match self.writer.write(outputs).await {
                Ok(()) => {
                    self.listeners.after_write(outputs);
                    tx.contribution.write_count += outputs.len() as u64;
                    return Ok(Written::Done(Vec::new()));
                }
                Err(error) => error,
            };
            self.listeners.on_write_error(outputs, &error);

            chunk.write_attempts += 1;
            let attempts = chunk.write_attempts;
            if self.fault.can_retry(&error, attempts) {
                self.note_retry(tx, attempts, &error).await;
                if rewind && self.fault.rolls_back(&error) {
                    debug!(attempt = attempts, "Rolling back chunk for replay");
                    tx.mark_rollback();
                    return Ok(Written::Replay);
                }
                continue;
            }

            let skip_count = self.skips.load(Ordering::SeqCst);
            match self.fault.should_skip(&error, skip_count) {
                SkipDecision::Skip => {}
                decision => return Err(self.escalate(error, attempts, decision)),
            }

            debug!(error = %error, items = outputs.len(), "Scanning chunk for skippable items");
            if self.fault.rolls_back(&error) {
                tx.mark_rollback();
            }
            let skipped = self.scan(outputs, tx, scans).await?;
            return Ok(Written::Done(skipped));
        }
    }

    /// Re-writes items one at a time, skipping the ones that still fail.
    ///
    /// Each successful write is committed on its own before the next item,
    /// so a later fatal item cannot un-count writes the writer already holds.
    async fn scan<C>(
        &self,
        outputs: &[P::Output],
        tx: &mut ChunkTransaction,
        scans: &C,
    ) -> Result<Vec<Option<ItemError>>, BatchError>
    where
        C: ScanCommit + ?Sized,
    {
        let mut skipped = Vec::with_capacity(outputs.len());
        for item in outputs {
            let single = std::slice::from_ref(item);
            self.listeners.before_write(single);
            match self.writer.write(single).await {
                Ok(()) => {
                    self.listeners.after_write(single);
                    let written = StepContribution {
                        write_count: 1,
                        ..StepContribution::default()
                    };
                    scans.commit_scanned(&written)?;
                    skipped.push(None);
                }
                Err(error) => {
                    self.listeners.on_write_error(single, &error);
                    if let Err(decision) = self.reserve_skip(&error) {
                        return Err(self.escalate(error, 1, decision));
                    }
                    warn!(error = %error, "Skipping item in write");
                    tx.contribution.write_skip_count += 1;
                    skipped.push(Some(error));
                }
            }
        }
        Ok(skipped)
    }

    // -------------------------------------------------------------------------
    // Fault helpers
    // -------------------------------------------------------------------------

    /// Atomically takes one slot under the step-wide skip limit.
    fn reserve_skip(&self, error: &ItemError) -> Result<(), SkipDecision> {
        loop {
            let current = self.skips.load(Ordering::SeqCst);
            match self.fault.should_skip(error, current) {
                SkipDecision::Skip => {
                    if self
                        .skips
                        .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
                decision => return Err(decision),
            }
        }
    }

    async fn note_retry(&self, tx: &mut ChunkTransaction, attempts: u32, error: &ItemError) {
        tx.contribution.retry_count += 1;
        let ctx = RetryContext {
            attempts,
            last_error: Some(error.clone()),
        };
        self.listeners.on_retry(&ctx, error);
        warn!(attempt = attempts, error = %error, "Retrying after failure");
        self.fault.backoff.pause(attempts).await;
    }

    fn escalate(&self, error: ItemError, attempts: u32, decision: SkipDecision) -> BatchError {
        match decision {
            SkipDecision::LimitExceeded => BatchError::SkipLimitExceeded {
                limit: self.fault.skip_policy.limit().unwrap_or(0),
                error,
            },
            _ if attempts > 1 => BatchError::RetryExhausted { attempts, error },
            _ => BatchError::Item(error),
        }
    }
}
