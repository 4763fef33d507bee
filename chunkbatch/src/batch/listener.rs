//! Lifecycle listeners and their registries.
//!
//! Listeners are plain notification hooks: one trait per lifecycle event
//! family, every method defaulted so implementors override only what they
//! need. They cannot alter control flow, with one exception:
//! [`StepExecutionListener::after_step`] may return an [`ExitStatus`] that
//! replaces the step's own exit status before flow transitions are evaluated.
//!
//! Listeners are registered explicitly in ordered lists
//! ([`StepListeners`], [`JobListeners`]) and invoked in registration order.
//!
//! # Example
//!
//! ```ignore
//! use chunkbatch::batch::listener::StepExecutionListener;
//! use chunkbatch::batch::{ExitStatus, StepExecution};
//!
//! /// Turns a clean completion into a custom "PASS" exit code.
//! struct PassCheckingListener;
//!
//! impl StepExecutionListener for PassCheckingListener {
//!     fn after_step(&self, step: &StepExecution) -> Option<ExitStatus> {
//!         (step.exit_status.code() != ExitStatus::FAILED).then(|| ExitStatus::new("PASS"))
//!     }
//! }
//! ```

use std::sync::Arc;

use super::chunk::ChunkContext;
use super::context::ExecutionContext;
use super::error::{BatchError, ItemError};
use super::execution::{JobExecution, StepExecution};
use super::fault::RetryContext;
use super::status::ExitStatus;

// =============================================================================
// Job and Step Listeners
// =============================================================================

pub trait JobExecutionListener: Send + Sync {
    fn before_job(&self, _job: &JobExecution) {}

    fn after_job(&self, _job: &JobExecution) {}
}

pub trait StepExecutionListener: Send + Sync {
    fn before_step(&self, _step: &StepExecution) {}

    /// Returning `Some` replaces the step's exit status.
    fn after_step(&self, _step: &StepExecution) -> Option<ExitStatus> {
        None
    }
}

// =============================================================================
// Chunk and Item Listeners
// =============================================================================

pub trait ChunkListener: Send + Sync {
    fn before_chunk(&self, _ctx: &ChunkContext) {}

    /// Called after the chunk committed.
    fn after_chunk(&self, _ctx: &ChunkContext) {}

    /// Called after the chunk rolled back.
    fn after_chunk_error(&self, _ctx: &ChunkContext, _error: &BatchError) {}
}

pub trait ItemReadListener<I>: Send + Sync {
    fn before_read(&self) {}

    fn after_read(&self, _item: &I) {}

    fn on_read_error(&self, _error: &ItemError) {}
}

pub trait ItemProcessListener<I, O>: Send + Sync {
    fn before_process(&self, _item: &I) {}

    /// `result` is `None` when the item was filtered.
    fn after_process(&self, _item: &I, _result: Option<&O>) {}

    fn on_process_error(&self, _item: &I, _error: &ItemError) {}
}

pub trait ItemWriteListener<O>: Send + Sync {
    fn before_write(&self, _items: &[O]) {}

    fn after_write(&self, _items: &[O]) {}

    fn on_write_error(&self, _items: &[O], _error: &ItemError) {}
}

// =============================================================================
// Skip and Retry Listeners
// =============================================================================

/// Phase in which an item was skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SkipPhase {
    Read,
    Process,
    Write,
}

impl std::fmt::Display for SkipPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Process => write!(f, "process"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// The item that was skipped, as far as it is known in its phase.
///
/// A read failure never produced an item, so only the phase is reported.
#[derive(Debug)]
pub enum SkippedItem<'a, I, O> {
    Read,
    Process(&'a I),
    Write(&'a O),
}

impl<I, O> SkippedItem<'_, I, O> {
    pub fn phase(&self) -> SkipPhase {
        match self {
            Self::Read => SkipPhase::Read,
            Self::Process(_) => SkipPhase::Process,
            Self::Write(_) => SkipPhase::Write,
        }
    }
}

pub trait SkipListener<I, O>: Send + Sync {
    fn on_skip(&self, item: SkippedItem<'_, I, O>, error: &ItemError);
}

pub trait RetryListener: Send + Sync {
    /// Called before the first attempt.
    fn open(&self, _ctx: &RetryContext) {}

    /// Called after each failed attempt, before the policy decides.
    fn on_error(&self, _ctx: &RetryContext, _error: &ItemError) {}

    /// Called once the operation finished, successfully or not.
    fn close(&self, _ctx: &RetryContext, _succeeded: bool) {}
}

// =============================================================================
// Registries
// =============================================================================

/// Ordered chunk and item listener lists for one chunk step, keyed by event family.
pub struct StepListeners<I, O> {
    pub chunk: Vec<Arc<dyn ChunkListener>>,
    pub read: Vec<Arc<dyn ItemReadListener<I>>>,
    pub process: Vec<Arc<dyn ItemProcessListener<I, O>>>,
    pub write: Vec<Arc<dyn ItemWriteListener<O>>>,
    pub skip: Vec<Arc<dyn SkipListener<I, O>>>,
    pub retry: Vec<Arc<dyn RetryListener>>,
}

impl<I, O> Default for StepListeners<I, O> {
    fn default() -> Self {
        Self {
            chunk: Vec::new(),
            read: Vec::new(),
            process: Vec::new(),
            write: Vec::new(),
            skip: Vec::new(),
            retry: Vec::new(),
        }
    }
}

impl<I, O> Clone for StepListeners<I, O> {
    fn clone(&self) -> Self {
        Self {
            chunk: self.chunk.clone(),
            read: self.read.clone(),
            process: self.process.clone(),
            write: self.write.clone(),
            skip: self.skip.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<I, O> StepListeners<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn before_chunk(&self, ctx: &ChunkContext) {
        self.chunk.iter().for_each(|l| l.before_chunk(ctx));
    }

    pub(crate) fn after_chunk(&self, ctx: &ChunkContext) {
        self.chunk.iter().for_each(|l| l.after_chunk(ctx));
    }

    pub(crate) fn after_chunk_error(&self, ctx: &ChunkContext, error: &BatchError) {
        self.chunk.iter().for_each(|l| l.after_chunk_error(ctx, error));
    }

    pub(crate) fn before_read(&self) {
        self.read.iter().for_each(|l| l.before_read());
    }

    pub(crate) fn after_read(&self, item: &I) {
        self.read.iter().for_each(|l| l.after_read(item));
    }

    pub(crate) fn on_read_error(&self, error: &ItemError) {
        self.read.iter().for_each(|l| l.on_read_error(error));
    }

    pub(crate) fn before_process(&self, item: &I) {
        self.process.iter().for_each(|l| l.before_process(item));
    }

    pub(crate) fn after_process(&self, item: &I, result: Option<&O>) {
        self.process.iter().for_each(|l| l.after_process(item, result));
    }

    pub(crate) fn on_process_error(&self, item: &I, error: &ItemError) {
        self.process
            .iter()
            .for_each(|l| l.on_process_error(item, error));
    }

    pub(crate) fn before_write(&self, items: &[O]) {
        self.write.iter().for_each(|l| l.before_write(items));
    }

    pub(crate) fn after_write(&self, items: &[O]) {
        self.write.iter().for_each(|l| l.after_write(items));
    }

    pub(crate) fn on_write_error(&self, items: &[O], error: &ItemError) {
        self.write.iter().for_each(|l| l.on_write_error(items, error));
    }

    pub(crate) fn on_skip_in_read(&self, error: &ItemError) {
        self.skip
            .iter()
            .for_each(|l| l.on_skip(SkippedItem::Read, error));
    }

    pub(crate) fn on_skip_in_process(&self, item: &I, error: &ItemError) {
        self.skip
            .iter()
            .for_each(|l| l.on_skip(SkippedItem::Process(item), error));
    }

    pub(crate) fn on_skip_in_write(&self, item: &O, error: &ItemError) {
        self.skip
            .iter()
            .for_each(|l| l.on_skip(SkippedItem::Write(item), error));
    }

    pub(crate) fn on_retry(&self, ctx: &RetryContext, error: &ItemError) {
        self.retry.iter().for_each(|l| l.on_error(ctx, error));
    }
}

/// Copies named keys from a finished step's context into the job context.
///
/// Promotion only happens when the step's exit code is one of `statuses`
/// (glob patterns, `COMPLETED` by default). Missing keys are ignored unless
/// `strict` is set.
#[derive(Clone, Debug)]
pub struct ExecutionContextPromotionListener {
    keys: Vec<String>,
    statuses: Vec<String>,
    strict: bool,
}

impl ExecutionContextPromotionListener {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            statuses: vec![ExitStatus::COMPLETED.to_string()],
            strict: false,
        }
    }

    pub fn with_statuses<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Fails promotion when a key is absent from the step context.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn promote(
        &self,
        step: &StepExecution,
        job_context: &mut ExecutionContext,
    ) -> Result<(), BatchError> {
        let code = step.exit_status.code();
        if !self
            .statuses
            .iter()
            .any(|pattern| super::flow::pattern_matches(pattern, code))
        {
            return Ok(());
        }
        for key in &self.keys {
            match step.execution_context.get(key) {
                Some(value) => job_context.put(key.clone(), value.clone()),
                None if self.strict => {
                    return Err(BatchError::Context(format!(
                        "key '{}' missing from context of step '{}'",
                        key, step.step_name
                    )))
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Step-level hooks shared by every step type.
#[derive(Clone, Default)]
pub struct StepHooks {
    pub listeners: Vec<Arc<dyn StepExecutionListener>>,
    pub promotions: Vec<ExecutionContextPromotionListener>,
}

impl StepHooks {
    pub fn before_step(&self, step: &StepExecution) {
        self.listeners.iter().for_each(|l| l.before_step(step));
    }

    /// Runs every after-step hook in order; each override replaces the
    /// status seen by the next hook.
    pub fn after_step(&self, step: &mut StepExecution) {
        for listener in &self.listeners {
            if let Some(exit) = listener.after_step(step) {
                step.exit_status = exit;
            }
        }
    }

    /// Applies every promotion listener to the job context.
    pub fn promote(
        &self,
        step: &StepExecution,
        job_context: &mut ExecutionContext,
    ) -> Result<(), BatchError> {
        self.promotions
            .iter()
            .try_for_each(|p| p.promote(step, job_context))
    }
}

/// Ordered job listeners.
#[derive(Clone, Default)]
pub struct JobListeners {
    pub listeners: Vec<Arc<dyn JobExecutionListener>>,
}

impl JobListeners {
    pub fn before_job(&self, job: &JobExecution) {
        self.listeners.iter().for_each(|l| l.before_job(job));
    }

    pub fn after_job(&self, job: &JobExecution) {
        self.listeners.iter().for_each(|l| l.after_job(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSkipListener {
        phases: Mutex<Vec<SkipPhase>>,
    }

    impl SkipListener<i32, String> for RecordingSkipListener {
        fn on_skip(&self, item: SkippedItem<'_, i32, String>, _error: &ItemError) {
            self.phases.lock().push(item.phase());
        }
    }

    struct PassListener;

    impl StepExecutionListener for PassListener {
        fn after_step(&self, step: &StepExecution) -> Option<ExitStatus> {
            (step.exit_status.code() == ExitStatus::COMPLETED).then(|| ExitStatus::new("PASS"))
        }
    }

    #[test]
    fn test_skip_listener_receives_phase() {
        let recorder = Arc::new(RecordingSkipListener {
            phases: Mutex::new(Vec::new()),
        });
        let mut listeners: StepListeners<i32, String> = StepListeners::new();
        listeners.skip.push(recorder.clone());

        let error = ItemError::new("bad", "x");
        listeners.on_skip_in_read(&error);
        listeners.on_skip_in_process(&1, &error);
        listeners.on_skip_in_write(&"one".to_string(), &error);

        assert_eq!(
            *recorder.phases.lock(),
            vec![SkipPhase::Read, SkipPhase::Process, SkipPhase::Write]
        );
    }

    #[test]
    fn test_after_step_overrides_exit_status() {
        let hooks = StepHooks {
            listeners: vec![Arc::new(PassListener)],
            ..Default::default()
        };
        let mut step = StepExecution::new(1, 1, "step1");
        step.exit_status = ExitStatus::completed();

        hooks.after_step(&mut step);
        assert_eq!(step.exit_status.code(), "PASS");
    }

    #[test]
    fn test_promotion_copies_keys_on_completion() {
        let promotion = ExecutionContextPromotionListener::new(["total", "missing"]);
        let mut step = StepExecution::new(1, 1, "count");
        step.exit_status = ExitStatus::completed();
        step.execution_context.put("total", 12);
        step.execution_context.put("private", true);

        let mut job_context = ExecutionContext::new();
        promotion.promote(&step, &mut job_context).unwrap();

        assert_eq!(job_context.get_i64("total"), Some(12));
        assert!(!job_context.contains_key("private"));
    }

    #[test]
    fn test_promotion_skipped_for_other_statuses() {
        let promotion = ExecutionContextPromotionListener::new(["total"]);
        let mut step = StepExecution::new(1, 1, "count");
        step.exit_status = ExitStatus::failed();
        step.execution_context.put("total", 12);

        let mut job_context = ExecutionContext::new();
        promotion.promote(&step, &mut job_context).unwrap();
        assert!(job_context.is_empty());
    }

    #[test]
    fn test_strict_promotion_rejects_missing_key() {
        let promotion = ExecutionContextPromotionListener::new(["total"]).strict();
        let mut step = StepExecution::new(1, 1, "count");
        step.exit_status = ExitStatus::completed();

        let mut job_context = ExecutionContext::new();
        assert!(promotion.promote(&step, &mut job_context).is_err());
    }

    #[test]
    fn test_after_step_without_override_keeps_status() {
        let hooks = StepHooks {
            listeners: vec![Arc::new(PassListener)],
            ..Default::default()
        };
        let mut step = StepExecution::new(1, 1, "step1");
        step.exit_status = ExitStatus::failed();

        hooks.after_step(&mut step);
        assert_eq!(step.exit_status.code(), ExitStatus::FAILED);
    }
}
