//! Steps: the units a flow sequences.
//!
//! Every step runs through the same lifecycle:
//!
//! ```text
//!   STARTING ──► STARTED ──► body ──► COMPLETED | STOPPED | FAILED
//!                  │                       │
//!            before_step hooks      after_step hooks (may override exit status)
//! ```
//!
//! The body is step-specific:
//!
//! - [`ChunkStep`] drives the chunk engine until input is exhausted, one
//!   transaction per chunk.
//! - [`MultiThreadedStep`] runs several chunk workers against one shared,
//!   synchronised reader.
//! - [`TaskletStep`] calls a [`Tasklet`] repeatedly, one transaction per call.
//!
//! Readers and writers are built at execution time by factories that see the
//! live [`StepExecution`] and [`StepScope`], so a partition worker can bind
//! its reader to the range stored in its own context.
//!
//! # Example
//!
//! ```ignore
//! use chunkbatch::batch::item::{FnItemProcessor, ListItemReader, ListItemWriter};
//! use chunkbatch::batch::step::ChunkStep;
//!
//! let output = ListItemWriter::new();
//! let sink = output.clone();
//! let step = ChunkStep::new(
//!     "double",
//!     |_, _| Ok(ListItemReader::new(1..=10)),
//!     FnItemProcessor::new(|n: &i32| Ok(Some(n * 2))),
//!     move |_, _| Ok(sink.clone()),
//! )
//! .chunk_size(3);
//! ```

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::chunk::{
    ChunkConfig, ChunkContext, ChunkResult, ChunkRunner, ChunkTransaction, ItemRecoverer, ScanCommit,
    SkippedItems,
};
use super::context::ExecutionContext;
use super::error::{BatchError, ItemError};
use super::execution::{JobExecution, JobInstance, StepContribution, StepExecution};
use super::fault::FaultTolerance;
use super::item::{ItemProcessor, ItemReader, ItemWriter, PassThroughItemProcessor};
use super::listener::{ExecutionContextPromotionListener, StepExecutionListener, StepHooks, StepListeners};
use super::params::JobParameters;
use super::repeat::{CompletionPolicy, ExceptionHandler, RepeatStatus, RepeatTemplate};
use super::repository::JobRepository;
use super::status::{BatchStatus, ExitStatus};
use super::telemetry::{BatchEvent, TelemetrySink};

// =============================================================================
// Options
// =============================================================================

/// Default start limit: effectively unlimited.
pub const DEFAULT_START_LIMIT: u32 = u32::MAX;

/// Restart behaviour shared by every step type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepOptions {
    /// Maximum number of executions per job instance.
    pub start_limit: u32,
    /// Re-run the step on restart even if it completed before.
    pub allow_start_if_complete: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            start_limit: DEFAULT_START_LIMIT,
            allow_start_if_complete: false,
        }
    }
}

impl From<&crate::config::StepSettings> for StepOptions {
    fn from(settings: &crate::config::StepSettings) -> Self {
        Self {
            start_limit: settings.start_limit,
            allow_start_if_complete: settings.allow_start_if_complete,
        }
    }
}

// =============================================================================
// Step Scope
// =============================================================================

/// Live job state handed to steps and component factories.
///
/// Clones share the same job execution, so steps in a split or partition
/// workers record into one place.
#[derive(Clone)]
pub struct StepScope {
    job: Arc<Mutex<JobExecution>>,
    repository: Arc<dyn JobRepository>,
    telemetry: Arc<dyn TelemetrySink>,
    stop: CancellationToken,
}

impl StepScope {
    pub fn new(
        job: JobExecution,
        repository: Arc<dyn JobRepository>,
        telemetry: Arc<dyn TelemetrySink>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            job: Arc::new(Mutex::new(job)),
            repository,
            telemetry,
            stop,
        }
    }

    /// Snapshot of the job execution.
    pub fn job_execution(&self) -> JobExecution {
        self.job.lock().clone()
    }

    pub fn job_execution_id(&self) -> u64 {
        self.job.lock().id
    }

    pub fn job_instance(&self) -> JobInstance {
        self.job.lock().instance.clone()
    }

    pub fn job_name(&self) -> String {
        self.job.lock().instance.job_name.clone()
    }

    pub fn parameters(&self) -> JobParameters {
        self.job.lock().parameters.clone()
    }

    /// Snapshot of the job-scoped context.
    pub fn job_context(&self) -> ExecutionContext {
        self.job.lock().execution_context.clone()
    }

    /// Mutates the job context under lock and persists the job execution.
    pub fn update_job_context<T>(
        &self,
        f: impl FnOnce(&mut ExecutionContext) -> T,
    ) -> Result<T, BatchError> {
        let (value, snapshot) = {
            let mut job = self.job.lock();
            let value = f(&mut job.execution_context);
            (value, job.clone())
        };
        self.repository.update_job_execution(&snapshot)?;
        Ok(value)
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn telemetry(&self) -> &dyn TelemetrySink {
        self.telemetry.as_ref()
    }

    pub(crate) fn telemetry_arc(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Records or replaces a step execution in the job's list.
    pub(crate) fn record_step(&self, step: &StepExecution) {
        let mut job = self.job.lock();
        match job.step_executions.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => job.step_executions.push(step.clone()),
        }
    }

    pub(crate) fn with_job<T>(&self, f: impl FnOnce(&mut JobExecution) -> T) -> T {
        f(&mut self.job.lock())
    }
}

impl std::fmt::Debug for StepScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepScope")
            .field("job_execution_id", &self.job_execution_id())
            .field("stop_requested", &self.is_stop_requested())
            .finish()
    }
}

// =============================================================================
// Step Contract
// =============================================================================

/// Terminal result of a step body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
}

impl StepOutcome {
    pub fn new(status: BatchStatus, exit_status: ExitStatus) -> Self {
        Self {
            status,
            exit_status,
        }
    }

    pub fn completed() -> Self {
        Self::new(BatchStatus::Completed, ExitStatus::completed())
    }

    pub fn stopped() -> Self {
        Self::new(
            BatchStatus::Stopped,
            ExitStatus::stopped().with_description("stop requested"),
        )
    }
}

pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn options(&self) -> StepOptions {
        StepOptions::default()
    }

    /// Runs the step, recording status, counts and failures in `execution`.
    ///
    /// Step failures are reported through `execution.status`; `Err` is
    /// reserved for failures to record the execution at all.
    fn execute<'a>(
        &'a self,
        execution: &'a mut StepExecution,
        scope: &'a StepScope,
    ) -> BoxFuture<'a, Result<(), BatchError>>;
}

/// Marks the execution started and runs the before-step hooks.
pub(crate) fn begin_step(
    hooks: &StepHooks,
    execution: &mut StepExecution,
    scope: &StepScope,
) -> Result<(), BatchError> {
    execution.status = BatchStatus::Started;
    execution.exit_status = ExitStatus::executing();
    execution.start_time = Utc::now();
    scope.repository().update_step_execution(execution)?;
    info!(
        step = %execution.step_name,
        step_execution_id = execution.id,
        "Executing step"
    );
    scope.telemetry().emit(BatchEvent::StepStarted {
        step: execution.step_name.clone(),
        step_execution_id: execution.id,
        job_execution_id: execution.job_execution_id,
    });
    hooks.before_step(execution);
    Ok(())
}

/// Applies the body's outcome, runs after-step hooks and promotion, persists.
pub(crate) fn finish_step(
    hooks: &StepHooks,
    execution: &mut StepExecution,
    scope: &StepScope,
    result: Result<StepOutcome, BatchError>,
) -> Result<(), BatchError> {
    match result {
        Ok(outcome) => {
            execution.status = outcome.status;
            execution.exit_status = outcome.exit_status.and(execution.exit_status.clone());
        }
        Err(err) => {
            error!(step = %execution.step_name, error = %err, "Step failed");
            execution.fail(err);
        }
    }

    hooks.after_step(execution);

    if execution.status == BatchStatus::Completed {
        let promoted = scope.update_job_context(|ctx| hooks.promote(execution, ctx));
        if let Err(err) = promoted.and_then(|r| r) {
            error!(step = %execution.step_name, error = %err, "Context promotion failed");
            execution.fail(err);
        }
    }

    execution.end_time = Some(Utc::now());
    scope.repository().update_step_execution(execution)?;
    scope.record_step(execution);
    scope.telemetry().emit(BatchEvent::StepCompleted {
        step: execution.step_name.clone(),
        step_execution_id: execution.id,
        status: execution.status,
        exit_code: execution.exit_status.code().to_string(),
        read: execution.read_count,
        written: execution.write_count,
        filtered: execution.filter_count,
        skipped: execution.skip_count(),
        commits: execution.commit_count,
        rollbacks: execution.rollback_count,
        duration: execution.duration().unwrap_or_default(),
    });
    Ok(())
}

/// Runs a step inside a job, applying restart rules.
///
/// A step that completed in an earlier execution of the same instance is not
/// run again (and gets no new [`StepExecution`]) unless it allows it; its
/// previous execution is returned instead. A restarted step inherits the
/// context of its last unfinished execution.
pub async fn execute_step(step: &dyn Step, scope: &StepScope) -> Result<StepExecution, BatchError> {
    let instance = scope.job_instance();
    let job_execution_id = scope.job_execution_id();
    let options = step.options();

    let last = scope
        .repository()
        .last_step_execution(&instance, step.name())
        .filter(|last| last.job_execution_id != job_execution_id);

    if let Some(last) = &last {
        let complete = last.status == BatchStatus::Completed && !options.allow_start_if_complete;
        if complete || last.status == BatchStatus::Abandoned {
            info!(step = %step.name(), status = %last.status, "Step already finished, not re-running");
            scope.telemetry().emit(BatchEvent::StepSkipped {
                step: step.name().to_string(),
                job_execution_id,
            });
            return Ok(last.clone());
        }
    }

    let count = scope.repository().step_execution_count(&instance, step.name());
    if count >= options.start_limit {
        return Err(BatchError::StartLimitExceeded {
            step: step.name().to_string(),
            count,
            limit: options.start_limit,
        });
    }

    let mut execution = StepExecution::new(0, job_execution_id, step.name());
    if let Some(last) = last.filter(|l| l.status != BatchStatus::Completed) {
        debug!(step = %step.name(), previous = last.id, "Restoring context of previous execution");
        execution.execution_context = last.execution_context;
    }
    scope.repository().add_step_execution(&mut execution)?;
    scope.record_step(&execution);

    step.execute(&mut execution, scope).await?;
    scope.record_step(&execution);
    Ok(execution)
}

// =============================================================================
// Chunk Step
// =============================================================================

/// Builds a reader or writer when the step starts.
pub type ComponentFactory<T> =
    Arc<dyn Fn(&StepExecution, &StepScope) -> Result<T, BatchError> + Send + Sync>;

/// Chunk-oriented step: read, process and write in chunk transactions.
pub struct ChunkStep<R, P: ItemProcessor, W> {
    name: String,
    options: StepOptions,
    chunk: ChunkConfig,
    reader: ComponentFactory<R>,
    processor: Arc<P>,
    writer: ComponentFactory<W>,
    fault: FaultTolerance,
    recoverer: Option<ItemRecoverer<P::Input, P::Output>>,
    listeners: StepListeners<P::Input, P::Output>,
    hooks: StepHooks,
}

impl<R, P, W> ChunkStep<R, P, W>
where
    R: ItemReader<Item = P::Input> + 'static,
    P: ItemProcessor + 'static,
    W: ItemWriter<Item = P::Output> + 'static,
{
    pub fn new(
        name: impl Into<String>,
        reader: impl Fn(&StepExecution, &StepScope) -> Result<R, BatchError> + Send + Sync + 'static,
        processor: P,
        writer: impl Fn(&StepExecution, &StepScope) -> Result<W, BatchError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            options: StepOptions::default(),
            chunk: ChunkConfig::default(),
            reader: Arc::new(reader),
            processor: Arc::new(processor),
            writer: Arc::new(writer),
            fault: FaultTolerance::default(),
            recoverer: None,
            listeners: StepListeners::new(),
            hooks: StepHooks::default(),
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk = ChunkConfig::new(chunk_size);
        self
    }

    pub fn chunk_config(mut self, chunk: ChunkConfig) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn fault_tolerance(mut self, fault: FaultTolerance) -> Self {
        self.fault = fault;
        self
    }

    /// Fallback for items whose processing failed and cannot be skipped.
    pub fn recoverer(
        mut self,
        recoverer: impl Fn(&P::Input, &ItemError) -> Result<Option<P::Output>, ItemError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.recoverer = Some(Arc::new(recoverer));
        self
    }

    pub fn listeners(mut self, listeners: StepListeners<P::Input, P::Output>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.hooks.listeners.push(listener);
        self
    }

    pub fn promote(mut self, promotion: ExecutionContextPromotionListener) -> Self {
        self.hooks.promotions.push(promotion);
        self
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }

    pub fn start_limit(mut self, limit: u32) -> Self {
        self.options.start_limit = limit;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.options.allow_start_if_complete = allow;
        self
    }

    async fn run(
        &self,
        execution: &mut StepExecution,
        scope: &StepScope,
    ) -> Result<StepOutcome, BatchError> {
        self.chunk.validate()?;
        let mut reader = (self.reader)(execution, scope)?;
        let writer = (self.writer)(execution, scope)?;
        open_streams(&mut reader, &writer, execution)?;

        let skips = AtomicU64::new(0);
        let runner = match ChunkRunner::new(
            self.processor.as_ref(),
            &writer,
            &self.fault,
            &self.listeners,
            &skips,
            self.chunk.chunk_size,
        ) {
            Ok(runner) => runner.with_recoverer(self.recoverer.as_ref()),
            Err(e) => {
                close_streams(&mut reader, &writer, &execution.step_name);
                return Err(e);
            }
        };

        let shared = Mutex::new(execution.clone());
        let worker = ChunkWorker {
            runner,
            writer: &writer,
            listeners: &self.listeners,
            execution: &shared,
            scope,
            halt: scope.stop_token(),
            save_state: true,
        };
        let exit = worker.run(0, &mut reader).await;
        *execution = shared.into_inner();

        close_streams(&mut reader, &writer, &execution.step_name);
        Ok(exit?.into_outcome())
    }
}

impl<R, T, W> ChunkStep<R, PassThroughItemProcessor<T>, W>
where
    R: ItemReader<Item = T> + 'static,
    T: Clone + Send + Sync + 'static,
    W: ItemWriter<Item = T> + 'static,
{
    /// Chunk step that writes items exactly as read.
    pub fn without_processor(
        name: impl Into<String>,
        reader: impl Fn(&StepExecution, &StepScope) -> Result<R, BatchError> + Send + Sync + 'static,
        writer: impl Fn(&StepExecution, &StepScope) -> Result<W, BatchError> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, reader, PassThroughItemProcessor::new(), writer)
    }
}

impl<R, P, W> ChunkStep<R, P, W>
where
    R: ItemReader<Item = P::Input> + Clone + 'static,
    P: ItemProcessor + 'static,
    W: ItemWriter<Item = P::Output> + 'static,
{
    /// Runs chunks on `workers` concurrent workers sharing one reader.
    ///
    /// The reader is cloned per worker, so it must hand out each item once
    /// across clones (see [`SynchronizedItemReader`](super::item::SynchronizedItemReader)).
    pub fn multi_threaded(self, workers: usize) -> MultiThreadedStep<R, P, W> {
        MultiThreadedStep {
            inner: self,
            workers: workers.max(1),
        }
    }
}

impl<R, P, W> Step for ChunkStep<R, P, W>
where
    R: ItemReader<Item = P::Input> + 'static,
    P: ItemProcessor + 'static,
    W: ItemWriter<Item = P::Output> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> StepOptions {
        self.options.clone()
    }

    fn execute<'a>(
        &'a self,
        execution: &'a mut StepExecution,
        scope: &'a StepScope,
    ) -> BoxFuture<'a, Result<(), BatchError>> {
        Box::pin(async move {
            begin_step(&self.hooks, execution, scope)?;
            let result = self.run(execution, scope).await;
            finish_step(&self.hooks, execution, scope, result)
        })
    }
}

/// Opens the reader, then the writer. If the writer fails to open, the
/// reader is closed again before the error is returned.
fn open_streams<R: ItemReader, W: ItemWriter>(
    reader: &mut R,
    writer: &W,
    execution: &StepExecution,
) -> Result<(), BatchError> {
    reader.open(&execution.execution_context)?;
    if let Err(e) = writer.open(&execution.execution_context) {
        if let Err(close) = reader.close() {
            warn!(step = %execution.step_name, error = %close, "Failed to close reader");
        }
        return Err(e.into());
    }
    Ok(())
}

fn close_streams<R: ItemReader, W: ItemWriter>(reader: &mut R, writer: &W, step: &str) {
    if let Err(e) = reader.close() {
        warn!(step = %step, error = %e, "Failed to close reader");
    }
    if let Err(e) = writer.close() {
        warn!(step = %step, error = %e, "Failed to close writer");
    }
}

// =============================================================================
// Chunk Worker
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerExit {
    /// Input exhausted.
    Exhausted,
    /// Stopped at a chunk boundary.
    Halted,
}

impl WorkerExit {
    fn into_outcome(self) -> StepOutcome {
        match self {
            Self::Exhausted => StepOutcome::completed(),
            Self::Halted => StepOutcome::stopped(),
        }
    }
}

/// One chunk loop committing into a shared step execution.
struct ChunkWorker<'a, P: ItemProcessor, W> {
    runner: ChunkRunner<'a, P, W>,
    writer: &'a W,
    listeners: &'a StepListeners<P::Input, P::Output>,
    execution: &'a Mutex<StepExecution>,
    scope: &'a StepScope,
    halt: &'a CancellationToken,
    /// Whether the reader saves its position at each commit.
    save_state: bool,
}

impl<'a, P, W> ChunkWorker<'a, P, W>
where
    P: ItemProcessor,
    W: ItemWriter<Item = P::Output>,
{
    async fn run<R>(&self, worker: usize, reader: &mut R) -> Result<WorkerExit, BatchError>
    where
        R: ItemReader<Item = P::Input>,
    {
        let mut chunk_index = 0u64;
        loop {
            if self.halt.is_cancelled() {
                info!(worker, "Stop observed at chunk boundary");
                return Ok(WorkerExit::Halted);
            }
            chunk_index += 1;

            let (ctx, committed) = {
                let execution = self.execution.lock();
                let ctx = ChunkContext {
                    step_name: execution.step_name.clone(),
                    step_execution_id: execution.id,
                    chunk_index,
                    worker,
                };
                (ctx, execution.execution_context.clone())
            };
            self.listeners.before_chunk(&ctx);

            let mut tx = ChunkTransaction::begin(&committed);
            let result = match self.runner.run_chunk(reader, &mut tx, self).await {
                Ok(ChunkResult::EndOfInput) => return Ok(WorkerExit::Exhausted),
                Ok(ChunkResult::Processed {
                    end_of_input,
                    skipped,
                    ..
                }) => self
                    .stage_stream_state(reader, &mut tx)
                    .map(|()| (end_of_input, skipped)),
                Err(e) => Err(e),
            };

            match result {
                Ok((end_of_input, skipped)) => {
                    self.commit(&ctx, tx, &skipped)?;
                    if end_of_input {
                        return Ok(WorkerExit::Exhausted);
                    }
                }
                Err(err) => {
                    {
                        let mut execution = self.execution.lock();
                        tx.rollback(&mut execution);
                    }
                    self.listeners.after_chunk_error(&ctx, &err);
                    self.scope.telemetry().emit(BatchEvent::ChunkRolledBack {
                        step: ctx.step_name.clone(),
                        chunk: chunk_index,
                        worker,
                        error: err.to_string(),
                    });
                    return Err(err);
                }
            }
        }
    }

    fn stage_stream_state<R: ItemReader>(
        &self,
        reader: &mut R,
        tx: &mut ChunkTransaction,
    ) -> Result<(), BatchError> {
        if self.save_state {
            reader.update(tx.context_mut())?;
        }
        self.writer.update(tx.context_mut())?;
        Ok(())
    }

    fn commit(
        &self,
        ctx: &ChunkContext,
        tx: ChunkTransaction,
        skipped: &SkippedItems<P::Input, P::Output>,
    ) -> Result<(), BatchError> {
        let contribution = tx.contribution().clone();
        let snapshot = {
            let mut execution = self.execution.lock();
            tx.commit(&mut execution);
            execution.clone()
        };
        self.scope.repository().update_step_execution(&snapshot)?;
        skipped.notify(self.listeners);
        self.listeners.after_chunk(ctx);
        debug!(
            step = %ctx.step_name,
            chunk = ctx.chunk_index,
            worker = ctx.worker,
            read = contribution.read_count,
            written = contribution.write_count,
            "Chunk committed"
        );
        self.scope.telemetry().emit(BatchEvent::ChunkCommitted {
            step: ctx.step_name.clone(),
            chunk: ctx.chunk_index,
            worker: ctx.worker,
            read: contribution.read_count,
            written: contribution.write_count,
            filtered: contribution.filter_count,
            skipped: contribution.skip_count(),
        });
        Ok(())
    }
}

impl<P, W> ScanCommit for ChunkWorker<'_, P, W>
where
    P: ItemProcessor,
    W: ItemWriter<Item = P::Output>,
{
    fn commit_scanned(&self, contribution: &StepContribution) -> Result<(), BatchError> {
        let snapshot = {
            let mut execution = self.execution.lock();
            execution.apply(contribution);
            execution.clone()
        };
        debug!(step = %snapshot.step_name, "Scanned item committed");
        self.scope.repository().update_step_execution(&snapshot)
    }
}

// =============================================================================
// Multi-Threaded Step
// =============================================================================

/// Chunk step whose chunks run concurrently on a pool of workers.
///
/// Each worker owns its chunk and transaction. Workers share the reader
/// (through clones), the writer, the skip tally and the step execution.
/// Reader positions are not saved, so a restart reprocesses from the start.
pub struct MultiThreadedStep<R, P: ItemProcessor, W> {
    inner: ChunkStep<R, P, W>,
    workers: usize,
}

impl<R, P, W> MultiThreadedStep<R, P, W>
where
    R: ItemReader<Item = P::Input> + Clone + 'static,
    P: ItemProcessor + 'static,
    W: ItemWriter<Item = P::Output> + 'static,
{
    pub fn workers(&self) -> usize {
        self.workers
    }

    async fn run(
        &self,
        execution: &mut StepExecution,
        scope: &StepScope,
    ) -> Result<StepOutcome, BatchError> {
        let inner = &self.inner;
        inner.chunk.validate()?;
        let mut reader = (inner.reader)(execution, scope)?;
        let writer = Arc::new((inner.writer)(execution, scope)?);
        open_streams(&mut reader, writer.as_ref(), execution)?;

        let shared = Arc::new(Mutex::new(execution.clone()));
        let skips = Arc::new(AtomicU64::new(0));
        let halt = scope.stop_token().child_token();
        let chunk_size = inner.chunk.chunk_size;

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let mut reader = reader.clone();
            let processor = Arc::clone(&inner.processor);
            let writer = Arc::clone(&writer);
            let fault = inner.fault.clone();
            let listeners = inner.listeners.clone();
            let recoverer = inner.recoverer.clone();
            let skips = Arc::clone(&skips);
            let shared = Arc::clone(&shared);
            let scope = scope.clone();
            let halt = halt.clone();

            workers.spawn(async move {
                let runner = ChunkRunner::new(
                    processor.as_ref(),
                    writer.as_ref(),
                    &fault,
                    &listeners,
                    &skips,
                    chunk_size,
                )?
                .with_recoverer(recoverer.as_ref());
                let chunk_worker = ChunkWorker {
                    runner,
                    writer: writer.as_ref(),
                    listeners: &listeners,
                    execution: &shared,
                    scope: &scope,
                    halt: &halt,
                    save_state: false,
                };
                let exit = chunk_worker.run(worker, &mut reader).await;
                if exit.is_err() {
                    halt.cancel();
                }
                exit
            });
        }
        debug!(step = %inner.name, workers = self.workers, "Chunk workers started");

        let mut errors = Vec::new();
        let mut halted = false;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(WorkerExit::Exhausted)) => {}
                Ok(Ok(WorkerExit::Halted)) => halted = true,
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => {
                    halt.cancel();
                    errors.push(BatchError::WorkerAborted {
                        worker: inner.name.clone(),
                        reason: join_err.to_string(),
                    });
                }
            }
        }

        *execution = shared.lock().clone();
        close_streams(&mut reader, writer.as_ref(), &execution.step_name);

        let mut errors = errors.into_iter();
        if let Some(first) = errors.next() {
            execution.failures.extend(errors);
            return Err(first);
        }
        if halted && scope.is_stop_requested() {
            return Ok(StepOutcome::stopped());
        }
        Ok(StepOutcome::completed())
    }
}

impl<R, P, W> Step for MultiThreadedStep<R, P, W>
where
    R: ItemReader<Item = P::Input> + Clone + 'static,
    P: ItemProcessor + 'static,
    W: ItemWriter<Item = P::Output> + 'static,
{
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn options(&self) -> StepOptions {
        self.inner.options.clone()
    }

    fn execute<'a>(
        &'a self,
        execution: &'a mut StepExecution,
        scope: &'a StepScope,
    ) -> BoxFuture<'a, Result<(), BatchError>> {
        Box::pin(async move {
            begin_step(&self.inner.hooks, execution, scope)?;
            let result = self.run(execution, scope).await;
            finish_step(&self.inner.hooks, execution, scope, result)
        })
    }
}

// =============================================================================
// Tasklet Step
// =============================================================================

/// State handed to each tasklet call.
pub struct TaskletContext {
    pub chunk: ChunkContext,
    /// Staged step context; kept only if the call commits.
    pub step_context: ExecutionContext,
    pub scope: StepScope,
}

/// A single repeatable unit of work.
pub trait Tasklet: Send + Sync {
    /// Performs one transaction's worth of work.
    ///
    /// Counts recorded in `contribution` are applied when the call commits.
    fn execute<'a>(
        &'a self,
        contribution: &'a mut StepContribution,
        context: &'a mut TaskletContext,
    ) -> BoxFuture<'a, Result<RepeatStatus, ItemError>>;
}

/// Tasklet backed by a synchronous closure.
pub struct FnTasklet<F> {
    f: F,
}

impl<F> FnTasklet<F>
where
    F: Fn(&mut StepContribution, &mut TaskletContext) -> Result<RepeatStatus, ItemError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Tasklet for FnTasklet<F>
where
    F: Fn(&mut StepContribution, &mut TaskletContext) -> Result<RepeatStatus, ItemError> + Send + Sync,
{
    fn execute<'a>(
        &'a self,
        contribution: &'a mut StepContribution,
        context: &'a mut TaskletContext,
    ) -> BoxFuture<'a, Result<RepeatStatus, ItemError>> {
        Box::pin(futures::future::ready((self.f)(contribution, context)))
    }
}

/// Step that calls a tasklet until it reports [`RepeatStatus::Finished`].
pub struct TaskletStep<T> {
    name: String,
    options: StepOptions,
    tasklet: T,
    repeat: RepeatTemplate,
    hooks: StepHooks,
}

impl<T: Tasklet> TaskletStep<T> {
    pub fn new(name: impl Into<String>, tasklet: T) -> Self {
        Self {
            name: name.into(),
            options: StepOptions::default(),
            tasklet,
            repeat: RepeatTemplate::new(),
            hooks: StepHooks::default(),
        }
    }

    /// Ends the loop early once the policy is satisfied.
    pub fn completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.repeat = self.repeat.with_completion_policy(policy);
        self
    }

    /// Decides whether a failed call (already rolled back) ends the step.
    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.repeat = self.repeat.with_exception_handler(handler);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.hooks.listeners.push(listener);
        self
    }

    pub fn promote(mut self, promotion: ExecutionContextPromotionListener) -> Self {
        self.hooks.promotions.push(promotion);
        self
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.options.allow_start_if_complete = allow;
        self
    }

    async fn run(
        &self,
        execution: &mut StepExecution,
        scope: &StepScope,
    ) -> Result<StepOutcome, BatchError> {
        let mut repeat = self.repeat.start();
        let mut chunk_index = 0u64;
        loop {
            if scope.is_stop_requested() {
                info!(step = %self.name, "Stop observed between tasklet calls");
                return Ok(StepOutcome::stopped());
            }
            chunk_index += 1;

            let mut tx = ChunkTransaction::begin(&execution.execution_context);
            let mut context = TaskletContext {
                chunk: ChunkContext {
                    step_name: self.name.clone(),
                    step_execution_id: execution.id,
                    chunk_index,
                    worker: 0,
                },
                step_context: execution.execution_context.clone(),
                scope: scope.clone(),
            };

            let result = self.tasklet.execute(tx.contribution_mut(), &mut context).await;
            let result = match result {
                Ok(status) => {
                    *tx.context_mut() = context.step_context;
                    tx.commit(execution);
                    scope.repository().update_step_execution(execution)?;
                    Ok(status)
                }
                Err(err) => {
                    warn!(step = %self.name, error = %err, "Tasklet call failed, rolling back");
                    tx.rollback(execution);
                    Err(err)
                }
            };

            if self.repeat.advance(&mut repeat, result)? {
                return Ok(StepOutcome::completed());
            }
        }
    }
}

impl<T: Tasklet> Step for TaskletStep<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> StepOptions {
        self.options.clone()
    }

    fn execute<'a>(
        &'a self,
        execution: &'a mut StepExecution,
        scope: &'a StepScope,
    ) -> BoxFuture<'a, Result<(), BatchError>> {
        Box::pin(async move {
            begin_step(&self.hooks, execution, scope)?;
            let result = self.run(execution, scope).await;
            finish_step(&self.hooks, execution, scope, result)
        })
    }
}
