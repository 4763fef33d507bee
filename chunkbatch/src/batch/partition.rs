//! Partitioned steps.
//!
//! A [`Partitioner`] splits the input ahead of time into named slices, each
//! described by an [`ExecutionContext`]. A [`PartitionStep`] (the master)
//! then runs one worker [`StepExecution`] per slice, named
//! `{master}:{partition}`, with the slice's context as its starting context.
//! Readers and writers built by the worker step's factories see that context
//! and bind to their slice.
//!
//! ```text
//!                 ┌─► worker master:partition0 ─┐
//!   master ──────►├─► worker master:partition1 ─┼──► aggregate
//!  (partition)    └─► worker master:partition2 ─┘   (any FAILED ⇒ FAILED)
//! ```
//!
//! At most `throttle_limit` workers run at once. The master waits for every
//! worker, adds their counts to its own and takes the worst status.
//!
//! On restart the master reuses the partition names recorded in its context;
//! workers that completed before are not run again and unfinished workers
//! resume from their last committed context.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::error::BatchError;
use super::execution::StepExecution;
use super::listener::{ExecutionContextPromotionListener, StepExecutionListener, StepHooks};
use super::status::{BatchStatus, ExitStatus};
use super::step::{begin_step, finish_step, Step, StepOptions, StepOutcome, StepScope};
use super::telemetry::BatchEvent;

// =============================================================================
// Concurrency Configuration
// =============================================================================

/// Default number of partitions requested from the partitioner.
pub const DEFAULT_GRID_SIZE: usize = 4;

/// Default maximum number of partitions running at once.
pub const DEFAULT_THROTTLE_LIMIT: usize = 4;

/// Number of available CPU cores.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Concurrency settings for multi-threaded and partitioned steps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    /// Chunk workers of a multi-threaded step.
    pub worker_threads: usize,
    /// Partitions requested from the partitioner.
    pub grid_size: usize,
    /// Partitions running at once.
    pub throttle_limit: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus(),
            grid_size: DEFAULT_GRID_SIZE,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
        }
    }
}

impl From<&crate::config::ConcurrencySettings> for ConcurrencyConfig {
    fn from(settings: &crate::config::ConcurrencySettings) -> Self {
        Self {
            worker_threads: settings.worker_threads,
            grid_size: settings.grid_size,
            throttle_limit: settings.throttle_limit,
        }
    }
}

// =============================================================================
// Partitioners
// =============================================================================

/// Splits the input into named slices.
pub trait Partitioner: Send + Sync {
    /// Returns one context per partition; `grid_size` is a hint.
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext>;
}

impl<F> Partitioner for F
where
    F: Fn(usize) -> BTreeMap<String, ExecutionContext> + Send + Sync,
{
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext> {
        self(grid_size)
    }
}

/// Name of the partition with the given index.
pub fn partition_name(index: usize) -> String {
    format!("partition{}", index)
}

/// Creates `grid_size` partitions with empty contexts.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimplePartitioner;

impl Partitioner for SimplePartitioner {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext> {
        (0..grid_size)
            .map(|i| (partition_name(i), ExecutionContext::new()))
            .collect()
    }
}

/// Splits an inclusive integer key range into contiguous sub-ranges.
///
/// Each partition's context holds `min_value` and `max_value`. Ranges are
/// sized `(max - min) / grid_size + 1`, so the last one may be shorter and
/// fewer than `grid_size` partitions come back when the range is small.
#[derive(Clone, Copy, Debug)]
pub struct ColumnRangePartitioner {
    min: i64,
    max: i64,
}

impl ColumnRangePartitioner {
    pub const MIN_KEY: &'static str = "min_value";
    pub const MAX_KEY: &'static str = "max_value";

    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

impl Partitioner for ColumnRangePartitioner {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext> {
        let mut partitions = BTreeMap::new();
        if self.min > self.max {
            return partitions;
        }
        // Widened so that spans up to the full i64 range cannot overflow
        let (min, max) = (i128::from(self.min), i128::from(self.max));
        let target = (max - min) / grid_size.max(1) as i128 + 1;

        let mut start = min;
        let mut index = 0;
        while start <= max {
            let end = (start + target - 1).min(max);
            let mut ctx = ExecutionContext::new();
            // Both bounds lie within min..=max, so they narrow back losslessly
            ctx.put(Self::MIN_KEY, start as i64);
            ctx.put(Self::MAX_KEY, end as i64);
            partitions.insert(partition_name(index), ctx);
            start = end + 1;
            index += 1;
        }
        partitions
    }
}

// =============================================================================
// Partition Step
// =============================================================================

/// Master context key listing the partitions handed out.
const PARTITION_NAMES_KEY: &str = "batch.partition.names";

/// Runs a worker step once per partition and aggregates the results.
pub struct PartitionStep {
    name: String,
    partitioner: Arc<dyn Partitioner>,
    worker: Arc<dyn Step>,
    grid_size: usize,
    throttle_limit: usize,
    options: StepOptions,
    hooks: StepHooks,
}

impl PartitionStep {
    pub fn new(
        name: impl Into<String>,
        partitioner: impl Partitioner + 'static,
        worker: impl Step + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            partitioner: Arc::new(partitioner),
            worker: Arc::new(worker),
            grid_size: DEFAULT_GRID_SIZE,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            options: StepOptions::default(),
            hooks: StepHooks::default(),
        }
    }

    pub fn grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size.max(1);
        self
    }

    pub fn throttle_limit(mut self, limit: usize) -> Self {
        self.throttle_limit = limit.max(1);
        self
    }

    /// Applies grid size and throttle limit from a [`ConcurrencyConfig`].
    pub fn with_concurrency(self, config: &ConcurrencyConfig) -> Self {
        self.grid_size(config.grid_size)
            .throttle_limit(config.throttle_limit)
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

    /// Partitions to run, reusing the names of an interrupted execution.
    fn plan(&self, execution: &mut StepExecution) -> Result<Vec<(String, ExecutionContext)>, BatchError> {
        let mut fresh = self.partitioner.partition(self.grid_size);
        let saved: Option<Vec<String>> = execution
            .execution_context
            .get_deserialized(PARTITION_NAMES_KEY)?;

        if let Some(names) = saved {
            debug!(step = %self.name, partitions = names.len(), "Reusing partitions of previous execution");
            return Ok(names
                .into_iter()
                .map(|name| {
                    let ctx = fresh.remove(&name).unwrap_or_default();
                    (name, ctx)
                })
                .collect());
        }

        let names: Vec<&String> = fresh.keys().collect();
        execution
            .execution_context
            .put_serialized(PARTITION_NAMES_KEY, &names)?;
        Ok(fresh.into_iter().collect())
    }

    /// Creates the worker execution for a partition, or `None` if it
    /// already completed in an earlier job execution.
    fn prepare_worker(
        &self,
        worker_name: String,
        context: ExecutionContext,
        scope: &StepScope,
    ) -> Result<Option<StepExecution>, BatchError> {
        let instance = scope.job_instance();
        let job_execution_id = scope.job_execution_id();
        let last = scope
            .repository()
            .last_step_execution(&instance, &worker_name)
            .filter(|last| last.job_execution_id != job_execution_id);

        if last.as_ref().map(|l| l.status) == Some(BatchStatus::Completed) {
            debug!(worker = %worker_name, "Partition already complete");
            return Ok(None);
        }

        let mut execution = StepExecution::new(0, job_execution_id, worker_name);
        execution.execution_context = match last {
            Some(last) => last.execution_context,
            None => context,
        };
        scope.repository().add_step_execution(&mut execution)?;
        scope.record_step(&execution);
        Ok(Some(execution))
    }

    async fn run(
        &self,
        execution: &mut StepExecution,
        scope: &StepScope,
    ) -> Result<StepOutcome, BatchError> {
        let partitions = self.plan(execution)?;
        scope.repository().update_step_execution(execution)?;
        let total = partitions.len();

        info!(
            step = %self.name,
            partitions = total,
            throttle_limit = self.throttle_limit,
            "Partitions created"
        );
        scope.telemetry().emit(BatchEvent::PartitionsCreated {
            step: self.name.clone(),
            partitions: total,
            throttle_limit: self.throttle_limit,
        });

        let semaphore = Arc::new(Semaphore::new(self.throttle_limit));
        let mut workers = JoinSet::new();
        for (partition, context) in partitions {
            let worker_name = format!("{}:{}", self.name, partition);
            let Some(mut worker_execution) = self.prepare_worker(worker_name, context, scope)? else {
                continue;
            };

            let worker = Arc::clone(&self.worker);
            let semaphore = Arc::clone(&semaphore);
            let scope = scope.clone();
            workers.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        let result = worker.execute(&mut worker_execution, &scope).await;
                        result
                    }
                    Err(e) => Err(BatchError::WorkerAborted {
                        worker: worker_execution.step_name.clone(),
                        reason: e.to_string(),
                    }),
                };
                (worker_execution, result)
            });
        }

        let mut status = BatchStatus::Completed;
        let mut exit_status = ExitStatus::completed();
        let mut failed_workers = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((mut worker_execution, result)) => {
                    if let Err(err) = result {
                        worker_execution.fail(err);
                        scope.record_step(&worker_execution);
                    }
                    if worker_execution.status == BatchStatus::Failed {
                        failed_workers += 1;
                        warn!(worker = %worker_execution.step_name, "Partition failed");
                    }
                    execution.accumulate(&worker_execution);
                    status = status.upgrade_to(worker_execution.status);
                    exit_status = exit_status.and(worker_execution.exit_status.clone());
                }
                Err(join_err) => {
                    failed_workers += 1;
                    status = status.upgrade_to(BatchStatus::Failed);
                    exit_status = exit_status.and(ExitStatus::failed());
                    execution.failures.push(BatchError::WorkerAborted {
                        worker: self.name.clone(),
                        reason: join_err.to_string(),
                    });
                }
            }
        }

        if failed_workers > 0 {
            exit_status = exit_status
                .with_description(format!("{} of {} partitions failed", failed_workers, total));
        }
        scope.telemetry().emit(BatchEvent::PartitionsCompleted {
            step: self.name.clone(),
            status,
            failed_workers,
        });
        Ok(StepOutcome::new(status, exit_status))
    }
}

impl Step for PartitionStep {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::error::ItemError;
    use crate::batch::execution::StepContribution;
    use crate::batch::item::{FnItemProcessor, ListItemReader, ListItemWriter};
    use crate::batch::repeat::RepeatStatus;
    use crate::batch::step::tests::test_scope;
    use crate::batch::step::{execute_step, ChunkStep, Tasklet, TaskletContext, TaskletStep};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn range_step(
        output: &ListItemWriter<i64>,
        fail_on: Option<i64>,
    ) -> impl Step + 'static {
        let sink = output.clone();
        ChunkStep::new(
            "worker",
            |execution: &StepExecution, _scope: &StepScope| {
                let ctx = &execution.execution_context;
                let min = ctx.get_i64(ColumnRangePartitioner::MIN_KEY).unwrap_or(0);
                let max = ctx.get_i64(ColumnRangePartitioner::MAX_KEY).unwrap_or(-1);
                Ok(ListItemReader::new(min..=max))
            },
            FnItemProcessor::new(move |n: &i64| {
                if Some(*n) == fail_on {
                    return Err(ItemError::new("data", format!("bad record {}", n)));
                }
                Ok(Some(*n))
            }),
            move |_: &StepExecution, _: &StepScope| Ok(sink.clone()),
        )
        .chunk_size(10)
    }

    #[test]
    fn test_simple_partitioner_creates_grid_size_partitions() {
        let partitions = SimplePartitioner.partition(3);
        let names: Vec<&str> = partitions.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["partition0", "partition1", "partition2"]);
    }

    #[test]
    fn test_column_range_partitioner_covers_range() {
        let partitions = ColumnRangePartitioner::new(1, 100).partition(4);
        let ranges: Vec<(i64, i64)> = (0..4)
            .map(|i| {
                let ctx = &partitions[&partition_name(i)];
                (
                    ctx.get_i64("min_value").unwrap(),
                    ctx.get_i64("max_value").unwrap(),
                )
            })
            .collect();
        assert_eq!(ranges, vec![(1, 25), (26, 50), (51, 75), (76, 100)]);
    }

    #[test]
    fn test_column_range_partitioner_small_range() {
        assert_eq!(ColumnRangePartitioner::new(1, 3).partition(5).len(), 3);
        assert!(ColumnRangePartitioner::new(5, 1).partition(2).is_empty());
    }

    fn bounds(partitions: &BTreeMap<String, ExecutionContext>) -> Vec<(i64, i64)> {
        (0..partitions.len())
            .map(|i| {
                let ctx = &partitions[&partition_name(i)];
                (
                    ctx.get_i64(ColumnRangePartitioner::MIN_KEY).unwrap(),
                    ctx.get_i64(ColumnRangePartitioner::MAX_KEY).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_column_range_partitioner_at_i64_max() {
        let partitions = ColumnRangePartitioner::new(i64::MAX - 5, i64::MAX).partition(2);
        assert_eq!(
            bounds(&partitions),
            vec![(i64::MAX - 5, i64::MAX - 3), (i64::MAX - 2, i64::MAX)]
        );

        let single = ColumnRangePartitioner::new(i64::MAX, i64::MAX).partition(3);
        assert_eq!(bounds(&single), vec![(i64::MAX, i64::MAX)]);
    }

    #[test]
    fn test_column_range_partitioner_full_i64_range() {
        let quarters = bounds(&ColumnRangePartitioner::new(i64::MIN, i64::MAX).partition(4));
        assert_eq!(quarters.len(), 4);
        assert_eq!(quarters[0].0, i64::MIN);
        assert_eq!(quarters[3].1, i64::MAX);
        assert!(quarters.windows(2).all(|w| w[0].1 + 1 == w[1].0));

        let whole = bounds(&ColumnRangePartitioner::new(i64::MIN, i64::MAX).partition(1));
        assert_eq!(whole, vec![(i64::MIN, i64::MAX)]);
    }

    #[test]
    fn test_closure_partitioner() {
        let partitioner = |grid: usize| -> BTreeMap<String, ExecutionContext> {
            (0..grid * 2)
                .map(|i| (format!("slice-{}", i), ExecutionContext::new()))
                .collect()
        };
        assert_eq!(partitioner.partition(2).len(), 4);
    }

    #[tokio::test]
    async fn test_partition_step_runs_one_worker_per_partition() {
        let scope = test_scope();
        let output = ListItemWriter::new();
        let step = PartitionStep::new(
            "master",
            ColumnRangePartitioner::new(1, 100),
            range_step(&output, None),
        )
        .grid_size(4);

        let master = execute_step(&step, &scope).await.unwrap();

        assert_eq!(master.status, BatchStatus::Completed);
        assert_eq!(master.read_count, 100);
        assert_eq!(master.write_count, 100);

        let mut items = output.items();
        items.sort();
        assert_eq!(items, (1..=100).collect::<Vec<_>>());

        let job = scope.job_execution();
        let mut workers: Vec<&str> = job
            .step_executions
            .iter()
            .map(|s| s.step_name.as_str())
            .filter(|name| name.starts_with("master:"))
            .collect();
        workers.sort();
        assert_eq!(
            workers,
            vec![
                "master:partition0",
                "master:partition1",
                "master:partition2",
                "master:partition3"
            ]
        );
    }

    #[tokio::test]
    async fn test_any_failed_worker_fails_master() {
        let scope = test_scope();
        let output = ListItemWriter::new();
        let step = PartitionStep::new(
            "master",
            ColumnRangePartitioner::new(1, 100),
            range_step(&output, Some(60)),
        )
        .grid_size(4);

        let master = execute_step(&step, &scope).await.unwrap();

        assert_eq!(master.status, BatchStatus::Failed);
        assert_eq!(master.exit_status.code(), ExitStatus::FAILED);
        let job = scope.job_execution();
        let failed: Vec<&str> = job
            .step_executions
            .iter()
            .filter(|s| s.status == BatchStatus::Failed)
            .map(|s| s.step_name.as_str())
            .collect();
        assert!(failed.contains(&"master:partition2"));
        assert!(failed.contains(&"master"));
        assert_eq!(failed.len(), 2);
    }

    struct ConcurrencyGauge {
        running: AtomicUsize,
        peak: Arc<AtomicUsize>,
    }

    impl Tasklet for ConcurrencyGauge {
        fn execute<'a>(
            &'a self,
            _contribution: &'a mut StepContribution,
            _context: &'a mut TaskletContext,
        ) -> BoxFuture<'a, Result<RepeatStatus, ItemError>> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(RepeatStatus::Finished)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_limit_bounds_concurrent_workers() {
        let peak = Arc::new(AtomicUsize::new(0));
        let gauge = ConcurrencyGauge {
            running: AtomicUsize::new(0),
            peak: Arc::clone(&peak),
        };
        let step = PartitionStep::new("master", SimplePartitioner, TaskletStep::new("gauge", gauge))
            .grid_size(6)
            .throttle_limit(2);

        let master = execute_step(&step, &test_scope()).await.unwrap();

        assert_eq!(master.status, BatchStatus::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
