//! Integration tests for partitioned and multi-threaded steps.
//!
//! These tests verify concurrent execution through the launcher:
//! - One worker execution per partition, each with its own context
//! - The master fails exactly when a worker fails
//! - Restart re-runs only the partitions that did not complete
//! - Multi-threaded chunks and partition workers compose
//!
//! Run with: `cargo test --test partitioning_integration`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use chunkbatch::batch::{
    BatchError, BatchStatus, ChunkStep, ColumnRangePartitioner, ExecutionContext, FnItemWriter,
    InMemoryJobRepository, ItemError, Job, JobExecution, JobLauncher, JobParameters,
    ListItemReader, PartitionStep, StepExecution, StepScope, SynchronizedItemReader,
};

// ============================================================================
// Test Helpers
// ============================================================================

type Sink = Arc<Mutex<Vec<i64>>>;

fn launcher() -> JobLauncher {
    JobLauncher::new(Arc::new(InMemoryJobRepository::new()))
}

/// Worker step reading the partition's `min_value..=max_value` range.
///
/// While `broken` is set, writes containing `poison` fail fatally.
fn range_worker(sink: &Sink, broken: &Arc<AtomicBool>, poison: i64) -> impl chunkbatch::batch::Step {
    let reader = |execution: &StepExecution, _: &StepScope| {
        let ctx = &execution.execution_context;
        let min = ctx.get_i64(ColumnRangePartitioner::MIN_KEY).unwrap_or(0);
        let max = ctx.get_i64(ColumnRangePartitioner::MAX_KEY).unwrap_or(-1);
        Ok::<_, BatchError>(ListItemReader::new(min..=max).with_name("range"))
    };
    let writer = {
        let sink = Arc::clone(sink);
        let broken = Arc::clone(broken);
        move |_: &StepExecution, _: &StepScope| {
            let sink = Arc::clone(&sink);
            let broken = Arc::clone(&broken);
            Ok::<_, BatchError>(FnItemWriter::new(move |items: &[i64]| {
                if broken.load(Ordering::SeqCst) && items.contains(&poison) {
                    return Err(ItemError::new("db.deadlock", "deadlock detected"));
                }
                sink.lock().extend_from_slice(items);
                Ok(())
            }))
        }
    };
    ChunkStep::without_processor("worker", reader, writer).chunk_size(5)
}

fn workers<'a>(execution: &'a JobExecution, master: &str) -> Vec<&'a StepExecution> {
    let prefix = format!("{}:", master);
    let mut workers: Vec<&StepExecution> = execution
        .step_executions
        .iter()
        .filter(|s| s.step_name.starts_with(&prefix))
        .collect();
    workers.sort_by(|a, b| a.step_name.cmp(&b.step_name));
    workers
}

fn sorted(sink: &Sink) -> Vec<i64> {
    let mut items = sink.lock().clone();
    items.sort();
    items
}

// ============================================================================
// Partition Step
// ============================================================================

#[tokio::test]
async fn test_one_worker_execution_per_partition() {
    let sink = Sink::default();
    let broken = Arc::new(AtomicBool::new(false));
    let step = PartitionStep::new(
        "load",
        ColumnRangePartitioner::new(1, 100),
        range_worker(&sink, &broken, 0),
    )
    .grid_size(4)
    .throttle_limit(2);

    let execution = launcher()
        .run(&Job::single_step("partitioned", step), JobParameters::new())
        .await
        .unwrap();

    assert_eq!(execution.status, BatchStatus::Completed);
    let workers = workers(&execution, "load");
    assert_eq!(workers.len(), 4);

    let ranges: Vec<(i64, i64)> = workers
        .iter()
        .map(|w| {
            let ctx = &w.execution_context;
            (
                ctx.get_i64(ColumnRangePartitioner::MIN_KEY).unwrap(),
                ctx.get_i64(ColumnRangePartitioner::MAX_KEY).unwrap(),
            )
        })
        .collect();
    assert_eq!(ranges, vec![(1, 25), (26, 50), (51, 75), (76, 100)]);
    assert!(workers.iter().all(|w| w.status == BatchStatus::Completed));

    let master = execution.step_execution("load").unwrap();
    assert_eq!(master.read_count, 100);
    assert_eq!(master.write_count, 100);
    assert_eq!(sorted(&sink), (1..=100).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_custom_partitioner_contexts_reach_workers() {
    let sink = Sink::default();
    let broken = Arc::new(AtomicBool::new(false));
    let partitioner = |_grid_size: usize| {
        let mut partitions = BTreeMap::new();
        for (name, (min, max)) in [("evens", (2, 2)), ("odds", (7, 9)), ("empty", (5, 4))] {
            let mut ctx = ExecutionContext::new();
            ctx.put(ColumnRangePartitioner::MIN_KEY, min as i64);
            ctx.put(ColumnRangePartitioner::MAX_KEY, max as i64);
            partitions.insert(name.to_string(), ctx);
        }
        partitions
    };
    let step = PartitionStep::new("load", partitioner, range_worker(&sink, &broken, 0));

    let execution = launcher()
        .run(&Job::single_step("custom", step), JobParameters::new())
        .await
        .unwrap();

    let names: Vec<&str> = workers(&execution, "load")
        .iter()
        .map(|w| w.step_name.as_str())
        .collect();
    assert_eq!(names, vec!["load:empty", "load:evens", "load:odds"]);
    assert_eq!(sorted(&sink), vec![2, 7, 8, 9]);
}

#[tokio::test]
async fn test_master_fails_iff_a_worker_fails() {
    for poison in [0, 63] {
        let sink = Sink::default();
        let broken = Arc::new(AtomicBool::new(true));
        let step = PartitionStep::new(
            "load",
            ColumnRangePartitioner::new(1, 100),
            range_worker(&sink, &broken, poison),
        )
        .grid_size(4);

        let execution = launcher()
            .run(&Job::single_step("partitioned", step), JobParameters::new())
            .await
            .unwrap();

        let master = execution.step_execution("load").unwrap();
        let failed_workers: Vec<&str> = workers(&execution, "load")
            .iter()
            .filter(|w| w.status == BatchStatus::Failed)
            .map(|w| w.step_name.as_str())
            .collect();

        if poison == 0 {
            assert!(failed_workers.is_empty());
            assert_eq!(master.status, BatchStatus::Completed);
        } else {
            assert_eq!(failed_workers, vec!["load:partition2"]);
            assert_eq!(master.status, BatchStatus::Failed);
            assert_eq!(execution.status, BatchStatus::Failed);
        }
    }
}

#[tokio::test]
async fn test_restart_reruns_only_unfinished_partitions() {
    let sink = Sink::default();
    let broken = Arc::new(AtomicBool::new(true));
    let step = PartitionStep::new(
        "load",
        ColumnRangePartitioner::new(1, 100),
        range_worker(&sink, &broken, 63),
    )
    .grid_size(4);
    let job = Job::single_step("partitioned", step);
    let launcher = launcher();

    let first = launcher.run(&job, JobParameters::new()).await.unwrap();
    assert_eq!(first.status, BatchStatus::Failed);
    // partition2 covers 51..=75; chunks 51..=55 and 56..=60 committed before 61..=65 failed
    let mut expected_first: Vec<i64> = (1..=60).chain(76..=100).collect();
    expected_first.sort();
    assert_eq!(sorted(&sink), expected_first);

    broken.store(false, Ordering::SeqCst);
    let second = launcher.run(&job, JobParameters::new()).await.unwrap();

    assert_eq!(second.status, BatchStatus::Completed);
    let rerun: Vec<&str> = workers(&second, "load")
        .iter()
        .filter(|w| w.job_execution_id == second.id)
        .map(|w| w.step_name.as_str())
        .collect();
    assert_eq!(rerun, vec!["load:partition2"]);
    let resumed = second.step_execution("load:partition2").unwrap();
    assert_eq!(resumed.read_count, 15);
    assert_eq!(sorted(&sink), (1..=100).collect::<Vec<_>>());
}

// ============================================================================
// Multi-Threaded Steps
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_threaded_step_writes_each_item_once() {
    let sink = Sink::default();
    let reader = |_: &StepExecution, _: &StepScope| {
        Ok::<_, BatchError>(SynchronizedItemReader::new(ListItemReader::new(1..=500i64)))
    };
    let writer = {
        let sink = Arc::clone(&sink);
        move |_: &StepExecution, _: &StepScope| {
            let sink = Arc::clone(&sink);
            Ok::<_, BatchError>(FnItemWriter::new(move |items: &[i64]| {
                sink.lock().extend_from_slice(items);
                Ok(())
            }))
        }
    };
    let step = ChunkStep::without_processor("load", reader, writer)
        .chunk_size(7)
        .multi_threaded(4);

    let execution = launcher()
        .run(&Job::single_step("threaded", step), JobParameters::new())
        .await
        .unwrap();

    let load = execution.step_execution("load").unwrap();
    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(load.read_count, 500);
    assert_eq!(load.write_count, 500);
    assert_eq!(sorted(&sink), (1..=500).collect::<Vec<_>>());
}
