//! Integration tests for the job launcher lifecycle.
//!
//! These tests drive spawned executions through their handles:
//! - Stop requests take effect between chunks, never inside one
//! - A stopped execution restarts from its last committed chunk
//! - Abandoned instances cannot be relaunched
//! - Telemetry reports the lifecycle in order
//!
//! Run with: `cargo test --test launcher_integration`

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use chunkbatch::batch::{
    BatchError, BatchStatus, ChunkStep, FnItemWriter, InMemoryJobRepository, Job, JobLauncher,
    JobParameters, ListItemReader, RecordingTelemetrySink, RunIdIncrementer, StepExecution,
    StepScope,
};

// ============================================================================
// Test Helpers
// ============================================================================

type Sink = Arc<Mutex<Vec<i64>>>;

/// Slow job over `1..=items` that reports every committed write.
fn slow_job(items: i64, sink: &Sink, written: mpsc::UnboundedSender<usize>) -> Job {
    let reader = move |_: &StepExecution, _: &StepScope| {
        Ok::<_, BatchError>(ListItemReader::new(1..=items).with_name("slow"))
    };
    let writer = {
        let sink = Arc::clone(sink);
        move |_: &StepExecution, _: &StepScope| {
            let sink = Arc::clone(&sink);
            let written = written.clone();
            Ok::<_, BatchError>(FnItemWriter::new(move |batch: &[i64]| {
                std::thread::sleep(Duration::from_millis(5));
                sink.lock().extend_from_slice(batch);
                let _ = written.send(batch.len());
                Ok(())
            }))
        }
    };
    Job::single_step(
        "slow",
        ChunkStep::without_processor("slow", reader, writer).chunk_size(10),
    )
}

// ============================================================================
// Stop and Restart
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_lands_on_chunk_boundary_and_restart_finishes() {
    let sink = Sink::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let job = Arc::new(slow_job(2_000, &sink, tx));
    let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));
    let parameters = JobParameters::new().with_string("file", "orders.csv");

    let mut handle = launcher.start(Arc::clone(&job), parameters.clone()).unwrap();
    rx.recv().await.unwrap();
    handle.stop().unwrap();
    let stopped = handle.wait().await.unwrap();

    assert_eq!(stopped.status, BatchStatus::Stopped);
    let step = stopped.step_execution("slow").unwrap();
    assert_eq!(step.status, BatchStatus::Stopped);
    assert!(step.commit_count < 200, "stop must end the step early");
    assert_eq!(step.write_count, step.commit_count * 10, "no partial chunk");
    assert_eq!(sink.lock().len() as u64, step.write_count);

    let restarted = launcher.run(&job, parameters).await.unwrap();

    assert_eq!(restarted.status, BatchStatus::Completed);
    assert_eq!(restarted.instance.id, stopped.instance.id);
    assert_eq!(sink.lock().clone(), (1..=2_000).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_instance_cannot_be_relaunched() {
    let sink = Sink::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let job = Arc::new(slow_job(2_000, &sink, tx));
    let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));

    let mut handle = launcher.start(Arc::clone(&job), JobParameters::new()).unwrap();
    rx.recv().await.unwrap();

    assert!(matches!(
        launcher.abandon(handle.execution_id()),
        Err(BatchError::IllegalState { operation: "abandon", .. })
    ));

    handle.stop().unwrap();
    handle.wait().await.unwrap();

    let abandoned = launcher.abandon(handle.execution_id()).unwrap();
    assert_eq!(abandoned.status, BatchStatus::Abandoned);

    let relaunch = launcher.run(&job, JobParameters::new()).await;
    assert!(matches!(relaunch, Err(BatchError::JobInstanceAbandoned { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_launch_of_running_instance_is_rejected() {
    let sink = Sink::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let job = Arc::new(slow_job(2_000, &sink, tx));
    let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));

    let mut handle = launcher.start(Arc::clone(&job), JobParameters::new()).unwrap();
    rx.recv().await.unwrap();

    let duplicate = launcher.run(&job, JobParameters::new()).await;
    assert!(matches!(
        duplicate,
        Err(BatchError::JobExecutionAlreadyRunning { .. })
    ));
    assert_eq!(launcher.running_executions(), vec![handle.execution_id()]);

    handle.stop().unwrap();
    handle.wait().await.unwrap();
    assert!(launcher.running_executions().is_empty());
}

// ============================================================================
// Parameters and Telemetry
// ============================================================================

#[tokio::test]
async fn test_run_next_creates_new_instances() {
    let sink = Sink::default();
    let (tx, _rx) = mpsc::unbounded_channel();
    let job = slow_job(20, &sink, tx).incrementer(Arc::new(RunIdIncrementer::new()));
    let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));

    let first = launcher.run_next(&job).await.unwrap();
    let second = launcher.run_next(&job).await.unwrap();

    assert_eq!(first.parameters.get_long("run.id"), Some(1));
    assert_eq!(second.parameters.get_long("run.id"), Some(2));
    assert_ne!(first.instance.id, second.instance.id);
    assert_eq!(sink.lock().len(), 40);
}

#[tokio::test]
async fn test_telemetry_reports_lifecycle_in_order() {
    let sink = Sink::default();
    let (tx, _rx) = mpsc::unbounded_channel();
    let job = slow_job(25, &sink, tx);
    let telemetry = Arc::new(RecordingTelemetrySink::new());
    let launcher =
        JobLauncher::new(Arc::new(InMemoryJobRepository::new())).with_telemetry(telemetry.clone());

    launcher.run(&job, JobParameters::new()).await.unwrap();

    assert_eq!(
        telemetry.event_types(),
        vec![
            "job_started",
            "step_started",
            "chunk_committed",
            "chunk_committed",
            "chunk_committed",
            "step_completed",
            "job_completed",
        ]
    );
}
