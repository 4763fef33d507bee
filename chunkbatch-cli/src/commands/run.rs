//! Run command - launch the record processing job.
//!
//! The job reads a generated range of records, validates and digests them,
//! and writes the digests to an in-memory store. Flags inject validation
//! failures, filtered records and transient write errors so fault tolerance
//! settings can be tried against a real run:
//!
//! ```text
//! chunkbatch run --items 500 --fail-every 97 --skip validation --skip-limit 10
//! chunkbatch run --items 500 --transient-every 50 --retry io.transient
//! chunkbatch run --items 10000 --partitioned
//! ```
//!
//! Ctrl-C requests a stop; the running chunk finishes and commits first.

use std::sync::Arc;

use clap::Args;
use dashmap::{DashMap, DashSet};
use tracing::{info, warn};

use chunkbatch::batch::{
    BatchError, BatchStatus, ChunkConfig, ChunkStep, ColumnRangePartitioner, ConcurrencyConfig,
    DefaultJobParametersValidator, ExitStatus, FaultTolerance, FlowBuilder, FlowNode, FnItemProcessor,
    FnItemWriter, FnTasklet, ItemError, ItemProcessor, ItemReader, ItemWriter, Job, JobExecution,
    JobLauncher, JobParameters, ListItemReader, PartitionStep, RepeatStatus, RunIdIncrementer,
    StepExecution, StepOptions, StepScope, SynchronizedItemReader, TaskletStep,
};
use chunkbatch::config::ConfigFile;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Name of the job and of its steps and flow nodes.
pub const JOB_NAME: &str = "records";
pub const PROCESS_STEP: &str = "process";
pub const WORKER_STEP: &str = "process-partition";
pub const SKIP_CHECK: &str = "skip-check";
pub const REPORT_STEP: &str = "report-skips";

/// Exit code the skip check routes to when records were skipped.
pub const COMPLETED_WITH_SKIPS: &str = "COMPLETED WITH SKIPS";

/// Error class of an injected validation failure.
pub const BAD_RECORD: &str = "validation.bad_record";

/// Error class of an injected write failure.
pub const TRANSIENT_WRITE: &str = "io.transient";

const DEFAULT_ITEMS: i64 = 1000;

/// Arguments for the run command.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Number of records to generate
    #[arg(long, default_value_t = DEFAULT_ITEMS)]
    pub items: i64,

    /// Fail validation of every Nth record (0 disables)
    #[arg(long, default_value_t = 0)]
    pub fail_every: i64,

    /// Filter out every Nth record (0 disables)
    #[arg(long, default_value_t = 0)]
    pub filter_every: i64,

    /// Fail the first write of every Nth record (0 disables)
    #[arg(long, default_value_t = 0)]
    pub transient_every: i64,

    /// Override [step] chunk_size
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Process chunks on this many concurrent workers
    #[arg(long, conflicts_with = "partitioned")]
    pub threads: Option<usize>,

    /// Split the record range into [concurrency] grid_size partitions
    #[arg(long)]
    pub partitioned: bool,

    /// Additional skippable error class (repeatable)
    #[arg(long = "skip", value_name = "CLASS")]
    pub skip: Vec<String>,

    /// Override [fault_tolerance] skip_limit
    #[arg(long)]
    pub skip_limit: Option<u64>,

    /// Additional retryable error class (repeatable)
    #[arg(long = "retry", value_name = "CLASS")]
    pub retry: Vec<String>,

    /// Run id of the job instance; the next unused id when omitted
    #[arg(long)]
    pub run_id: Option<i64>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            items: DEFAULT_ITEMS,
            fail_every: 0,
            filter_every: 0,
            transient_every: 0,
            chunk_size: None,
            threads: None,
            partitioned: false,
            skip: Vec::new(),
            skip_limit: None,
            retry: Vec::new(),
            run_id: None,
        }
    }
}

/// A generated input record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    pub payload: String,
}

impl Record {
    fn new(id: i64) -> Self {
        Self {
            id,
            payload: format!("record-{:08}", id),
        }
    }
}

/// The processed form of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest {
    pub id: i64,
    pub checksum: u64,
}

impl Digest {
    fn of(record: &Record) -> Self {
        let checksum = record
            .payload
            .bytes()
            .fold(record.id as u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
        Self {
            id: record.id,
            checksum,
        }
    }
}

/// Digests written by the job, keyed by record id.
pub type DigestStore = Arc<DashMap<i64, u64>>;

/// Run the run command.
pub fn run(args: RunArgs, debug: bool) -> Result<(), CliError> {
    if args.items < 1 {
        return Err(CliError::Config("--items must be at least 1".to_string()));
    }

    let runner = CliRunner::with_debug(debug)?;
    runner.log_startup("run");
    let config = runner.config().clone();
    let runtime = runner.runtime()?;

    let store: DigestStore = Arc::new(DashMap::new());
    let job = Arc::new(build_job(&args, &config, Arc::clone(&store))?);
    let launcher = JobLauncher::new(Arc::new(chunkbatch::batch::InMemoryJobRepository::new()));

    let execution = runtime.block_on(async {
        let parameters = job_parameters(&launcher, &job, &args)?;
        println!("Launching job '{}' with parameters {}", job.name(), parameters);

        let mut handle = launcher.start(Arc::clone(&job), parameters)?;
        let stopper = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(execution_id = stopper.execution_id(), "Interrupt received, stopping job");
                println!("Stopping after the current chunk...");
                if let Err(e) = stopper.stop() {
                    warn!(error = %e, "Stop request failed");
                }
            }
        });

        handle.wait().await.map_err(CliError::from)
    })?;

    print_summary(&execution, store.len());

    if execution.status == BatchStatus::Completed {
        Ok(())
    } else {
        Err(CliError::JobFailed {
            job: execution.job_name().to_string(),
            status: execution.status,
            exit_code: execution.exit_status.code().to_string(),
        })
    }
}

/// Parameters identifying the job instance to launch.
pub fn job_parameters(
    launcher: &JobLauncher,
    job: &Job,
    args: &RunArgs,
) -> Result<JobParameters, BatchError> {
    let base = JobParameters::new().with_long("items", args.items);
    match args.run_id {
        Some(id) => Ok(base.with_long(RunIdIncrementer::DEFAULT_KEY, id)),
        None => Ok(launcher.next_parameters(job)?.merged_with(&base)),
    }
}

/// Builds the record job.
///
/// ```text
/// process --FAILED--> (fail)
///         --*-------> skip-check --COMPLETED WITH SKIPS--> report-skips
///                                --*--------------------> (end)
/// ```
pub fn build_job(args: &RunArgs, config: &ConfigFile, store: DigestStore) -> Result<Job, BatchError> {
    let process = if args.partitioned {
        let concurrency = ConcurrencyConfig::from(&config.concurrency);
        FlowNode::step(
            PartitionStep::new(
                PROCESS_STEP,
                ColumnRangePartitioner::new(1, args.items),
                record_step(WORKER_STEP, args, config, Arc::clone(&store)),
            )
            .with_concurrency(&concurrency)
            .with_options(StepOptions::from(&config.step)),
        )
    } else {
        let step = record_step(PROCESS_STEP, args, config, Arc::clone(&store));
        match args.threads {
            Some(workers) if workers > 1 => FlowNode::step(step.multi_threaded(workers)),
            _ => FlowNode::step(step),
        }
    };

    let flow = FlowBuilder::new(JOB_NAME)
        .start(process)
        .on(ExitStatus::FAILED)
        .fail()
        .on("*")
        .to(FlowNode::decision(SKIP_CHECK, skip_check))
        .on(COMPLETED_WITH_SKIPS)
        .to(FlowNode::step(report_step()))
        .from(SKIP_CHECK)
        .on("*")
        .end()
        .build()?;

    Ok(Job::new(JOB_NAME, flow)
        .restartable(config.job.restartable)
        .incrementer(Arc::new(RunIdIncrementer::new()))
        .validator(Arc::new(DefaultJobParametersValidator::new(
            vec!["items"],
            vec![RunIdIncrementer::DEFAULT_KEY],
        ))))
}

/// The chunk step that turns records into digests.
///
/// The record range comes from the partition context when one is present,
/// otherwise it spans every record.
fn record_step(
    name: &str,
    args: &RunArgs,
    config: &ConfigFile,
    store: DigestStore,
) -> ChunkStep<
    impl ItemReader<Item = Record> + Clone,
    impl ItemProcessor<Input = Record, Output = Digest>,
    impl ItemWriter<Item = Digest>,
> {
    let items = args.items;
    let reader = move |execution: &StepExecution, _: &StepScope| {
        let ctx = &execution.execution_context;
        let min = ctx.get_i64(ColumnRangePartitioner::MIN_KEY).unwrap_or(1);
        let max = ctx.get_i64(ColumnRangePartitioner::MAX_KEY).unwrap_or(items);
        let records = ListItemReader::new((min..=max).map(Record::new)).with_name("records");
        Ok::<_, BatchError>(SynchronizedItemReader::new(records))
    };

    let (fail_every, filter_every) = (args.fail_every, args.filter_every);
    let processor = FnItemProcessor::new(move |record: &Record| {
        if every(fail_every, record.id) {
            return Err(ItemError::new(
                BAD_RECORD,
                format!("record {} failed validation", record.id),
            ));
        }
        if every(filter_every, record.id) {
            return Ok(None);
        }
        Ok(Some(Digest::of(record)))
    });

    let transient_every = args.transient_every;
    let failed_once: Arc<DashSet<i64>> = Arc::new(DashSet::new());
    let writer = move |_: &StepExecution, _: &StepScope| {
        let store = Arc::clone(&store);
        let failed_once = Arc::clone(&failed_once);
        Ok::<_, BatchError>(FnItemWriter::new(move |digests: &[Digest]| {
            if let Some(digest) = digests
                .iter()
                .find(|d| every(transient_every, d.id) && failed_once.insert(d.id))
            {
                return Err(ItemError::new(
                    TRANSIENT_WRITE,
                    format!("write of record {} timed out", digest.id),
                ));
            }
            for digest in digests {
                store.insert(digest.id, digest.checksum);
            }
            Ok(())
        }))
    };

    let mut fault = config.fault_tolerance.clone();
    fault.skippable.extend(args.skip.iter().cloned());
    fault.retryable.extend(args.retry.iter().cloned());
    if let Some(limit) = args.skip_limit {
        fault.skip_limit = limit;
    }

    let chunk = match args.chunk_size {
        Some(size) => ChunkConfig::new(size),
        None => ChunkConfig::from(&config.step),
    };

    ChunkStep::new(name, reader, processor, writer)
        .chunk_config(chunk)
        .fault_tolerance(FaultTolerance::from(&fault))
        .with_options(StepOptions::from(&config.step))
}

/// Routes to the skip report when the processing step skipped anything.
fn skip_check(_job: &JobExecution, last_step: Option<&StepExecution>) -> ExitStatus {
    match last_step {
        Some(step) if step.skip_count() > 0 => ExitStatus::new(COMPLETED_WITH_SKIPS),
        _ => ExitStatus::completed(),
    }
}

fn report_step() -> impl chunkbatch::batch::Step {
    TaskletStep::new(
        REPORT_STEP,
        FnTasklet::new(|_contribution, context| {
            let job = context.scope.job_execution();
            if let Some(step) = job.step_execution(PROCESS_STEP) {
                warn!(
                    read_skips = step.read_skip_count,
                    process_skips = step.process_skip_count,
                    write_skips = step.write_skip_count,
                    "Records were skipped"
                );
            }
            Ok(RepeatStatus::Finished)
        }),
    )
}

fn every(n: i64, id: i64) -> bool {
    n > 0 && id % n == 0
}

fn print_summary(execution: &JobExecution, stored: usize) {
    info!(
        execution_id = execution.id,
        status = %execution.status,
        exit_code = %execution.exit_status.code(),
        "Job finished"
    );

    println!();
    println!("Job '{}' execution {}", execution.job_name(), execution.id);
    println!("  Status:    {}", execution.status);
    println!("  Exit code: {}", execution.exit_status.code());
    if let Some(duration) = execution.duration() {
        println!("  Duration:  {:.2}s", duration.as_secs_f64());
    }
    println!("  Digests:   {}", stored);
    println!();

    for step in &execution.step_executions {
        println!(
            "  {:<24} {:<10} read={} written={} filtered={} skipped={} commits={} rollbacks={}",
            step.step_name,
            step.status.as_str(),
            step.read_count,
            step.write_count,
            step.filter_count,
            step.skip_count(),
            step.commit_count,
            step.rollback_count,
        );
    }

    for failure in execution.all_failures() {
        println!("  ! {}", failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkbatch::batch::InMemoryJobRepository;

    fn launcher() -> JobLauncher {
        JobLauncher::new(Arc::new(InMemoryJobRepository::new()))
    }

    fn config() -> ConfigFile {
        let mut config = ConfigFile::default();
        config.step.chunk_size = 10;
        config.fault_tolerance.backoff = chunkbatch::config::BackoffKind::None;
        config
    }

    async fn launch(args: RunArgs, config: &ConfigFile) -> (JobExecution, DigestStore) {
        let store: DigestStore = Arc::new(DashMap::new());
        let job = build_job(&args, config, Arc::clone(&store)).unwrap();
        let launcher = launcher();
        let parameters = job_parameters(&launcher, &job, &args).unwrap();
        let execution = launcher.run(&job, parameters).await.unwrap();
        (execution, store)
    }

    #[test]
    fn test_every() {
        assert!(!every(0, 10));
        assert!(every(5, 10));
        assert!(!every(3, 10));
    }

    #[tokio::test]
    async fn test_clean_run_writes_every_record() {
        let args = RunArgs {
            items: 95,
            ..RunArgs::default()
        };
        let (execution, store) = launch(args, &config()).await;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(store.len(), 95);
        let process = execution.step_execution(PROCESS_STEP).unwrap();
        assert_eq!(process.commit_count, 10);
        assert!(execution.step_execution(REPORT_STEP).is_none());
    }

    #[tokio::test]
    async fn test_filtered_records_are_counted_not_written() {
        let args = RunArgs {
            items: 40,
            filter_every: 4,
            ..RunArgs::default()
        };
        let (execution, store) = launch(args, &config()).await;

        let process = execution.step_execution(PROCESS_STEP).unwrap();
        assert_eq!(process.filter_count, 10);
        assert_eq!(process.write_count, 30);
        assert_eq!(store.len(), 30);
    }

    #[tokio::test]
    async fn test_unlisted_failure_fails_the_job() {
        let args = RunArgs {
            items: 30,
            fail_every: 7,
            ..RunArgs::default()
        };
        let (execution, _) = launch(args, &config()).await;

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.exit_status.code(), ExitStatus::FAILED);
    }

    #[tokio::test]
    async fn test_skips_route_to_report() {
        let args = RunArgs {
            items: 30,
            fail_every: 7,
            skip: vec!["validation".into()],
            skip_limit: Some(10),
            ..RunArgs::default()
        };
        let (execution, store) = launch(args, &config()).await;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(store.len(), 26);
        let process = execution.step_execution(PROCESS_STEP).unwrap();
        assert_eq!(process.process_skip_count, 4);
        assert!(execution.step_execution(REPORT_STEP).is_some());
    }

    #[tokio::test]
    async fn test_transient_writes_are_retried() {
        let args = RunArgs {
            items: 50,
            transient_every: 10,
            retry: vec![TRANSIENT_WRITE.into()],
            ..RunArgs::default()
        };
        let (execution, store) = launch(args, &config()).await;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(store.len(), 50);
        let process = execution.step_execution(PROCESS_STEP).unwrap();
        assert_eq!(process.write_count, 50);
        assert_eq!(process.skip_count(), 0);
    }

    #[tokio::test]
    async fn test_partitioned_run_covers_the_range() {
        let mut config = config();
        config.concurrency.grid_size = 4;
        let args = RunArgs {
            items: 100,
            partitioned: true,
            ..RunArgs::default()
        };
        let (execution, store) = launch(args, &config).await;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(store.len(), 100);
        let master = execution.step_execution(PROCESS_STEP).unwrap();
        assert_eq!(master.read_count, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_multi_threaded_run_writes_each_record_once() {
        let args = RunArgs {
            items: 200,
            threads: Some(4),
            ..RunArgs::default()
        };
        let (execution, store) = launch(args, &config()).await;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(store.len(), 200);
        let process = execution.step_execution(PROCESS_STEP).unwrap();
        assert_eq!(process.write_count, 200);
    }

    #[tokio::test]
    async fn test_parameters_default_to_next_run_id() {
        let launcher = launcher();
        let job = build_job(&RunArgs::default(), &config(), Arc::new(DashMap::new())).unwrap();

        let parameters = job_parameters(&launcher, &job, &RunArgs::default()).unwrap();
        assert_eq!(parameters.get_long("run.id"), Some(1));
        assert_eq!(parameters.get_long("items"), Some(DEFAULT_ITEMS));

        let explicit = RunArgs {
            run_id: Some(42),
            ..RunArgs::default()
        };
        let parameters = job_parameters(&launcher, &job, &explicit).unwrap();
        assert_eq!(parameters.get_long("run.id"), Some(42));
    }
}
