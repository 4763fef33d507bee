//! Batch Processing Engine
//!
//! This module runs chunk-oriented batch jobs with transactional chunks,
//! fault tolerance, conditional flows, partitioning and restart.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobLauncher                           │
//! │  Launch contract, restart, stop, abandon, handles           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      Job ─► Flow                             │
//! │  Steps, decisions, nested flows, splits, transitions        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ ChunkStep   │  │ Tasklet     │  │ PartitionStep       │  │
//! │  │ (+workers)  │  │ Step        │  │ (master / workers)  │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Chunk engine: read ─► process ─► write, skip / retry       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  JobRepository: instances, executions, contexts             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! - **Chunk**: up to `chunk_size` items read and processed one by one,
//!   then written together inside one transaction. A failed chunk leaves no
//!   trace in counts or step context.
//!
//! - **Fault tolerance**: errors are classified by [`ErrorClass`]; the most
//!   specific rule wins and unclassified errors are fatal. Skippable errors
//!   drop the item up to a skip limit, retryable ones are retried with
//!   back-off.
//!
//! - **Flow**: a graph of steps whose exit codes pick the next node through
//!   `*`/`?` patterns.
//!
//! - **Restart**: a failed or stopped instance is run again as a new
//!   execution; completed steps are skipped and readers resume from their
//!   saved position.
//!
//! # Example
//!
//! ```ignore
//! use chunkbatch::batch::{
//!     ChunkStep, FnItemProcessor, InMemoryJobRepository, Job, JobLauncher, JobParameters,
//!     ListItemReader, ListItemWriter,
//! };
//!
//! let output = ListItemWriter::new();
//! let sink = output.clone();
//! let job = Job::single_step(
//!     "double",
//!     ChunkStep::new(
//!         "double",
//!         |_, _| Ok(ListItemReader::new(1..=10)),
//!         FnItemProcessor::new(|n: &i32| Ok(Some(n * 2))),
//!         move |_, _| Ok(sink.clone()),
//!     )
//!     .chunk_size(3),
//! );
//!
//! let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));
//! let execution = launcher.run(&job, JobParameters::new()).await?;
//! ```

pub mod chunk;
pub mod context;
pub mod error;
pub mod execution;
pub mod fault;
pub mod flow;
pub mod item;
pub mod job;
pub mod launcher;
pub mod listener;
pub mod params;
pub mod partition;
pub mod repeat;
pub mod repository;
pub mod status;
pub mod step;
pub mod telemetry;

// Status and errors
pub use error::{BatchError, ErrorClass, ItemError};
pub use status::{BatchStatus, ExitStatus};

// Runtime records
pub use context::ExecutionContext;
pub use execution::{JobExecution, JobInstance, StepContribution, StepExecution};
pub use params::{
    DefaultJobParametersValidator, JobParameter, JobParameters, JobParametersIncrementer,
    JobParametersValidator, ParameterValue, RunIdIncrementer,
};

// Item contracts
pub use item::{
    ClassifierCompositeItemProcessor, ClassifierCompositeItemWriter, CompositeItemProcessor,
    CompositeItemWriter, DynItemProcessor, DynItemWriter, FnItemProcessor, FnItemReader,
    FnItemWriter, ItemProcessor, ItemReader, ItemWriter, IteratorItemReader, ListItemReader,
    ListItemWriter, PassThroughItemProcessor, SynchronizedItemReader,
};

// Chunk engine and fault tolerance
pub use chunk::{ChunkConfig, ChunkContext, ItemRecoverer, DEFAULT_CHUNK_SIZE};
pub use fault::{
    AlwaysRetryPolicy, AlwaysSkipItemSkipPolicy, BackOffPolicy, ErrorClassifier, FaultTolerance,
    FaultToleranceBuilder, LimitCheckingItemSkipPolicy, MaxAttemptsRetryPolicy, NeverRetryPolicy,
    NeverSkipItemSkipPolicy, RetryMode, RetryPolicy, RetryTemplate, SimpleRetryPolicy,
    SkipDecision, SkipPolicy, DEFAULT_BACKOFF_MAX, DEFAULT_RETRY_LIMIT,
};
pub use repeat::{
    CompletionPolicy, CompositeCompletionPolicy, DefaultCompletionPolicy,
    DefaultExceptionHandler, ExceptionHandler, RepeatStatus, RepeatTemplate,
    SimpleCompletionPolicy, SimpleLimitExceptionHandler, TimeoutTerminationPolicy,
};

// Listeners
pub use listener::{
    ChunkListener, ExecutionContextPromotionListener, ItemProcessListener, ItemReadListener,
    ItemWriteListener, JobExecutionListener, RetryListener, SkipListener, SkipPhase, SkippedItem,
    StepExecutionListener, StepListeners,
};

// Steps
pub use step::{
    execute_step, ChunkStep, ComponentFactory, FnTasklet, MultiThreadedStep, Step, StepOptions,
    StepOutcome, StepScope, Tasklet, TaskletContext, TaskletStep, DEFAULT_START_LIMIT,
};

// Flows and jobs
pub use flow::{pattern_matches, Decider, Flow, FlowBuilder, FlowNode, FlowOutcome, FlowStep};
pub use job::{DefaultJobParametersExtractor, Job, JobParametersExtractor, JobStep};
pub use launcher::{JobExecutionHandle, JobLauncher};

// Partitioning
pub use partition::{
    num_cpus, partition_name, ColumnRangePartitioner, ConcurrencyConfig, PartitionStep,
    Partitioner, SimplePartitioner, DEFAULT_GRID_SIZE, DEFAULT_THROTTLE_LIMIT,
};

// Persistence and telemetry
pub use repository::{InMemoryJobRepository, JobRepository};
pub use telemetry::{
    BatchEvent, MultiTelemetrySink, NullTelemetrySink, RecordingTelemetrySink, TelemetrySink,
    TracingTelemetrySink,
};
