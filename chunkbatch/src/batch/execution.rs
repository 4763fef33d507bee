//! Runtime records for job and step executions.
//!
//! These are the values a [`JobRepository`](super::repository::JobRepository)
//! persists. A [`JobExecution`] is one attempt at running a [`JobInstance`];
//! it owns an ordered list of [`StepExecution`]s, one per step that actually
//! started. Counter deltas for a chunk are gathered in a [`StepContribution`]
//! and only applied when the chunk commits.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::context::ExecutionContext;
use super::error::BatchError;
use super::params::JobParameters;
use super::status::{BatchStatus, ExitStatus};

// =============================================================================
// Job Instance
// =============================================================================

/// Identity of a logical job run: job name plus identifying parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobInstance {
    pub id: u64,
    pub job_name: String,
    /// Canonical identifying-parameter key (see [`JobParameters::identity_key`]).
    pub key: String,
}

// =============================================================================
// Job Execution
// =============================================================================

/// One attempt to run a job instance.
#[derive(Clone, Debug)]
pub struct JobExecution {
    pub id: u64,
    pub instance: JobInstance,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Job-scoped context, visible to every step of this execution.
    pub execution_context: ExecutionContext,
    pub step_executions: Vec<StepExecution>,
    pub failures: Vec<BatchError>,
}

impl JobExecution {
    pub fn new(id: u64, instance: JobInstance, parameters: JobParameters) -> Self {
        Self {
            id,
            instance,
            parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.instance.job_name
    }

    /// Returns the most recent execution of the named step, if any.
    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .find(|s| s.step_name == step_name)
    }

    /// Moves the status towards a more severe value, never back.
    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    /// Wall-clock duration, if the execution has started.
    pub fn duration(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - start).to_std().ok()
    }

    /// Every failure recorded by the job or any of its steps.
    pub fn all_failures(&self) -> Vec<BatchError> {
        let mut all = self.failures.clone();
        for step in &self.step_executions {
            all.extend(step.failures.iter().cloned());
        }
        all
    }
}

// =============================================================================
// Step Execution
// =============================================================================

/// One attempt to run one step within a job execution.
#[derive(Clone, Debug)]
pub struct StepExecution {
    pub id: u64,
    pub job_execution_id: u64,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    /// Number of failed attempts that were retried.
    pub retry_count: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Step-scoped context, not visible to other steps.
    pub execution_context: ExecutionContext,
    pub failures: Vec<BatchError>,
}

impl StepExecution {
    pub fn new(id: u64, job_execution_id: u64, step_name: impl Into<String>) -> Self {
        Self {
            id,
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            commit_count: 0,
            rollback_count: 0,
            retry_count: 0,
            start_time: Utc::now(),
            end_time: None,
            execution_context: ExecutionContext::new(),
            failures: Vec::new(),
        }
    }

    /// Total skips across read, process and write.
    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    /// Applies a committed chunk's deltas and counts the commit.
    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
        self.retry_count += contribution.retry_count;
        if let Some(exit) = &contribution.exit_status {
            self.exit_status = self.exit_status.clone().and(exit.clone());
        }
        self.commit_count += 1;
    }

    /// Adds another execution's counters to this one (used when aggregating partitions).
    pub fn accumulate(&mut self, other: &StepExecution) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.filter_count += other.filter_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.retry_count += other.retry_count;
    }

    /// Marks the execution failed and records the cause.
    pub fn fail(&mut self, error: BatchError) {
        self.status = BatchStatus::Failed;
        self.exit_status = ExitStatus::failed().with_description(error.to_string());
        self.failures.push(error);
    }

    pub fn duration(&self) -> Option<Duration> {
        let end = self.end_time?;
        (end - self.start_time).to_std().ok()
    }
}

// =============================================================================
// Step Contribution
// =============================================================================

/// Counter deltas accumulated while one chunk is in flight.
///
/// Discarded on rollback, applied to the [`StepExecution`] on commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepContribution {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub retry_count: u64,
    /// Exit status requested by the chunk, merged into the step's by severity.
    pub exit_status: Option<ExitStatus>,
}

impl StepContribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}
