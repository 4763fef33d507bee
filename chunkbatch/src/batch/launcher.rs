//! Job launching and operation.
//!
//! The [`JobLauncher`] enforces the launch contract before any work starts:
//!
//! | Previous executions of the instance | Launch result                        |
//! |-------------------------------------|--------------------------------------|
//! | none                                | new instance, new execution          |
//! | one still running                   | [`BatchError::JobExecutionAlreadyRunning`] |
//! | one COMPLETED                       | [`BatchError::JobInstanceAlreadyComplete`] |
//! | one ABANDONED                       | [`BatchError::JobInstanceAbandoned`] |
//! | unfinished, job not restartable     | [`BatchError::JobRestartNotAllowed`] |
//! | unfinished, job restartable         | new execution resuming the instance  |
//!
//! A restarted execution inherits the job context of the last one, and each
//! step decides from its own history whether to run again.
//!
//! [`JobLauncher::run`] awaits the job; [`JobLauncher::start`] spawns it and
//! returns a [`JobExecutionHandle`] for status queries, stop and wait.
//!
//! # Example
//!
//! ```ignore
//! let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));
//! let mut handle = launcher.start(Arc::new(job), params)?;
//! handle.stop()?;
//! let execution = handle.wait().await?;
//! assert_eq!(execution.status, BatchStatus::Stopped);
//! ```

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::BatchError;
use super::execution::JobExecution;
use super::job::Job;
use super::params::JobParameters;
use super::repository::JobRepository;
use super::status::BatchStatus;
use super::step::StepScope;
use super::telemetry::{BatchEvent, TelemetrySink, TracingTelemetrySink};

type ResultHolder = Arc<Mutex<Option<Result<JobExecution, BatchError>>>>;

// =============================================================================
// Job Launcher
// =============================================================================

/// Launches, stops and abandons job executions.
///
/// Clones share the same set of running executions.
#[derive(Clone)]
pub struct JobLauncher {
    repository: Arc<dyn JobRepository>,
    telemetry: Arc<dyn TelemetrySink>,
    running: Arc<DashMap<u64, StepScope>>,
}

impl JobLauncher {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            repository,
            telemetry: Arc::new(TracingTelemetrySink),
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    /// Ids of executions this launcher is currently running.
    pub fn running_executions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.running.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Applies the launch contract and creates the execution to run.
    fn create_execution(
        &self,
        job: &Job,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError> {
        job.validate(parameters)?;

        let admit = |previous: &[JobExecution]| -> Result<(), BatchError> {
            for execution in previous {
                if execution.status.is_running() {
                    return Err(BatchError::JobExecutionAlreadyRunning {
                        job: job.name().to_string(),
                        execution_id: execution.id,
                    });
                }
                match execution.status {
                    BatchStatus::Completed => {
                        return Err(BatchError::JobInstanceAlreadyComplete {
                            job: job.name().to_string(),
                            parameters: parameters.to_string(),
                        })
                    }
                    BatchStatus::Abandoned => {
                        return Err(BatchError::JobInstanceAbandoned {
                            job: job.name().to_string(),
                        })
                    }
                    _ => {}
                }
            }
            if !previous.is_empty() && !job.is_restartable() {
                return Err(BatchError::JobRestartNotAllowed {
                    job: job.name().to_string(),
                });
            }
            Ok(())
        };

        let (mut execution, last) = self
            .repository
            .create_job_execution_checked(job.name(), parameters, &admit)?;
        if let Some(last) = last {
            info!(
                job = %job.name(),
                execution_id = execution.id,
                previous = last.id,
                previous_status = %last.status,
                "Restarting job instance"
            );
            execution.execution_context = last.execution_context;
            self.repository.update_job_execution(&execution)?;
        }
        Ok(execution)
    }

    fn scope_for(&self, execution: JobExecution, stop: CancellationToken) -> StepScope {
        StepScope::new(
            execution,
            Arc::clone(&self.repository),
            Arc::clone(&self.telemetry),
            stop,
        )
    }

    /// Runs a job to completion.
    ///
    /// `Err` covers launch contract violations; a job that ran and failed
    /// comes back as `Ok` with a FAILED status.
    pub async fn run(&self, job: &Job, parameters: JobParameters) -> Result<JobExecution, BatchError> {
        self.run_nested(job, parameters, CancellationToken::new()).await
    }

    /// Runs a job whose stop follows `stop`.
    pub(crate) async fn run_nested(
        &self,
        job: &Job,
        parameters: JobParameters,
        stop: CancellationToken,
    ) -> Result<JobExecution, BatchError> {
        let execution = self.create_execution(job, &parameters)?;
        let id = execution.id;
        let scope = self.scope_for(execution, stop);
        self.running.insert(id, scope.clone());

        let result = job.execute(&scope).await;
        self.running.remove(&id);
        result
    }

    /// Spawns a job on the runtime and returns a handle to it.
    pub fn start(
        &self,
        job: Arc<Job>,
        parameters: JobParameters,
    ) -> Result<JobExecutionHandle, BatchError> {
        let execution = self.create_execution(&job, &parameters)?;
        let id = execution.id;
        let scope = self.scope_for(execution, CancellationToken::new());
        self.running.insert(id, scope.clone());

        let (status_tx, status_rx) = watch::channel(BatchStatus::Starting);
        let result: ResultHolder = Arc::new(Mutex::new(None));
        let holder = Arc::clone(&result);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            let _ = status_tx.send(BatchStatus::Started);
            let outcome = job.execute(&scope).await;
            running.remove(&id);

            let status = match &outcome {
                Ok(execution) => execution.status,
                Err(_) => BatchStatus::Failed,
            };
            // Result must be visible before waiters see the terminal status
            *holder.lock().await = Some(outcome);
            let _ = status_tx.send(status);
        });

        Ok(JobExecutionHandle {
            execution_id: id,
            status_rx,
            result,
            launcher: self.clone(),
        })
    }

    /// Requests a graceful stop. Steps finish their current chunk first.
    pub fn stop(&self, execution_id: u64) -> Result<(), BatchError> {
        let scope = match self.running.get(&execution_id) {
            Some(entry) => entry.value().clone(),
            None => {
                return match self.repository.get_job_execution(execution_id) {
                    Some(execution) => Err(BatchError::IllegalState {
                        execution_id,
                        status: execution.status,
                        operation: "stop",
                    }),
                    None => Err(BatchError::NoSuchExecution(execution_id)),
                }
            }
        };

        let snapshot = scope.with_job(|job| {
            job.upgrade_status(BatchStatus::Stopping);
            job.clone()
        });
        self.repository.update_job_execution(&snapshot)?;
        scope.stop_token().cancel();

        info!(job = %snapshot.job_name(), execution_id, "Stop requested");
        self.telemetry.emit(BatchEvent::JobStopRequested {
            job: snapshot.job_name().to_string(),
            execution_id,
        });
        Ok(())
    }

    /// Marks a finished, unsuccessful execution ABANDONED so its instance is
    /// never restarted.
    pub fn abandon(&self, execution_id: u64) -> Result<JobExecution, BatchError> {
        let mut execution = self
            .repository
            .get_job_execution(execution_id)
            .ok_or(BatchError::NoSuchExecution(execution_id))?;

        if self.running.contains_key(&execution_id) || execution.status == BatchStatus::Completed {
            return Err(BatchError::IllegalState {
                execution_id,
                status: execution.status,
                operation: "abandon",
            });
        }
        if execution.status.is_running() {
            warn!(
                execution_id,
                status = %execution.status,
                "Abandoning execution that was never finished"
            );
        }

        execution.upgrade_status(BatchStatus::Abandoned);
        execution.end_time.get_or_insert_with(Utc::now);
        self.repository.update_job_execution(&execution)?;
        info!(job = %execution.job_name(), execution_id, "Execution abandoned");
        Ok(execution)
    }

    /// Runs the instance of a previous execution again, with its parameters.
    pub async fn restart(&self, job: &Job, execution_id: u64) -> Result<JobExecution, BatchError> {
        let previous = self
            .repository
            .get_job_execution(execution_id)
            .ok_or(BatchError::NoSuchExecution(execution_id))?;
        if previous.job_name() != job.name() {
            return Err(BatchError::InvalidParameters(format!(
                "execution {} belongs to job '{}', not '{}'",
                execution_id,
                previous.job_name(),
                job.name()
            )));
        }
        self.run(job, previous.parameters).await
    }

    /// Parameters for the next run, from the job's incrementer and the
    /// parameters of its most recent execution.
    pub fn next_parameters(&self, job: &Job) -> Result<JobParameters, BatchError> {
        let incrementer = job.parameters_incrementer().ok_or_else(|| {
            BatchError::InvalidParameters(format!(
                "job '{}' has no parameters incrementer",
                job.name()
            ))
        })?;
        let last = self
            .repository
            .last_job_instance(job.name())
            .and_then(|instance| self.repository.last_job_execution(&instance))
            .map(|execution| execution.parameters);
        Ok(incrementer.next(last.as_ref()))
    }

    /// Runs a new instance with incremented parameters.
    pub async fn run_next(&self, job: &Job) -> Result<JobExecution, BatchError> {
        let parameters = self.next_parameters(job)?;
        self.run(job, parameters).await
    }
}

impl std::fmt::Debug for JobLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLauncher")
            .field("running", &self.running.len())
            .finish()
    }
}

// =============================================================================
// Execution Handle
// =============================================================================

/// Handle to a spawned job execution.
///
/// Cloneable; all clones refer to the same execution.
#[derive(Clone)]
pub struct JobExecutionHandle {
    execution_id: u64,
    status_rx: watch::Receiver<BatchStatus>,
    result: ResultHolder,
    launcher: JobLauncher,
}

impl JobExecutionHandle {
    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    /// Most recent status, without waiting.
    pub fn status(&self) -> BatchStatus {
        *self.status_rx.borrow()
    }

    /// Waits until the execution reaches a terminal status.
    pub async fn wait(&mut self) -> Result<JobExecution, BatchError> {
        loop {
            if let Some(result) = self.result.lock().await.as_ref() {
                return result.clone();
            }
            if self.status_rx.changed().await.is_err() {
                break;
            }
        }
        if let Some(result) = self.result.lock().await.as_ref() {
            return result.clone();
        }
        // Task ended without reporting; fall back to the stored record
        self.launcher
            .repository
            .get_job_execution(self.execution_id)
            .ok_or(BatchError::NoSuchExecution(self.execution_id))
    }

    /// Requests a graceful stop of this execution.
    pub fn stop(&self) -> Result<(), BatchError> {
        self.launcher.stop(self.execution_id)
    }
}

impl std::fmt::Debug for JobExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutionHandle")
            .field("execution_id", &self.execution_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::item::{ListItemReader, ListItemWriter};
    use crate::batch::params::RunIdIncrementer;
    use crate::batch::repeat::RepeatStatus;
    use crate::batch::repository::InMemoryJobRepository;
    use crate::batch::step::{ChunkStep, FnTasklet, TaskletStep};
    use crate::batch::status::ExitStatus;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn launcher() -> JobLauncher {
        JobLauncher::new(Arc::new(InMemoryJobRepository::new()))
    }

    /// Job whose single step fails while `fail` is set.
    fn flaky_job(name: &str, fail: Arc<AtomicBool>, runs: Arc<AtomicU32>) -> Job {
        Job::single_step(
            name,
            TaskletStep::new(
                "work",
                FnTasklet::new(move |_contribution, _ctx| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    if fail.load(Ordering::SeqCst) {
                        Err(crate::batch::error::ItemError::new("io", "disk full"))
                    } else {
                        Ok(RepeatStatus::Finished)
                    }
                }),
            ),
        )
    }

    #[tokio::test]
    async fn test_completed_instance_is_rejected() {
        let launcher = launcher();
        let params = JobParameters::new().with_string("date", "2024-01-01");
        let job = flaky_job("daily", Arc::new(AtomicBool::new(false)), Arc::default());

        let first = launcher.run(&job, params.clone()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Completed);

        let err = launcher.run(&job, params).await.unwrap_err();
        assert!(matches!(err, BatchError::JobInstanceAlreadyComplete { .. }));
    }

    #[tokio::test]
    async fn test_failed_instance_restarts_into_same_instance() {
        let launcher = launcher();
        let fail = Arc::new(AtomicBool::new(true));
        let runs = Arc::new(AtomicU32::new(0));
        let job = flaky_job("daily", Arc::clone(&fail), Arc::clone(&runs));
        let params = JobParameters::new().with_string("date", "2024-01-02");

        let first = launcher.run(&job, params.clone()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);

        fail.store(false, Ordering::SeqCst);
        let second = launcher.run(&job, params).await.unwrap();

        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(second.instance, first.instance);
        assert_ne!(second.id, first.id);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_restartable_job_rejects_restart() {
        let launcher = launcher();
        let job = flaky_job("once", Arc::new(AtomicBool::new(true)), Arc::default())
            .restartable(false);

        let first = launcher.run(&job, JobParameters::new()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);

        let err = launcher.run(&job, JobParameters::new()).await.unwrap_err();
        assert!(matches!(err, BatchError::JobRestartNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_abandoned_instance_is_rejected() {
        let launcher = launcher();
        let job = flaky_job("daily", Arc::new(AtomicBool::new(true)), Arc::default());

        let failed = launcher.run(&job, JobParameters::new()).await.unwrap();
        let abandoned = launcher.abandon(failed.id).unwrap();
        assert_eq!(abandoned.status, BatchStatus::Abandoned);

        let err = launcher.run(&job, JobParameters::new()).await.unwrap_err();
        assert!(matches!(err, BatchError::JobInstanceAbandoned { .. }));
    }

    #[tokio::test]
    async fn test_abandon_rejects_completed_execution() {
        let launcher = launcher();
        let job = flaky_job("daily", Arc::new(AtomicBool::new(false)), Arc::default());
        let done = launcher.run(&job, JobParameters::new()).await.unwrap();

        let err = launcher.abandon(done.id).unwrap_err();
        assert!(matches!(err, BatchError::IllegalState { operation: "abandon", .. }));
    }

    #[tokio::test]
    async fn test_restart_reuses_parameters() {
        let launcher = launcher();
        let fail = Arc::new(AtomicBool::new(true));
        let job = flaky_job("daily", Arc::clone(&fail), Arc::default());
        let params = JobParameters::new().with_long("batch", 7);

        let failed = launcher.run(&job, params).await.unwrap();
        fail.store(false, Ordering::SeqCst);
        let restarted = launcher.restart(&job, failed.id).await.unwrap();

        assert_eq!(restarted.status, BatchStatus::Completed);
        assert_eq!(restarted.parameters.get_long("batch"), Some(7));
    }

    #[tokio::test]
    async fn test_run_next_increments_run_id() {
        let launcher = launcher();
        let job = flaky_job("nightly", Arc::new(AtomicBool::new(false)), Arc::default())
            .incrementer(Arc::new(RunIdIncrementer::new()));

        let first = launcher.run_next(&job).await.unwrap();
        let second = launcher.run_next(&job).await.unwrap();

        assert_eq!(first.parameters.get_long("run.id"), Some(1));
        assert_eq!(second.parameters.get_long("run.id"), Some(2));
        assert_ne!(first.instance, second.instance);
    }

    #[tokio::test]
    async fn test_run_next_without_incrementer_fails() {
        let job = flaky_job("plain", Arc::new(AtomicBool::new(false)), Arc::default());
        let err = launcher().run_next(&job).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let launcher = launcher();
        let output = ListItemWriter::new();
        let sink = output.clone();
        let job = Job::single_step(
            "spawned",
            ChunkStep::without_processor(
                "copy",
                |_, _| Ok(ListItemReader::new(0..20)),
                move |_, _| Ok(sink.clone()),
            )
            .chunk_size(5),
        );

        let mut handle = launcher.start(Arc::new(job), JobParameters::new()).unwrap();
        let execution = handle.wait().await.unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(handle.status(), BatchStatus::Completed);
        assert_eq!(output.items().len(), 20);
        assert!(launcher.running_executions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_execution() {
        let err = launcher().stop(42).unwrap_err();
        assert!(matches!(err, BatchError::NoSuchExecution(42)));
    }

    #[tokio::test]
    async fn test_stop_finished_execution_is_illegal() {
        let launcher = launcher();
        let job = flaky_job("daily", Arc::new(AtomicBool::new(false)), Arc::default());
        let done = launcher.run(&job, JobParameters::new()).await.unwrap();

        let err = launcher.stop(done.id).unwrap_err();
        assert!(matches!(
            err,
            BatchError::IllegalState {
                status: BatchStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_is_honoured_between_calls() {
        let launcher = launcher();
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let job = Job::single_step(
            "endless",
            TaskletStep::new(
                "spin",
                FnTasklet::new(move |_contribution, _ctx| {
                    let _ = entered_tx.send(());
                    Ok(RepeatStatus::Continuable)
                }),
            ),
        );

        let mut handle = launcher.start(Arc::new(job), JobParameters::new()).unwrap();
        entered_rx.recv().await.unwrap();
        handle.stop().unwrap();
        let execution = handle.wait().await.unwrap();

        assert_eq!(execution.status, BatchStatus::Stopped);
        assert_eq!(execution.exit_status.code(), ExitStatus::STOPPED);
        let step = execution.step_execution("spin").unwrap();
        assert_eq!(step.status, BatchStatus::Stopped);
    }
}
