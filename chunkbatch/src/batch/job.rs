//! Jobs: a named flow plus restart, parameter and listener configuration.
//!
//! A [`Job`] never runs itself; the
//! [`JobLauncher`](super::launcher::JobLauncher) creates the execution,
//! applies the launch contract and then calls [`Job::execute`].
//!
//! [`JobStep`] runs a whole job as one step of an outer job. The child gets
//! its own instance, keyed by parameters an [`JobParametersExtractor`] pulls
//! from the parent, so restarting the parent restarts the child too.
//!
//! # Example
//!
//! ```ignore
//! let job = Job::new("import", flow)
//!     .incrementer(Arc::new(RunIdIncrementer::new()))
//!     .restartable(true);
//! ```

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

use super::error::BatchError;
use super::execution::{JobExecution, StepExecution};
use super::flow::{Flow, FlowNode, FlowOutcome};
use super::launcher::JobLauncher;
use super::listener::{
    ExecutionContextPromotionListener, JobExecutionListener, JobListeners, StepExecutionListener,
    StepHooks,
};
use super::params::{JobParameters, JobParametersIncrementer, JobParametersValidator};
use super::status::{BatchStatus, ExitStatus};
use super::step::{begin_step, finish_step, Step, StepOptions, StepOutcome, StepScope};
use super::telemetry::BatchEvent;

// =============================================================================
// Job
// =============================================================================

/// A job definition. Immutable once handed to a launcher.
pub struct Job {
    name: String,
    flow: Flow,
    restartable: bool,
    incrementer: Option<Arc<dyn JobParametersIncrementer>>,
    validator: Option<Arc<dyn JobParametersValidator>>,
    listeners: JobListeners,
}

impl Job {
    pub fn new(name: impl Into<String>, flow: Flow) -> Self {
        Self {
            name: name.into(),
            flow,
            restartable: true,
            incrementer: None,
            validator: None,
            listeners: JobListeners::default(),
        }
    }

    /// A job whose flow is a single node.
    pub fn single_step(name: impl Into<String>, step: impl Into<FlowNode>) -> Self {
        let name = name.into();
        let flow = Flow::single(name.clone(), step);
        Self::new(name, flow)
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn incrementer(mut self, incrementer: Arc<dyn JobParametersIncrementer>) -> Self {
        self.incrementer = Some(incrementer);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn JobParametersValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn JobExecutionListener>) -> Self {
        self.listeners.listeners.push(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    pub fn parameters_incrementer(&self) -> Option<&Arc<dyn JobParametersIncrementer>> {
        self.incrementer.as_ref()
    }

    /// Checks launch parameters against the configured validator, if any.
    pub fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError> {
        match &self.validator {
            Some(validator) => validator.validate(parameters),
            None => Ok(()),
        }
    }

    /// Runs the flow against the execution held by `scope`.
    ///
    /// Flow errors do not escape: they fail the job execution and are kept
    /// in its failure list. `Err` means the execution could not be
    /// persisted.
    pub async fn execute(&self, scope: &StepScope) -> Result<JobExecution, BatchError> {
        let started = scope.with_job(|job| {
            job.status = BatchStatus::Started;
            job.exit_status = ExitStatus::executing();
            job.start_time = Some(Utc::now());
            job.clone()
        });
        scope.repository().update_job_execution(&started)?;

        info!(
            job = %self.name,
            execution_id = started.id,
            parameters = %started.parameters,
            "Job started"
        );
        scope.telemetry().emit(BatchEvent::JobStarted {
            job: self.name.clone(),
            execution_id: started.id,
            parameters: started.parameters.to_string(),
        });
        self.listeners.before_job(&started);

        let result = if scope.is_stop_requested() {
            Ok(FlowOutcome::new(
                BatchStatus::Stopped,
                ExitStatus::stopped().with_description("stopped before start"),
            ))
        } else {
            self.flow.run(scope).await
        };

        if let Err(err) = &result {
            error!(job = %self.name, execution_id = started.id, error = %err, "Job failed");
        }
        let finished = scope.with_job(|job| {
            match result {
                Ok(outcome) => {
                    job.status = outcome.status;
                    job.exit_status = outcome.exit_status;
                }
                Err(err) => {
                    job.status = BatchStatus::Failed;
                    job.exit_status = ExitStatus::failed().with_description(err.to_string());
                    job.failures.push(err);
                }
            }
            job.clone()
        });

        self.listeners.after_job(&finished);

        let finished = scope.with_job(|job| {
            job.end_time = Some(Utc::now());
            job.clone()
        });
        scope.repository().update_job_execution(&finished)?;

        info!(
            job = %self.name,
            execution_id = finished.id,
            status = %finished.status,
            exit_code = %finished.exit_status.code(),
            "Job finished"
        );
        scope.telemetry().emit(BatchEvent::JobCompleted {
            job: self.name.clone(),
            execution_id: finished.id,
            status: finished.status,
            exit_code: finished.exit_status.code().to_string(),
            duration: finished.duration().unwrap_or_default(),
        });
        Ok(finished)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("flow", &self.flow.name())
            .field("restartable", &self.restartable)
            .finish()
    }
}

// =============================================================================
// Parameter Extraction
// =============================================================================

/// Derives a child job's parameters from the parent step.
pub trait JobParametersExtractor: Send + Sync {
    fn extract(&self, step: &StepExecution, scope: &StepScope) -> JobParameters;
}

/// Copies named keys from the parent's parameters, the step context or the
/// job context, in that order.
#[derive(Clone, Debug)]
pub struct DefaultJobParametersExtractor {
    keys: Vec<String>,
    use_all_parent_parameters: bool,
}

impl DefaultJobParametersExtractor {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            use_all_parent_parameters: true,
        }
    }

    /// Whether every parent parameter is passed on, not only the named keys.
    pub fn use_all_parent_parameters(mut self, all: bool) -> Self {
        self.use_all_parent_parameters = all;
        self
    }
}

impl Default for DefaultJobParametersExtractor {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

fn with_context_value(params: JobParameters, key: &str, value: &Value) -> JobParameters {
    match value {
        Value::String(s) => params.with_string(key, s.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(v) => params.with_long(key, v),
            None => params.with_double(key, n.as_f64().unwrap_or_default()),
        },
        other => params.with_string(key, other.to_string()),
    }
}

impl JobParametersExtractor for DefaultJobParametersExtractor {
    fn extract(&self, step: &StepExecution, scope: &StepScope) -> JobParameters {
        let parent = scope.parameters();
        let mut params = if self.use_all_parent_parameters {
            parent.clone()
        } else {
            JobParameters::new()
        };
        let job_context = scope.job_context();

        for key in &self.keys {
            if let Some(parameter) = parent.get(key) {
                params = params.with_parameter(key.clone(), parameter.clone());
            } else if let Some(value) = step.execution_context.get(key) {
                params = with_context_value(params, key, value);
            } else if let Some(value) = job_context.get(key) {
                params = with_context_value(params, key, value);
            }
        }
        params
    }
}

// =============================================================================
// Job Step
// =============================================================================

/// Step context key holding the child job execution id.
pub const JOB_STEP_EXECUTION_KEY: &str = "batch.job_step.execution_id";

/// Runs a whole job as a step. The step takes the child's status and exit.
pub struct JobStep {
    name: String,
    job: Arc<Job>,
    extractor: Arc<dyn JobParametersExtractor>,
    options: StepOptions,
    hooks: StepHooks,
}

impl JobStep {
    pub fn new(name: impl Into<String>, job: Arc<Job>) -> Self {
        Self {
            name: name.into(),
            job,
            extractor: Arc::new(DefaultJobParametersExtractor::default()),
            options: StepOptions::default(),
            hooks: StepHooks::default(),
        }
    }

    pub fn extractor(mut self, extractor: Arc<dyn JobParametersExtractor>) -> Self {
        self.extractor = extractor;
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
}

impl Step for JobStep {
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

            let params = self.extractor.extract(execution, scope);
            let launcher = JobLauncher::new(Arc::clone(scope.repository()))
                .with_telemetry(Arc::clone(scope.telemetry_arc()));
            let child = launcher
                .run_nested(&self.job, params, scope.stop_token().child_token())
                .await;

            let result = child.map(|child| {
                execution
                    .execution_context
                    .put(JOB_STEP_EXECUTION_KEY, child.id);
                StepOutcome::new(child.status, child.exit_status)
            });
            finish_step(&self.hooks, execution, scope, result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::flow::FlowBuilder;
    use crate::batch::params::DefaultJobParametersValidator;
    use crate::batch::repository::{InMemoryJobRepository, JobRepository};
    use crate::batch::step::{FnTasklet, TaskletStep};
    use crate::batch::repeat::RepeatStatus;
    use parking_lot::Mutex;

    fn launcher() -> JobLauncher {
        JobLauncher::new(Arc::new(InMemoryJobRepository::new()))
    }

    fn noop_step(name: &str) -> TaskletStep<impl crate::batch::step::Tasklet> {
        TaskletStep::new(
            name,
            FnTasklet::new(|_contribution, _ctx| Ok(RepeatStatus::Finished)),
        )
    }

    struct RecordingJobListener {
        events: Mutex<Vec<String>>,
    }

    impl JobExecutionListener for RecordingJobListener {
        fn before_job(&self, job: &JobExecution) {
            self.events.lock().push(format!("before:{}", job.status));
        }

        fn after_job(&self, job: &JobExecution) {
            self.events.lock().push(format!("after:{}", job.status));
        }
    }

    #[tokio::test]
    async fn test_single_step_job_completes() {
        let job = Job::single_step("one", noop_step("only"));
        let execution = launcher().run(&job, JobParameters::new()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.code(), ExitStatus::COMPLETED);
        assert!(execution.start_time.is_some());
        assert!(execution.end_time.is_some());
        assert_eq!(execution.step_executions.len(), 1);
    }

    #[tokio::test]
    async fn test_job_listeners_see_start_and_end() {
        let listener = Arc::new(RecordingJobListener {
            events: Mutex::new(Vec::new()),
        });
        let job = Job::single_step("listened", noop_step("only")).listener(listener.clone());

        launcher().run(&job, JobParameters::new()).await.unwrap();

        assert_eq!(
            *listener.events.lock(),
            vec!["before:STARTED".to_string(), "after:COMPLETED".to_string()]
        );
    }

    #[tokio::test]
    async fn test_flow_error_fails_job_and_records_failure() {
        let flow = FlowBuilder::new("broken")
            .start(noop_step("a"))
            .on("NOPE")
            .end()
            .build()
            .unwrap();
        let job = Job::new("broken", flow);

        let execution = launcher().run(&job, JobParameters::new()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert!(matches!(
            execution.failures.first(),
            Some(BatchError::NoMatchingTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_validator_rejects_missing_parameter() {
        let job = Job::single_step("validated", noop_step("only")).validator(Arc::new(
            DefaultJobParametersValidator::new(vec!["input"], vec![]),
        ));

        let err = launcher().run(&job, JobParameters::new()).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_job_step_runs_child_with_extracted_parameters() {
        let seen = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&seen);
        let child = Arc::new(Job::single_step(
            "child",
            TaskletStep::new(
                "child-work",
                FnTasklet::new(move |_contribution, ctx| {
                    *recorded.lock() = ctx.scope.parameters().get_string("region").map(String::from);
                    Ok(RepeatStatus::Finished)
                }),
            ),
        ));

        let repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
        let parent = Job::single_step(
            "parent",
            JobStep::new("run-child", child).extractor(Arc::new(
                DefaultJobParametersExtractor::new(["region"]).use_all_parent_parameters(false),
            )),
        );
        let execution = JobLauncher::new(Arc::clone(&repository))
            .run(&parent, JobParameters::new().with_string("region", "eu"))
            .await
            .unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(seen.lock().as_deref(), Some("eu"));
        let step = execution.step_execution("run-child").unwrap();
        let child_id = step.execution_context.get_i64(JOB_STEP_EXECUTION_KEY).unwrap();
        let child_execution = repository.get_job_execution(child_id as u64).unwrap();
        assert_eq!(child_execution.job_name(), "child");
        assert_eq!(child_execution.status, BatchStatus::Completed);
    }

    #[test]
    fn test_extractor_falls_back_to_contexts() {
        let scope = crate::batch::step::tests::test_scope();
        scope
            .update_job_context(|ctx| ctx.put("threshold", 2.5))
            .unwrap();
        let mut step = StepExecution::new(1, scope.job_execution_id(), "s");
        step.execution_context.put("file", "a.csv");

        let params = DefaultJobParametersExtractor::new(["file", "threshold", "missing"])
            .extract(&step, &scope);

        assert_eq!(params.get_string("file"), Some("a.csv"));
        assert_eq!(params.get_double("threshold"), Some(2.5));
        assert!(params.get("missing").is_none());
    }
}
