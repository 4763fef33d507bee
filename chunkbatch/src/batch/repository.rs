//! Execution metadata storage.
//!
//! [`JobRepository`] is the contract the launcher and steps use to record
//! instances, executions and their contexts. The layout is one record per
//! [`JobInstance`], [`JobExecution`] and [`StepExecution`], plus one
//! serialized blob per [`ExecutionContext`], keyed by execution id.
//!
//! [`InMemoryJobRepository`] keeps everything in concurrent maps. Contexts
//! are still stored as JSON so that anything a step puts into its context is
//! known to survive a real store.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use super::context::ExecutionContext;
use super::error::BatchError;
use super::execution::{JobExecution, JobInstance, StepExecution};
use super::params::JobParameters;

// =============================================================================
// Repository Contract
// =============================================================================

pub trait JobRepository: Send + Sync {
    /// Returns the instance for `(job_name, parameters)`, if one was created.
    fn get_job_instance(&self, job_name: &str, parameters: &JobParameters) -> Option<JobInstance>;

    /// Returns the most recently created instance of a job.
    fn last_job_instance(&self, job_name: &str) -> Option<JobInstance>;

    /// Creates a new execution, creating the instance first when needed.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError>;

    /// Creates a new execution only if `admit` accepts the instance's earlier
    /// executions (oldest first).
    ///
    /// The check and the insert are one atomic step per instance: concurrent
    /// launches of the same instance are admitted one at a time. Returns the
    /// new execution and the most recent earlier one.
    fn create_job_execution_checked(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        admit: &dyn Fn(&[JobExecution]) -> Result<(), BatchError>,
    ) -> Result<(JobExecution, Option<JobExecution>), BatchError>;

    fn get_job_execution(&self, execution_id: u64) -> Option<JobExecution>;

    /// All executions of an instance, oldest first.
    fn job_executions(&self, instance: &JobInstance) -> Vec<JobExecution>;

    fn last_job_execution(&self, instance: &JobInstance) -> Option<JobExecution> {
        self.job_executions(instance).pop()
    }

    /// Persists the execution's status, timestamps and job context.
    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), BatchError>;

    /// Assigns an id to a new step execution and stores it.
    fn add_step_execution(&self, step: &mut StepExecution) -> Result<(), BatchError>;

    /// Persists counts, status and step context. Called at every chunk commit.
    fn update_step_execution(&self, step: &StepExecution) -> Result<(), BatchError>;

    /// Latest execution of a step across all executions of an instance.
    fn last_step_execution(&self, instance: &JobInstance, step_name: &str) -> Option<StepExecution>;

    /// Number of times a step was started across all executions of an instance.
    fn step_execution_count(&self, instance: &JobInstance, step_name: &str) -> u32;
}

// =============================================================================
// In-Memory Repository
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ContextKey {
    Job(u64),
    Step(u64),
}

/// Repository backed by [`DashMap`]s.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    instance_ids: AtomicU64,
    execution_ids: AtomicU64,
    step_ids: AtomicU64,
    instances: DashMap<(String, String), JobInstance>,
    executions: DashMap<u64, JobExecution>,
    steps: DashMap<u64, StepExecution>,
    contexts: DashMap<ContextKey, String>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_context(&self, key: ContextKey, ctx: &ExecutionContext) -> Result<(), BatchError> {
        let blob = ctx.to_json()?;
        self.contexts.insert(key, blob);
        Ok(())
    }

    fn load_context(&self, key: ContextKey) -> ExecutionContext {
        self.contexts
            .get(&key)
            .and_then(|blob| ExecutionContext::from_json(blob.value()).ok())
            .unwrap_or_default()
    }

    fn load_step(&self, step: &StepExecution) -> StepExecution {
        let mut step = step.clone();
        step.execution_context = self.load_context(ContextKey::Step(step.id));
        step
    }

    /// Rebuilds a full execution: stored record, job context and step list.
    fn assemble(&self, record: &JobExecution) -> JobExecution {
        let mut execution = record.clone();
        execution.execution_context = self.load_context(ContextKey::Job(execution.id));
        let mut steps: Vec<StepExecution> = self
            .steps
            .iter()
            .filter(|s| s.job_execution_id == execution.id)
            .map(|s| s.value().clone())
            .collect();
        steps.sort_by_key(|s| s.id);
        execution.step_executions = steps.iter().map(|s| self.load_step(s)).collect();
        execution
    }

    fn execution_ids_of(&self, instance: &JobInstance) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .executions
            .iter()
            .filter(|e| e.instance.id == instance.id)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn insert_execution(
        &self,
        instance: JobInstance,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError> {
        let id = self.execution_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let execution = JobExecution::new(id, instance, parameters.clone());
        self.store_context(ContextKey::Job(id), &execution.execution_context)?;
        self.executions.insert(id, execution.clone());
        trace!(job = %execution.job_name(), execution_id = id, "Job execution created");
        Ok(execution)
    }

    fn steps_of(&self, instance: &JobInstance, step_name: &str) -> Vec<StepExecution> {
        let execution_ids = self.execution_ids_of(instance);
        let mut steps: Vec<StepExecution> = self
            .steps
            .iter()
            .filter(|s| s.step_name == step_name && execution_ids.contains(&s.job_execution_id))
            .map(|s| s.value().clone())
            .collect();
        steps.sort_by_key(|s| s.id);
        steps
    }
}

fn admit_any(_previous: &[JobExecution]) -> Result<(), BatchError> {
    Ok(())
}

impl JobRepository for InMemoryJobRepository {
    fn get_job_instance(&self, job_name: &str, parameters: &JobParameters) -> Option<JobInstance> {
        self.instances
            .get(&(job_name.to_string(), parameters.identity_key()))
            .map(|i| i.value().clone())
    }

    fn last_job_instance(&self, job_name: &str) -> Option<JobInstance> {
        self.instances
            .iter()
            .filter(|i| i.job_name == job_name)
            .map(|i| i.value().clone())
            .max_by_key(|i| i.id)
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError> {
        self.create_job_execution_checked(job_name, parameters, &admit_any)
            .map(|(execution, _)| execution)
    }

    fn create_job_execution_checked(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        admit: &dyn Fn(&[JobExecution]) -> Result<(), BatchError>,
    ) -> Result<(JobExecution, Option<JobExecution>), BatchError> {
        let key = (job_name.to_string(), parameters.identity_key());
        // The entry guard locks the instance's shard until the new execution is stored
        let instance = self.instances.entry(key.clone()).or_insert_with(|| JobInstance {
            id: self.instance_ids.fetch_add(1, Ordering::SeqCst) + 1,
            job_name: key.0.clone(),
            key: key.1.clone(),
        });

        let mut previous = self.job_executions(instance.value());
        admit(&previous)?;
        let execution = self.insert_execution(instance.value().clone(), parameters)?;
        drop(instance);
        Ok((execution, previous.pop()))
    }

    fn get_job_execution(&self, execution_id: u64) -> Option<JobExecution> {
        let record = self.executions.get(&execution_id)?.value().clone();
        Some(self.assemble(&record))
    }

    fn job_executions(&self, instance: &JobInstance) -> Vec<JobExecution> {
        self.execution_ids_of(instance)
            .into_iter()
            .filter_map(|id| self.get_job_execution(id))
            .collect()
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), BatchError> {
        if !self.executions.contains_key(&execution.id) {
            return Err(BatchError::NoSuchExecution(execution.id));
        }
        self.store_context(ContextKey::Job(execution.id), &execution.execution_context)?;
        let mut record = execution.clone();
        record.step_executions.clear();
        self.executions.insert(execution.id, record);
        Ok(())
    }

    fn add_step_execution(&self, step: &mut StepExecution) -> Result<(), BatchError> {
        step.id = self.step_ids.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_step_execution(step)
    }

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), BatchError> {
        self.store_context(ContextKey::Step(step.id), &step.execution_context)?;
        self.steps.insert(step.id, step.clone());
        Ok(())
    }

    fn last_step_execution(&self, instance: &JobInstance, step_name: &str) -> Option<StepExecution> {
        self.steps_of(instance, step_name)
            .pop()
            .map(|s| self.load_step(&s))
    }

    fn step_execution_count(&self, instance: &JobInstance, step_name: &str) -> u32 {
        self.steps_of(instance, step_name).len() as u32
    }
}
