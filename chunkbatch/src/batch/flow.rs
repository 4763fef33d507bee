//! Flows: directed graphs of steps, decisions, nested flows and splits.
//!
//! When a node finishes, its exit code is matched against the node's
//! outgoing transitions, most specific pattern first:
//!
//! 1. exact codes (no wildcards)
//! 2. patterns with fewer `*`, then fewer `?`, then longer patterns
//! 3. the catch-all `*`
//!
//! The first match picks the next node or a terminal. A node without any
//! outgoing transition ends the flow with its own status; a node whose exit
//! code matches none of its transitions fails the flow with
//! [`BatchError::NoMatchingTransition`].
//!
//! # Example
//!
//! ```ignore
//! let flow = FlowBuilder::new("import")
//!     .start(load_step)
//!     .on("FAILED").to(cleanup_step)
//!     .from("load").on("*").to(report_step)
//!     .build()?;
//! ```

use futures::future::BoxFuture;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::error::BatchError;
use super::execution::{JobExecution, StepExecution};
use super::listener::{ExecutionContextPromotionListener, StepExecutionListener, StepHooks};
use super::status::{BatchStatus, ExitStatus};
use super::step::{begin_step, execute_step, finish_step, Step, StepOptions, StepOutcome, StepScope};
use super::telemetry::BatchEvent;

// =============================================================================
// Pattern Matching
// =============================================================================

/// Matches an exit code against a transition pattern.
///
/// `*` matches any sequence (including none), `?` exactly one character.
/// Everything else matches literally and case-sensitively.
pub fn pattern_matches(pattern: &str, code: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let code: Vec<char> = code.chars().collect();
    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < code.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, c));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == '?' || pattern[p] == code[c]) {
            p += 1;
            c += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            c = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&ch| ch == '*')
}

/// Sort key placing more specific patterns first.
fn specificity(pattern: &str) -> (usize, usize, Reverse<usize>) {
    let stars = pattern.chars().filter(|&c| c == '*').count();
    let singles = pattern.chars().filter(|&c| c == '?').count();
    (stars, singles, Reverse(pattern.len()))
}

// =============================================================================
// Nodes and Transitions
// =============================================================================

/// Chooses a route from the job state. Must not mutate anything.
pub trait Decider: Send + Sync {
    fn decide(&self, job: &JobExecution, last_step: Option<&StepExecution>) -> ExitStatus;
}

impl<F> Decider for F
where
    F: Fn(&JobExecution, Option<&StepExecution>) -> ExitStatus + Send + Sync,
{
    fn decide(&self, job: &JobExecution, last_step: Option<&StepExecution>) -> ExitStatus {
        self(job, last_step)
    }
}

/// A vertex of a flow.
#[derive(Clone)]
pub enum FlowNode {
    Step(Arc<dyn Step>),
    Decision {
        name: String,
        decider: Arc<dyn Decider>,
    },
    Flow(Arc<Flow>),
    /// Flows run concurrently; the worst outcome wins.
    Split { name: String, flows: Vec<Arc<Flow>> },
}

impl FlowNode {
    pub fn step(step: impl Step + 'static) -> Self {
        Self::Step(Arc::new(step))
    }

    pub fn shared_step(step: Arc<dyn Step>) -> Self {
        Self::Step(step)
    }

    pub fn decision(name: impl Into<String>, decider: impl Decider + 'static) -> Self {
        Self::Decision {
            name: name.into(),
            decider: Arc::new(decider),
        }
    }

    pub fn flow(flow: Flow) -> Self {
        Self::Flow(Arc::new(flow))
    }

    pub fn split(name: impl Into<String>, flows: Vec<Flow>) -> Self {
        Self::Split {
            name: name.into(),
            flows: flows.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Step(step) => step.name(),
            Self::Decision { name, .. } | Self::Split { name, .. } => name,
            Self::Flow(flow) => flow.name(),
        }
    }
}

impl<S: Step + 'static> From<S> for FlowNode {
    fn from(step: S) -> Self {
        Self::step(step)
    }
}

impl std::fmt::Debug for FlowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Step(_) => "Step",
            Self::Decision { .. } => "Decision",
            Self::Flow(_) => "Flow",
            Self::Split { .. } => "Split",
        };
        write!(f, "{}({})", kind, self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Target {
    Node(String),
    End(String),
    Fail,
    Stop,
    StopAndRestart(String),
}

impl Target {
    fn label(&self) -> &str {
        match self {
            Self::Node(name) => name,
            Self::End(_) => "end",
            Self::Fail => "fail",
            Self::Stop | Self::StopAndRestart(_) => "stop",
        }
    }
}

#[derive(Clone, Debug)]
struct Transition {
    pattern: String,
    target: Target,
}

// =============================================================================
// Flow
// =============================================================================

/// Terminal state of a flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowOutcome {
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
}

impl FlowOutcome {
    pub fn new(status: BatchStatus, exit_status: ExitStatus) -> Self {
        Self {
            status,
            exit_status,
        }
    }
}

struct NodeResult {
    status: BatchStatus,
    exit_status: ExitStatus,
    step: Option<StepExecution>,
}

/// An immutable flow definition. Build one with [`FlowBuilder`].
pub struct Flow {
    name: String,
    start: String,
    nodes: HashMap<String, FlowNode>,
    transitions: HashMap<String, Vec<Transition>>,
}

impl Flow {
    /// A flow made of one node and no transitions.
    pub fn single(name: impl Into<String>, node: impl Into<FlowNode>) -> Self {
        let node = node.into();
        let start = node.name().to_string();
        let mut nodes = HashMap::new();
        nodes.insert(start.clone(), node);
        Self {
            name: name.into(),
            start,
            nodes,
            transitions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_node(&self) -> &str {
        &self.start
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Job context key holding the node a stopped flow resumes at.
    pub fn restart_key(&self) -> String {
        format!("batch.flow.{}.restart", self.name)
    }

    /// Runs the flow to a terminal state.
    pub fn run<'a>(&'a self, scope: &'a StepScope) -> BoxFuture<'a, Result<FlowOutcome, BatchError>> {
        Box::pin(self.execute(scope))
    }

    async fn execute(&self, scope: &StepScope) -> Result<FlowOutcome, BatchError> {
        let mut current = self.resume_point(scope)?;
        let mut last_step: Option<StepExecution> = None;
        let mut status = BatchStatus::Completed;
        debug!(flow = %self.name, start = %current, "Flow started");

        loop {
            let node = self.nodes.get(&current).ok_or_else(|| BatchError::UnknownFlowNode {
                flow: self.name.clone(),
                node: current.clone(),
            })?;
            let result = self.execute_node(node, scope, last_step.as_ref(), status).await?;
            status = result.status;
            if result.step.is_some() {
                last_step = result.step;
            }
            let exit_status = result.exit_status;

            if status == BatchStatus::Stopped && scope.is_stop_requested() {
                info!(flow = %self.name, node = %current, "Flow stopped on request");
                return Ok(FlowOutcome::new(status, exit_status));
            }

            let transitions = match self.transitions.get(&current) {
                Some(transitions) if !transitions.is_empty() => transitions,
                _ => return Ok(FlowOutcome::new(status, exit_status)),
            };

            let code = exit_status.code();
            let transition = transitions
                .iter()
                .find(|t| pattern_matches(&t.pattern, code))
                .ok_or_else(|| BatchError::NoMatchingTransition {
                    node: current.clone(),
                    exit_code: code.to_string(),
                })?;

            debug!(
                flow = %self.name,
                from = %current,
                exit_code = %code,
                to = %transition.target.label(),
                "Flow transition"
            );
            scope.telemetry().emit(BatchEvent::FlowTransition {
                flow: self.name.clone(),
                from: current.clone(),
                exit_code: code.to_string(),
                to: transition.target.label().to_string(),
            });

            match &transition.target {
                Target::Node(next) => current = next.clone(),
                Target::End(code) => {
                    return Ok(FlowOutcome::new(BatchStatus::Completed, ExitStatus::new(code.as_str())))
                }
                Target::Fail => {
                    return Ok(FlowOutcome::new(
                        BatchStatus::Failed,
                        ExitStatus::failed().with_description(format!("failed after '{}'", current)),
                    ))
                }
                Target::Stop => {
                    return Ok(FlowOutcome::new(BatchStatus::Stopped, ExitStatus::stopped()))
                }
                Target::StopAndRestart(restart) => {
                    let key = self.restart_key();
                    let restart_at = restart.clone();
                    scope.update_job_context(|ctx| ctx.put(key, restart_at))?;
                    info!(flow = %self.name, restart = %restart, "Flow stopped, will restart at node");
                    return Ok(FlowOutcome::new(BatchStatus::Stopped, ExitStatus::stopped()));
                }
            }
        }
    }

    /// Start node, or the node a previous stop asked to restart at.
    fn resume_point(&self, scope: &StepScope) -> Result<String, BatchError> {
        let key = self.restart_key();
        let saved = scope.job_context().get_string(&key).map(str::to_string);
        match saved {
            Some(node) if self.nodes.contains_key(&node) => {
                scope.update_job_context(|ctx| ctx.remove(&key))?;
                info!(flow = %self.name, node = %node, "Resuming flow at restart node");
                Ok(node)
            }
            _ => Ok(self.start.clone()),
        }
    }

    async fn execute_node(
        &self,
        node: &FlowNode,
        scope: &StepScope,
        last_step: Option<&StepExecution>,
        status: BatchStatus,
    ) -> Result<NodeResult, BatchError> {
        match node {
            FlowNode::Step(step) => {
                let execution = execute_step(step.as_ref(), scope).await?;
                Ok(NodeResult {
                    status: execution.status,
                    exit_status: execution.exit_status.clone(),
                    step: Some(execution),
                })
            }
            FlowNode::Decision { name, decider } => {
                let job = scope.job_execution();
                let exit_status = decider.decide(&job, last_step);
                debug!(flow = %self.name, decision = %name, exit_code = %exit_status.code(), "Decision made");
                Ok(NodeResult {
                    status,
                    exit_status,
                    step: None,
                })
            }
            FlowNode::Flow(flow) => {
                let outcome = flow.run(scope).await?;
                Ok(NodeResult {
                    status: outcome.status,
                    exit_status: outcome.exit_status,
                    step: None,
                })
            }
            FlowNode::Split { name, flows } => {
                let outcome = run_split(name, flows, scope).await?;
                Ok(NodeResult {
                    status: outcome.status,
                    exit_status: outcome.exit_status,
                    step: None,
                })
            }
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

/// Runs flows concurrently and combines their outcomes, worst first.
async fn run_split(
    name: &str,
    flows: &[Arc<Flow>],
    scope: &StepScope,
) -> Result<FlowOutcome, BatchError> {
    let mut tasks = JoinSet::new();
    for flow in flows {
        let flow = Arc::clone(flow);
        let scope = scope.clone();
        tasks.spawn(async move {
            let outcome = flow.run(&scope).await;
            outcome
        });
    }
    debug!(split = %name, flows = flows.len(), "Split started");

    let mut status = BatchStatus::Completed;
    let mut exit_status: Option<ExitStatus> = None;
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(outcome)) => {
                status = status.upgrade_to(outcome.status);
                exit_status = Some(match exit_status {
                    Some(exit) => exit.and(outcome.exit_status),
                    None => outcome.exit_status,
                });
            }
            Ok(Err(err)) => {
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                first_error.get_or_insert(BatchError::WorkerAborted {
                    worker: name.to_string(),
                    reason: join_err.to_string(),
                });
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(FlowOutcome::new(
        status,
        exit_status.unwrap_or_else(ExitStatus::completed),
    ))
}

// =============================================================================
// Builder
// =============================================================================

/// Fluent construction of a [`Flow`].
///
/// Nodes are registered by name the first time they appear; later references
/// use [`from`](Self::from) or [`TransitionBuilder::to_named`].
pub struct FlowBuilder {
    name: String,
    start: Option<String>,
    current: Option<String>,
    nodes: HashMap<String, FlowNode>,
    transitions: Vec<(String, Transition)>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: None,
            current: None,
            nodes: HashMap::new(),
            transitions: Vec::new(),
        }
    }

    fn register(&mut self, node: FlowNode) -> String {
        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            debug!(flow = %self.name, node = %name, "Node already registered, keeping first definition");
        } else {
            self.nodes.insert(name.clone(), node);
        }
        name
    }

    fn add_transition(&mut self, pattern: String, target: Target) {
        if let Some(from) = self.current.clone() {
            self.transitions.push((from, Transition { pattern, target }));
        }
    }

    /// Sets the entry node.
    pub fn start(mut self, node: impl Into<FlowNode>) -> Self {
        let name = self.register(node.into());
        self.start = Some(name.clone());
        self.current = Some(name);
        self
    }

    /// Continues to `node` when the current node exits `COMPLETED`.
    pub fn next(mut self, node: impl Into<FlowNode>) -> Self {
        if self.current.is_none() {
            return self.start(node);
        }
        let name = self.register(node.into());
        self.add_transition(ExitStatus::COMPLETED.to_string(), Target::Node(name.clone()));
        self.current = Some(name);
        self
    }

    /// Starts a transition from the current node for exit codes matching `pattern`.
    pub fn on(self, pattern: impl Into<String>) -> TransitionBuilder {
        TransitionBuilder {
            builder: self,
            pattern: pattern.into(),
        }
    }

    /// Makes an already registered node the current one.
    pub fn from(mut self, node: impl Into<String>) -> Self {
        self.current = Some(node.into());
        self
    }

    /// Validates node references and builds the flow.
    pub fn build(self) -> Result<Flow, BatchError> {
        let unknown = |node: &str| BatchError::UnknownFlowNode {
            flow: self.name.clone(),
            node: node.to_string(),
        };
        let start = self.start.clone().ok_or_else(|| unknown("<start>"))?;

        let mut transitions: HashMap<String, Vec<Transition>> = HashMap::new();
        for (from, transition) in &self.transitions {
            if !self.nodes.contains_key(from) {
                return Err(unknown(from));
            }
            if let Target::Node(to) | Target::StopAndRestart(to) = &transition.target {
                if !self.nodes.contains_key(to) {
                    return Err(unknown(to));
                }
            }
            transitions
                .entry(from.clone())
                .or_default()
                .push(transition.clone());
        }
        for list in transitions.values_mut() {
            list.sort_by_key(|t| specificity(&t.pattern));
        }

        Ok(Flow {
            name: self.name,
            start,
            nodes: self.nodes,
            transitions,
        })
    }
}

/// Pending transition created by [`FlowBuilder::on`].
pub struct TransitionBuilder {
    builder: FlowBuilder,
    pattern: String,
}

impl TransitionBuilder {
    fn finish(mut self, target: Target) -> FlowBuilder {
        self.builder.add_transition(self.pattern, target);
        self.builder
    }

    /// Routes to a new node, which becomes the current one.
    pub fn to(mut self, node: impl Into<FlowNode>) -> FlowBuilder {
        let name = self.builder.register(node.into());
        let mut builder = self.finish(Target::Node(name.clone()));
        builder.current = Some(name);
        builder
    }

    /// Routes to a node registered earlier.
    pub fn to_named(self, node: impl Into<String>) -> FlowBuilder {
        let name = node.into();
        let mut builder = self.finish(Target::Node(name.clone()));
        builder.current = Some(name);
        builder
    }

    /// Ends the flow `COMPLETED`.
    pub fn end(self) -> FlowBuilder {
        self.end_with(ExitStatus::COMPLETED)
    }

    /// Ends the flow `COMPLETED` with a custom exit code.
    pub fn end_with(self, exit_code: impl Into<String>) -> FlowBuilder {
        let code = exit_code.into();
        self.finish(Target::End(code))
    }

    /// Ends the flow `FAILED`.
    pub fn fail(self) -> FlowBuilder {
        self.finish(Target::Fail)
    }

    /// Ends the flow `STOPPED`; a restart begins at the start node.
    pub fn stop(self) -> FlowBuilder {
        self.finish(Target::Stop)
    }

    /// Ends the flow `STOPPED`; a restart begins at `node`.
    pub fn stop_and_restart(mut self, node: impl Into<FlowNode>) -> FlowBuilder {
        let name = self.builder.register(node.into());
        let mut builder = self.finish(Target::StopAndRestart(name.clone()));
        builder.current = Some(name);
        builder
    }
}

// =============================================================================
// Flow Step
// =============================================================================

/// Runs a flow as the body of a single step.
///
/// The flow's terminal status becomes the step's status.
pub struct FlowStep {
    name: String,
    flow: Flow,
    options: StepOptions,
    hooks: StepHooks,
}

impl FlowStep {
    pub fn new(name: impl Into<String>, flow: Flow) -> Self {
        Self {
            name: name.into(),
            flow,
            options: StepOptions::default(),
            hooks: StepHooks::default(),
        }
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

impl Step for FlowStep {
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
            let result = self
                .flow
                .run(scope)
                .await
                .map(|outcome| StepOutcome::new(outcome.status, outcome.exit_status));
            finish_step(&self.hooks, execution, scope, result)
        })
    }
}
