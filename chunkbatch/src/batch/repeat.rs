//! Repeat operations: run a callback until a completion policy says stop.
//!
//! [`RepeatTemplate`] is the loop behind tasklet steps. Each iteration
//! reports a [`RepeatStatus`]; the [`CompletionPolicy`] decides whether the
//! loop is done and the [`ExceptionHandler`] decides whether a failed
//! iteration ends it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::error::ItemError;

/// Result of one iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepeatStatus {
    /// More work may remain; call again.
    Continuable,
    /// Work is done.
    Finished,
}

impl RepeatStatus {
    pub fn continue_if(more: bool) -> Self {
        if more {
            Self::Continuable
        } else {
            Self::Finished
        }
    }

    pub fn is_continuable(&self) -> bool {
        matches!(self, Self::Continuable)
    }
}

/// State of one repeat loop.
#[derive(Clone, Debug)]
pub struct RepeatContext {
    pub started: Instant,
    /// Completed iterations, failed ones included.
    pub count: u64,
    /// Failed iterations the exception handler tolerated.
    pub errors: u64,
}

impl RepeatContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
            errors: 0,
        }
    }
}

impl Default for RepeatContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Completion Policies
// =============================================================================

pub trait CompletionPolicy: Send + Sync {
    /// Whether the loop is complete after an iteration that returned `last`.
    fn is_complete(&self, ctx: &RepeatContext, last: RepeatStatus) -> bool;
}

/// Completes only when an iteration returns [`RepeatStatus::Finished`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCompletionPolicy;

impl CompletionPolicy for DefaultCompletionPolicy {
    fn is_complete(&self, _ctx: &RepeatContext, last: RepeatStatus) -> bool {
        last == RepeatStatus::Finished
    }
}

/// Completes after a fixed number of iterations.
#[derive(Clone, Copy, Debug)]
pub struct SimpleCompletionPolicy {
    chunk_size: u64,
}

impl SimpleCompletionPolicy {
    pub fn new(chunk_size: u64) -> Self {
        Self { chunk_size }
    }
}

impl CompletionPolicy for SimpleCompletionPolicy {
    fn is_complete(&self, ctx: &RepeatContext, last: RepeatStatus) -> bool {
        last == RepeatStatus::Finished || ctx.count >= self.chunk_size
    }
}

/// Completes once a time budget is used up.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutTerminationPolicy {
    timeout: Duration,
}

impl TimeoutTerminationPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CompletionPolicy for TimeoutTerminationPolicy {
    fn is_complete(&self, ctx: &RepeatContext, last: RepeatStatus) -> bool {
        last == RepeatStatus::Finished || ctx.started.elapsed() >= self.timeout
    }
}

/// Completes as soon as any delegate policy does.
#[derive(Clone)]
pub struct CompositeCompletionPolicy {
    policies: Vec<Arc<dyn CompletionPolicy>>,
}

impl CompositeCompletionPolicy {
    pub fn new(policies: Vec<Arc<dyn CompletionPolicy>>) -> Self {
        Self { policies }
    }
}

impl CompletionPolicy for CompositeCompletionPolicy {
    fn is_complete(&self, ctx: &RepeatContext, last: RepeatStatus) -> bool {
        self.policies.iter().any(|p| p.is_complete(ctx, last))
    }
}

// =============================================================================
// Exception Handlers
// =============================================================================

pub trait ExceptionHandler: Send + Sync {
    /// Returns `Ok` to carry on with the next iteration, `Err` to end the loop.
    fn handle(&self, ctx: &mut RepeatContext, error: ItemError) -> Result<(), ItemError>;
}

/// Ends the loop on the first error.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn handle(&self, _ctx: &mut RepeatContext, error: ItemError) -> Result<(), ItemError> {
        Err(error)
    }
}

/// Tolerates up to `limit` errors per loop, then ends it.
#[derive(Clone, Copy, Debug)]
pub struct SimpleLimitExceptionHandler {
    limit: u64,
}

impl SimpleLimitExceptionHandler {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl ExceptionHandler for SimpleLimitExceptionHandler {
    fn handle(&self, ctx: &mut RepeatContext, error: ItemError) -> Result<(), ItemError> {
        if ctx.errors >= self.limit {
            return Err(error);
        }
        ctx.errors += 1;
        debug!(errors = ctx.errors, limit = self.limit, error = %error, "Tolerating failed iteration");
        Ok(())
    }
}

// =============================================================================
// Repeat Template
// =============================================================================

/// Drives a repeat loop.
#[derive(Clone)]
pub struct RepeatTemplate {
    completion: Arc<dyn CompletionPolicy>,
    exception_handler: Arc<dyn ExceptionHandler>,
}

impl Default for RepeatTemplate {
    fn default() -> Self {
        Self {
            completion: Arc::new(DefaultCompletionPolicy),
            exception_handler: Arc::new(DefaultExceptionHandler),
        }
    }
}

impl RepeatTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.completion = policy;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    /// Begins a loop.
    pub fn start(&self) -> RepeatContext {
        RepeatContext::new()
    }

    /// Records one iteration and returns `Ok(true)` once the loop is complete.
    ///
    /// A tolerated error counts as a continuable iteration.
    pub fn advance(
        &self,
        ctx: &mut RepeatContext,
        result: Result<RepeatStatus, ItemError>,
    ) -> Result<bool, ItemError> {
        ctx.count += 1;
        let status = match result {
            Ok(status) => status,
            Err(error) => {
                self.exception_handler.handle(ctx, error)?;
                RepeatStatus::Continuable
            }
        };
        Ok(self.completion.is_complete(ctx, status))
    }

    /// Runs `callback` until the loop completes or an error ends it.
    ///
    /// Returns the number of iterations.
    pub async fn iterate<F, Fut>(&self, mut callback: F) -> Result<u64, ItemError>
    where
        F: FnMut(RepeatContext) -> Fut,
        Fut: Future<Output = Result<RepeatStatus, ItemError>>,
    {
        let mut ctx = self.start();
        loop {
            let result = callback(ctx.clone()).await;
            if self.advance(&mut ctx, result)? {
                return Ok(ctx.count);
            }
        }
    }
}
