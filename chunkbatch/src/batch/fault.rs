//! Fault tolerance: error classification, skip and retry policies, backoff.
//!
//! Every [`ItemError`] raised while reading, processing or writing is routed
//! through the policies configured in [`FaultTolerance`]:
//!
//! - **Retry** is considered first for process and write failures. Read
//!   failures are never retried because the engine cannot rewind a reader.
//! - **Skip** is considered once retries are exhausted (or not applicable).
//! - Anything else is **fatal** and fails the step.
//!
//! Classification is total: an error class matching no rule is fatal. Rules
//! are looked up from the error's own class towards the root and the first
//! (most specific) hit wins, so `no_skip("db.constraint")` overrides
//! `skip("db")` for constraint violations only.
//!
//! # Example
//!
//! ```ignore
//! use chunkbatch::batch::fault::{BackOffPolicy, FaultTolerance};
//! use std::time::Duration;
//!
//! let ft = FaultTolerance::builder()
//!     .skip("validation")
//!     .skip_limit(5)
//!     .retry("io.transient")
//!     .retry_limit(3)
//!     .backoff(BackOffPolicy::Fixed(Duration::from_millis(50)))
//!     .build();
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::{ErrorClass, ItemError};
use super::listener::RetryListener;

// =============================================================================
// Constants
// =============================================================================

/// Default maximum number of attempts for a retryable operation.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Upper bound applied to exponential backoff delays.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

// =============================================================================
// Error Classifier
// =============================================================================

/// Maps error classes to values, resolving by most specific ancestor.
#[derive(Clone, Debug)]
pub struct ErrorClassifier<T> {
    rules: BTreeMap<ErrorClass, T>,
    default: T,
}

impl<T: Clone> ErrorClassifier<T> {
    /// Creates a classifier returning `default` for unmatched classes.
    pub fn new(default: T) -> Self {
        Self {
            rules: BTreeMap::new(),
            default,
        }
    }

    /// Adds or replaces the rule for `class`.
    pub fn with_rule(mut self, class: impl Into<ErrorClass>, value: T) -> Self {
        self.rules.insert(class.into(), value);
        self
    }

    pub fn insert(&mut self, class: impl Into<ErrorClass>, value: T) {
        self.rules.insert(class.into(), value);
    }

    /// Returns the value for the most specific rule covering `class`.
    pub fn classify_class(&self, class: &ErrorClass) -> T {
        class
            .ancestry()
            .find_map(|ancestor| self.rules.get(&ancestor).cloned())
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn classify(&self, error: &ItemError) -> T {
        self.classify_class(error.class())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// =============================================================================
// Skip Policies
// =============================================================================

/// Outcome of asking a skip policy about one failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipDecision {
    /// Exclude the item and carry on.
    Skip,
    /// The error is not skippable.
    NoSkip,
    /// The error is skippable but the step already skipped as many items as allowed.
    LimitExceeded,
}

/// Decides whether a failed item may be skipped.
pub trait SkipPolicy: Send + Sync {
    /// `skip_count` is the step's cumulative skips so far, excluding this one.
    fn should_skip(&self, error: &ItemError, skip_count: u64) -> SkipDecision;

    /// The configured limit, when the policy has one.
    fn limit(&self) -> Option<u64> {
        None
    }
}

/// Skips every failure, without limit.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysSkipItemSkipPolicy;

impl SkipPolicy for AlwaysSkipItemSkipPolicy {
    fn should_skip(&self, _error: &ItemError, _skip_count: u64) -> SkipDecision {
        SkipDecision::Skip
    }
}

/// Never skips.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverSkipItemSkipPolicy;

impl SkipPolicy for NeverSkipItemSkipPolicy {
    fn should_skip(&self, _error: &ItemError, _skip_count: u64) -> SkipDecision {
        SkipDecision::NoSkip
    }
}

/// Skips classified errors until a step-wide limit is reached.
#[derive(Clone, Debug)]
pub struct LimitCheckingItemSkipPolicy {
    limit: u64,
    skippable: ErrorClassifier<bool>,
}

impl LimitCheckingItemSkipPolicy {
    pub fn new(limit: u64, skippable: ErrorClassifier<bool>) -> Self {
        Self { limit, skippable }
    }
}

impl SkipPolicy for LimitCheckingItemSkipPolicy {
    fn should_skip(&self, error: &ItemError, skip_count: u64) -> SkipDecision {
        if !self.skippable.classify(error) {
            return SkipDecision::NoSkip;
        }
        if skip_count < self.limit {
            SkipDecision::Skip
        } else {
            SkipDecision::LimitExceeded
        }
    }

    fn limit(&self) -> Option<u64> {
        Some(self.limit)
    }
}

// =============================================================================
// Retry Policies
// =============================================================================

/// Decides whether a failed operation may be attempted again.
pub trait RetryPolicy: Send + Sync {
    /// `attempts` is how many attempts have been made so far, all failed.
    fn can_retry(&self, error: &ItemError, attempts: u32) -> bool;

    /// The maximum number of attempts, when bounded.
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn can_retry(&self, _error: &ItemError, _attempts: u32) -> bool {
        false
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(1)
    }
}

/// Retries forever. Only useful with an operation known to recover.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysRetryPolicy;

impl RetryPolicy for AlwaysRetryPolicy {
    fn can_retry(&self, _error: &ItemError, _attempts: u32) -> bool {
        true
    }
}

/// Retries any error up to a total number of attempts.
#[derive(Clone, Copy, Debug)]
pub struct MaxAttemptsRetryPolicy {
    max_attempts: u32,
}

impl MaxAttemptsRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl RetryPolicy for MaxAttemptsRetryPolicy {
    fn can_retry(&self, _error: &ItemError, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }
}

/// Retries classified errors up to a total number of attempts.
#[derive(Clone, Debug)]
pub struct SimpleRetryPolicy {
    max_attempts: u32,
    retryable: ErrorClassifier<bool>,
}

impl SimpleRetryPolicy {
    pub fn new(max_attempts: u32, retryable: ErrorClassifier<bool>) -> Self {
        Self {
            max_attempts,
            retryable,
        }
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn can_retry(&self, error: &ItemError, attempts: u32) -> bool {
        attempts < self.max_attempts && self.retryable.classify(error)
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Delay inserted between retry attempts.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum BackOffPolicy {
    /// Retry immediately.
    #[default]
    None,
    /// Same delay before every retry.
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackOffPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => d,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let millis = (initial.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
        }
    }

    /// Sleeps for [`delay`](Self::delay), skipping the timer when zero.
    pub async fn pause(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

// =============================================================================
// Fault Tolerance Configuration
// =============================================================================

/// How a retryable process or write failure is replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RetryMode {
    /// Roll back the whole chunk and replay process and write for every
    /// cached item of the chunk.
    #[default]
    Chunk,
    /// Loop on the single failing operation in place, keeping the rest of
    /// the chunk's results. Exhausted items fall through to skip, then to a
    /// configured recoverer.
    Item,
}

impl RetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Item => "item",
        }
    }
}

impl std::str::FromStr for RetryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chunk" => Ok(Self::Chunk),
            "item" => Ok(Self::Item),
            other => Err(format!("unknown retry mode '{}'", other)),
        }
    }
}

/// Fault-tolerance settings of a chunk step.
///
/// The default is fail-fast: nothing is skipped, retried or exempt from rollback.
#[derive(Clone)]
pub struct FaultTolerance {
    pub skip_policy: Arc<dyn SkipPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub backoff: BackOffPolicy,
    /// Errors classified `true` do not roll back the chunk when retried or skipped.
    pub no_rollback: ErrorClassifier<bool>,
    pub retry_mode: RetryMode,
}

impl Default for FaultTolerance {
    fn default() -> Self {
        Self {
            skip_policy: Arc::new(NeverSkipItemSkipPolicy),
            retry_policy: Arc::new(NeverRetryPolicy),
            backoff: BackOffPolicy::None,
            no_rollback: ErrorClassifier::new(false),
            retry_mode: RetryMode::Chunk,
        }
    }
}

impl std::fmt::Debug for FaultTolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultTolerance")
            .field("skip_limit", &self.skip_policy.limit())
            .field("max_attempts", &self.retry_policy.max_attempts())
            .field("backoff", &self.backoff)
            .field("retry_mode", &self.retry_mode)
            .finish()
    }
}

impl FaultTolerance {
    pub fn builder() -> FaultToleranceBuilder {
        FaultToleranceBuilder::default()
    }

    pub fn should_skip(&self, error: &ItemError, skip_count: u64) -> SkipDecision {
        self.skip_policy.should_skip(error, skip_count)
    }

    pub fn can_retry(&self, error: &ItemError, attempts: u32) -> bool {
        self.retry_policy.can_retry(error, attempts)
    }

    pub fn rolls_back(&self, error: &ItemError) -> bool {
        !self.no_rollback.classify(error)
    }
}

impl From<&crate::config::FaultToleranceSettings> for FaultTolerance {
    fn from(settings: &crate::config::FaultToleranceSettings) -> Self {
        use crate::config::BackoffKind;

        let initial = Duration::from_millis(settings.backoff_initial_ms);
        let backoff = match settings.backoff {
            BackoffKind::None => BackOffPolicy::None,
            BackoffKind::Fixed => BackOffPolicy::Fixed(initial),
            BackoffKind::Exponential => BackOffPolicy::Exponential {
                initial,
                multiplier: settings.backoff_multiplier,
                max: Duration::from_millis(settings.backoff_max_ms),
            },
        };

        let mut builder = FaultTolerance::builder()
            .skip_limit(settings.skip_limit)
            .retry_limit(settings.retry_limit)
            .retry_mode(settings.retry_mode)
            .backoff(backoff);
        for class in &settings.skippable {
            builder = builder.skip(class.as_str());
        }
        for class in &settings.retryable {
            builder = builder.retry(class.as_str());
        }
        builder.build()
    }
}

/// Collects type rules and limits into a [`FaultTolerance`].
#[derive(Clone, Debug)]
pub struct FaultToleranceBuilder {
    skippable: ErrorClassifier<bool>,
    skip_limit: u64,
    retryable: ErrorClassifier<bool>,
    retry_limit: u32,
    backoff: BackOffPolicy,
    no_rollback: ErrorClassifier<bool>,
    retry_mode: RetryMode,
}

impl Default for FaultToleranceBuilder {
    fn default() -> Self {
        Self {
            skippable: ErrorClassifier::new(false),
            skip_limit: 0,
            retryable: ErrorClassifier::new(false),
            retry_limit: DEFAULT_RETRY_LIMIT,
            backoff: BackOffPolicy::None,
            no_rollback: ErrorClassifier::new(false),
            retry_mode: RetryMode::Chunk,
        }
    }
}

impl FaultToleranceBuilder {
    /// Marks `class` and its descendants skippable.
    pub fn skip(mut self, class: impl Into<ErrorClass>) -> Self {
        self.skippable.insert(class, true);
        self
    }

    /// Excludes `class` from skipping even if an ancestor is skippable.
    pub fn no_skip(mut self, class: impl Into<ErrorClass>) -> Self {
        self.skippable.insert(class, false);
        self
    }

    /// Step-wide maximum number of skipped items.
    pub fn skip_limit(mut self, limit: u64) -> Self {
        self.skip_limit = limit;
        self
    }

    pub fn retry(mut self, class: impl Into<ErrorClass>) -> Self {
        self.retryable.insert(class, true);
        self
    }

    pub fn no_retry(mut self, class: impl Into<ErrorClass>) -> Self {
        self.retryable.insert(class, false);
        self
    }

    /// Maximum attempts per item, including the first one.
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn backoff(mut self, backoff: BackOffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn no_rollback(mut self, class: impl Into<ErrorClass>) -> Self {
        self.no_rollback.insert(class, true);
        self
    }

    pub fn retry_mode(mut self, mode: RetryMode) -> Self {
        self.retry_mode = mode;
        self
    }

    pub fn build(self) -> FaultTolerance {
        let skip_policy: Arc<dyn SkipPolicy> = if self.skippable.is_empty() {
            Arc::new(NeverSkipItemSkipPolicy)
        } else {
            Arc::new(LimitCheckingItemSkipPolicy::new(
                self.skip_limit,
                self.skippable,
            ))
        };
        let retry_policy: Arc<dyn RetryPolicy> = if self.retryable.is_empty() {
            Arc::new(NeverRetryPolicy)
        } else {
            Arc::new(SimpleRetryPolicy::new(self.retry_limit, self.retryable))
        };
        FaultTolerance {
            skip_policy,
            retry_policy,
            backoff: self.backoff,
            no_rollback: self.no_rollback,
            retry_mode: self.retry_mode,
        }
    }
}

// =============================================================================
// Retry Template
// =============================================================================

/// State of one retryable operation, handed to callbacks and listeners.
#[derive(Clone, Debug, Default)]
pub struct RetryContext {
    /// Attempts made so far (0 before the first attempt).
    pub attempts: u32,
    pub last_error: Option<ItemError>,
}

/// Successful result of a retried operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    /// Total attempts, including the successful one.
    pub attempts: u32,
}

/// The operation failed and the policy allowed no further attempts.
#[derive(Clone, Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub error: ItemError,
}

/// Runs an operation in a loop until it succeeds or the policy gives up.
#[derive(Clone)]
pub struct RetryTemplate {
    policy: Arc<dyn RetryPolicy>,
    backoff: BackOffPolicy,
    listeners: Vec<Arc<dyn RetryListener>>,
}

impl RetryTemplate {
    pub fn new(policy: Arc<dyn RetryPolicy>, backoff: BackOffPolicy) -> Self {
        Self {
            policy,
            backoff,
            listeners: Vec::new(),
        }
    }

    /// Template using the retry settings of a [`FaultTolerance`].
    pub fn from_fault_tolerance(ft: &FaultTolerance) -> Self {
        Self::new(Arc::clone(&ft.retry_policy), ft.backoff)
    }

    pub fn with_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_listeners(mut self, listeners: &[Arc<dyn RetryListener>]) -> Self {
        self.listeners.extend(listeners.iter().cloned());
        self
    }

    /// Executes `callback`, retrying while the policy allows.
    pub async fn execute<T, F, Fut>(&self, mut callback: F) -> Result<Retried<T>, RetryExhausted>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, ItemError>>,
    {
        let mut ctx = RetryContext::default();
        for listener in &self.listeners {
            listener.open(&ctx);
        }
        loop {
            match callback(ctx.clone()).await {
                Ok(value) => {
                    ctx.attempts += 1;
                    if ctx.attempts > 1 {
                        debug!(attempts = ctx.attempts, "Retried operation succeeded");
                    }
                    for listener in &self.listeners {
                        listener.close(&ctx, true);
                    }
                    return Ok(Retried {
                        value,
                        attempts: ctx.attempts,
                    });
                }
                Err(error) => {
                    ctx.attempts += 1;
                    for listener in &self.listeners {
                        listener.on_error(&ctx, &error);
                    }
                    if !self.policy.can_retry(&error, ctx.attempts) {
                        for listener in &self.listeners {
                            listener.close(&ctx, false);
                        }
                        return Err(RetryExhausted {
                            attempts: ctx.attempts,
                            error,
                        });
                    }
                    let delay = self.backoff.delay(ctx.attempts);
                    warn!(
                        attempt = ctx.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying"
                    );
                    ctx.last_error = Some(error);
                    self.backoff.pause(ctx.attempts).await;
                }
            }
        }
    }

    /// Executes `callback`; once retries are exhausted, `recover` supplies the result.
    pub async fn execute_with_recovery<T, F, Fut, R>(
        &self,
        callback: F,
        recover: R,
    ) -> Result<Retried<T>, ItemError>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, ItemError>>,
        R: FnOnce(&RetryExhausted) -> Result<T, ItemError>,
    {
        match self.execute(callback).await {
            Ok(done) => Ok(done),
            Err(exhausted) => recover(&exhausted).map(|value| Retried {
                value,
                attempts: exhausted.attempts,
            }),
        }
    }
}
