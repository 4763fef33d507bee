//! Error types for the batch engine.
//!
//! Two layers of errors exist:
//!
//! - [`ItemError`] is raised by readers, processors, writers and tasklets.
//!   Each carries an [`ErrorClass`], a dot-separated type path that plays the
//!   role of an exception hierarchy: `db.transient.timeout` is a
//!   `db.transient`, which is a `db`. Skip, retry and rollback rules are keyed
//!   by class and the most specific configured ancestor wins.
//! - [`BatchError`] covers engine-level failures: launch contract violations,
//!   flow routing failures, limits being exceeded.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::status::BatchStatus;

// =============================================================================
// Error Class
// =============================================================================

/// Hierarchical error type used for fault-tolerance classification.
///
/// The empty path is the root class; every class is a descendant of it.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ErrorClass(String);

impl ErrorClass {
    /// Creates a class from a dot-separated path such as `"io.timeout"`.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self(path.trim_matches('.').to_string())
    }

    /// The root class every error belongs to.
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the parent class, or `None` for the root.
    pub fn parent(&self) -> Option<ErrorClass> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('.') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Returns true if `self` is `other` or one of its descendants.
    pub fn is_a(&self, other: &ErrorClass) -> bool {
        if other.is_root() || self.0 == other.0 {
            return true;
        }
        self.0.len() > other.0.len()
            && self.0.starts_with(&other.0)
            && self.0.as_bytes()[other.0.len()] == b'.'
    }

    /// Iterates from this class up to and including the root.
    pub fn ancestry(&self) -> impl Iterator<Item = ErrorClass> {
        std::iter::successors(Some(self.clone()), ErrorClass::parent)
    }

    /// Number of path segments; the root has depth zero.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.split('.').count()
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for ErrorClass {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for ErrorClass {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

// =============================================================================
// Item Error
// =============================================================================

/// Failure raised by item-level collaborators.
///
/// Cheap to clone so it can be handed to listeners and recorded on the step
/// execution while the engine still decides what to do with it.
#[derive(Clone)]
pub struct ItemError {
    class: ErrorClass,
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ItemError {
    /// Creates an error of the given class.
    pub fn new(class: impl Into<ErrorClass>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an underlying error, classifying it under `class`.
    pub fn with_source(
        class: impl Into<ErrorClass>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            class: class.into(),
            message: source.to_string(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn class(&self) -> &ErrorClass {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this error belongs to `class` or a descendant of it.
    pub fn is_a(&self, class: &ErrorClass) -> bool {
        self.class.is_a(class)
    }
}

impl fmt::Debug for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemError")
            .field("class", &self.class.as_str())
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

impl std::error::Error for ItemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

// =============================================================================
// Batch Error
// =============================================================================

/// Engine-level errors.
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    /// An item-level failure escalated to fatal.
    #[error("Item failure: {0}")]
    Item(#[from] ItemError),

    /// More skippable failures than the configured limit.
    #[error("Skip limit of {limit} exceeded: {error}")]
    SkipLimitExceeded { limit: u64, error: ItemError },

    /// Retries were exhausted and the failure could neither be skipped nor recovered.
    #[error("Retry exhausted after {attempts} attempts: {error}")]
    RetryExhausted { attempts: u32, error: ItemError },

    /// A chunk step was configured with a commit interval of zero.
    #[error("Invalid chunk size {0}: must be at least 1")]
    InvalidChunkSize(usize),

    /// A step was started more times than its start limit allows.
    #[error("Step '{step}' has been started {count} times, limit is {limit}")]
    StartLimitExceeded {
        step: String,
        count: u32,
        limit: u32,
    },

    /// A completed job instance was launched again with the same parameters.
    #[error("Job instance already complete: {job} with parameters {parameters}")]
    JobInstanceAlreadyComplete { job: String, parameters: String },

    /// A job instance still has a running execution.
    #[error("Job execution {execution_id} of '{job}' is already running")]
    JobExecutionAlreadyRunning { job: String, execution_id: u64 },

    /// A non-restartable job was launched again after a failure or stop.
    #[error("Job '{job}' is not restartable")]
    JobRestartNotAllowed { job: String },

    /// The last execution of the instance was abandoned.
    #[error("Job instance of '{job}' was abandoned and cannot be restarted")]
    JobInstanceAbandoned { job: String },

    /// Job parameters did not pass validation.
    #[error("Invalid job parameters: {0}")]
    InvalidParameters(String),

    /// A node finished with an exit code no transition accepts.
    #[error("No transition from '{node}' matches exit code '{exit_code}'")]
    NoMatchingTransition { node: String, exit_code: String },

    /// A flow definition refers to a node that does not exist.
    #[error("Flow '{flow}' has no node named '{node}'")]
    UnknownFlowNode { flow: String, node: String },

    /// An execution could not be found in the repository.
    #[error("No execution with id {0}")]
    NoSuchExecution(u64),

    /// An execution is in a state that does not allow the operation.
    #[error("Execution {execution_id} is {status}, cannot {operation}")]
    IllegalState {
        execution_id: u64,
        status: BatchStatus,
        operation: &'static str,
    },

    /// A worker task panicked or was cancelled before reporting.
    #[error("Worker '{worker}' did not complete: {reason}")]
    WorkerAborted { worker: String, reason: String },

    /// Execution context could not be (de)serialized.
    #[error("Execution context serialization failed: {0}")]
    Context(String),
}

impl From<serde_json::Error> for BatchError {
    fn from(e: serde_json::Error) -> Self {
        BatchError::Context(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class_parent_chain() {
        let class = ErrorClass::new("db.transient.timeout");
        let chain: Vec<String> = class.ancestry().map(|c| c.as_str().to_string()).collect();
        assert_eq!(chain, vec!["db.transient.timeout", "db.transient", "db", ""]);
    }

    #[test]
    fn test_error_class_is_a() {
        let timeout = ErrorClass::new("db.transient.timeout");
        assert!(timeout.is_a(&ErrorClass::new("db.transient")));
        assert!(timeout.is_a(&ErrorClass::new("db")));
        assert!(timeout.is_a(&ErrorClass::root()));
        assert!(!timeout.is_a(&ErrorClass::new("db.trans")));
        assert!(!ErrorClass::new("db").is_a(&timeout));
    }

    #[test]
    fn test_error_class_depth() {
        assert_eq!(ErrorClass::root().depth(), 0);
        assert_eq!(ErrorClass::new("io").depth(), 1);
        assert_eq!(ErrorClass::new(".io.eof.").depth(), 2);
    }

    #[test]
    fn test_item_error_display() {
        let err = ItemError::new("validation", "bad record");
        assert_eq!(err.to_string(), "[validation] bad record");
        assert!(err.is_a(&ErrorClass::new("validation")));
    }

    #[test]
    fn test_item_error_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = ItemError::with_source("io", io);
        assert_eq!(err.message(), "disk gone");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_batch_error_from_item_error() {
        let err: BatchError = ItemError::new("fatal", "boom").into();
        assert!(matches!(err, BatchError::Item(_)));
        assert_eq!(err.to_string(), "Item failure: [fatal] boom");
    }
}
