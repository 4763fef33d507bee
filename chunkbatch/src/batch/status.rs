//! Lifecycle and outcome status for job and step executions.
//!
//! Two independent notions of "how did it go" are tracked for every execution:
//!
//! - [`BatchStatus`] is the lifecycle status owned by the engine
//!   (`STARTING → STARTED → COMPLETED | FAILED | STOPPED | ABANDONED`).
//! - [`ExitStatus`] is a semantic label that listeners and deciders may freely
//!   override. Flow transitions are matched against its code.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Batch Status
// =============================================================================

/// Lifecycle status of a job or step execution.
///
/// Variants are declared in ascending severity so that `Ord` gives the
/// "worst wins" ordering used when aggregating several executions.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Finished successfully.
    Completed,
    /// Execution record created, work not started yet.
    Starting,
    /// Work in progress.
    Started,
    /// A stop was requested and is being honoured at the next chunk boundary.
    Stopping,
    /// Stopped at a chunk boundary; restartable.
    Stopped,
    /// Finished with a fatal error; restartable.
    Failed,
    /// Stopped or failed and explicitly given up on; not restartable.
    Abandoned,
    /// State could not be determined.
    Unknown,
}

impl BatchStatus {
    /// Returns true while the execution is still doing work.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Stopping)
    }

    /// Returns true for FAILED and STOPPED (and anything worse).
    pub fn is_unsuccessful(&self) -> bool {
        *self >= Self::Stopped
    }

    /// Returns true once the execution will not change status on its own.
    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    /// Combines two statuses, keeping the more severe one.
    ///
    /// A running status never downgrades a terminal status to running:
    /// `COMPLETED.upgrade_to(STARTED)` is `STARTED`, but
    /// `FAILED.upgrade_to(STARTED)` stays `FAILED`.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        self.max(other)
    }

    /// Returns the upper-case name used in logs and persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Abandoned => "ABANDONED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Exit Status
// =============================================================================

/// Semantic completion label used for flow routing.
///
/// The well-known codes have constructors; any other string is a custom code
/// (for example `"PASS"` set by an after-step listener). Codes are compared
/// case-sensitively by transition patterns.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExitStatus {
    code: String,
    description: String,
}

impl ExitStatus {
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";

    /// Creates an exit status with a custom code and no description.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: String::new(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    /// Returns the exit code matched by flow transitions.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the free-form description, possibly empty.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns a copy with the given description appended.
    pub fn with_description(mut self, description: impl AsRef<str>) -> Self {
        let description = description.as_ref();
        if description.is_empty() {
            return self;
        }
        if self.description.is_empty() {
            self.description = description.to_string();
        } else {
            self.description = format!("{}; {}", self.description, description);
        }
        self
    }

    /// Severity rank of a code. Custom codes rank between EXECUTING and FAILED.
    fn severity(code: &str) -> u8 {
        match code {
            Self::EXECUTING => 1,
            Self::COMPLETED => 2,
            Self::NOOP => 3,
            Self::STOPPED => 4,
            Self::FAILED => 6,
            Self::UNKNOWN => 7,
            _ => 5,
        }
    }

    /// Combines two exit statuses, keeping the more severe code and joining
    /// the descriptions.
    pub fn and(self, other: ExitStatus) -> ExitStatus {
        let (winner, loser) = if Self::severity(&other.code) > Self::severity(&self.code) {
            (other, self)
        } else {
            (self, other)
        };
        let description = loser.description.clone();
        winner.with_description(description)
    }

    /// Maps a terminal lifecycle status onto its default exit status.
    pub fn from_batch_status(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed => Self::completed(),
            BatchStatus::Stopped | BatchStatus::Stopping => Self::stopped(),
            BatchStatus::Failed | BatchStatus::Abandoned => Self::failed(),
            BatchStatus::Starting | BatchStatus::Started => Self::executing(),
            BatchStatus::Unknown => Self::unknown(),
        }
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.description)
        }
    }
}

impl From<&str> for ExitStatus {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_running() {
        assert!(BatchStatus::Starting.is_running());
        assert!(BatchStatus::Started.is_running());
        assert!(BatchStatus::Stopping.is_running());
        assert!(!BatchStatus::Completed.is_running());
        assert!(BatchStatus::Failed.is_terminal());
    }

    #[test]
    fn test_batch_status_upgrade_keeps_worst() {
        assert_eq!(
            BatchStatus::Completed.upgrade_to(BatchStatus::Failed),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::Failed.upgrade_to(BatchStatus::Completed),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::Stopped.upgrade_to(BatchStatus::Failed),
            BatchStatus::Failed
        );
    }

    #[test]
    fn test_batch_status_unsuccessful() {
        assert!(BatchStatus::Failed.is_unsuccessful());
        assert!(BatchStatus::Stopped.is_unsuccessful());
        assert!(!BatchStatus::Completed.is_unsuccessful());
    }

    #[test]
    fn test_exit_status_and_keeps_more_severe() {
        let combined = ExitStatus::completed().and(ExitStatus::failed());
        assert_eq!(combined.code(), ExitStatus::FAILED);

        let combined = ExitStatus::failed().and(ExitStatus::completed());
        assert_eq!(combined.code(), ExitStatus::FAILED);
    }

    #[test]
    fn test_exit_status_custom_code_outranks_completed() {
        let combined = ExitStatus::completed().and(ExitStatus::new("PASS"));
        assert_eq!(combined.code(), "PASS");
    }

    #[test]
    fn test_exit_status_description_joined() {
        let status = ExitStatus::failed()
            .with_description("first")
            .with_description("second");
        assert_eq!(status.description(), "first; second");
        assert_eq!(status.to_string(), "FAILED (first; second)");
    }

    #[test]
    fn test_exit_status_from_batch_status() {
        assert_eq!(
            ExitStatus::from_batch_status(BatchStatus::Completed).code(),
            "COMPLETED"
        );
        assert_eq!(
            ExitStatus::from_batch_status(BatchStatus::Stopped).code(),
            "STOPPED"
        );
        assert_eq!(
            ExitStatus::from_batch_status(BatchStatus::Failed).code(),
            "FAILED"
        );
    }
}
