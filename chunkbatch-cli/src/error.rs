//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::process;

use chunkbatch::batch::{BatchError, BatchStatus};
use chunkbatch::config::ConfigFileError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration error
    Config(String),
    /// Failed to build the async runtime
    Runtime(std::io::Error),
    /// The engine rejected or aborted a launch
    Batch(BatchError),
    /// The job ran but did not complete
    JobFailed {
        job: String,
        status: BatchStatus,
        exit_code: String,
    },
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Batch(BatchError::JobInstanceAlreadyComplete { .. }) => {
                eprintln!();
                eprintln!("Pass a different --run-id to start a new job instance.");
            }
            CliError::JobFailed {
                status: BatchStatus::Failed,
                ..
            } => {
                eprintln!();
                eprintln!("Common causes:");
                eprintln!("  1. Error class not listed under [fault_tolerance] skippable or retryable");
                eprintln!("  2. skip_limit or retry_limit too low for the input");
                eprintln!("See the log file for the failing item.");
            }
            _ => {}
        }

        process::exit(self.exit_code())
    }

    /// Process exit code: 2 for a stopped job, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::JobFailed {
                status: BatchStatus::Stopped,
                ..
            } => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            CliError::Batch(e) => write!(f, "Batch error: {}", e),
            CliError::JobFailed {
                job,
                status,
                exit_code,
            } => write!(f, "Job '{}' finished {} (exit code {})", job, status, exit_code),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Runtime(e) => Some(e),
            CliError::Batch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<BatchError> for CliError {
    fn from(e: BatchError) -> Self {
        CliError::Batch(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_job_exits_with_two() {
        let err = CliError::JobFailed {
            job: "records".into(),
            status: BatchStatus::Stopped,
            exit_code: "STOPPED".into(),
        };
        assert_eq!(err.exit_code(), 2);
        assert_eq!(
            err.to_string(),
            "Job 'records' finished STOPPED (exit code STOPPED)"
        );
    }

    #[test]
    fn test_other_errors_exit_with_one() {
        assert_eq!(CliError::Config("bad".into()).exit_code(), 1);
        let err = CliError::from(BatchError::NoSuchExecution(7));
        assert!(err.to_string().starts_with("Batch error:"));
        assert_eq!(err.exit_code(), 1);
    }
}
