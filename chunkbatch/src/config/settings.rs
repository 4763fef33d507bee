//! Settings structs for all configuration sections.
//!
//! Each struct represents one `[section]` of the INI config file.
//! These are pure data types with no parsing or serialization logic.

use std::path::PathBuf;

use crate::batch::fault::RetryMode;

/// Complete application configuration loaded from config.ini.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    /// Logging settings
    pub logging: LoggingSettings,
    /// Chunk step settings
    pub step: StepSettings,
    /// Skip, retry and back-off settings
    pub fault_tolerance: FaultToleranceSettings,
    /// Worker and partition settings
    pub concurrency: ConcurrencySettings,
    /// Job launch settings
    pub job: JobSettings,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Log file path
    pub file: PathBuf,
    /// Default level filter when RUST_LOG is unset
    pub level: String,
}

/// Chunk step configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSettings {
    /// Items per chunk transaction. Must be at least 1.
    pub chunk_size: usize,
    /// Maximum executions of a step per job instance.
    pub start_limit: u32,
    /// Re-run completed steps when an instance restarts.
    pub allow_start_if_complete: bool,
}

/// Back-off strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    #[default]
    None,
    Fixed,
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        }
    }
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff '{}'", other)),
        }
    }
}

/// Fault-tolerance configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultToleranceSettings {
    /// Error classes whose items may be skipped (and their descendants).
    pub skippable: Vec<String>,
    /// Step-wide skip limit.
    pub skip_limit: u64,
    /// Error classes worth retrying (and their descendants).
    pub retryable: Vec<String>,
    /// Maximum attempts per item, first attempt included.
    pub retry_limit: u32,
    /// Replay the whole chunk or only the failing item.
    pub retry_mode: RetryMode,
    pub backoff: BackoffKind,
    /// Fixed delay, or first delay of an exponential back-off.
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    /// Cap for exponential back-off.
    pub backoff_max_ms: u64,
}

/// Concurrency configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencySettings {
    /// Chunk workers of a multi-threaded step.
    /// Default: number of CPU cores.
    pub worker_threads: usize,
    /// Partitions requested from a partitioner.
    pub grid_size: usize,
    /// Partitions running at once.
    pub throttle_limit: usize,
}

/// Job configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    /// Whether a failed or stopped instance may be launched again.
    pub restartable: bool,
}
