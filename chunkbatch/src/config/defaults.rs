//! Default values and constants for all configuration settings.
//!
//! Contains all `DEFAULT_*` constants and the `ConfigFile::default()`
//! implementation.

use super::file::config_directory;
use super::settings::*;
use crate::batch::chunk::DEFAULT_CHUNK_SIZE;
use crate::batch::fault::{RetryMode, DEFAULT_BACKOFF_MAX, DEFAULT_RETRY_LIMIT};
use crate::batch::partition::{num_cpus, DEFAULT_GRID_SIZE, DEFAULT_THROTTLE_LIMIT};
use crate::batch::step::DEFAULT_START_LIMIT;

// =============================================================================
// Logging
// =============================================================================

/// Default log file name inside the config directory.
pub const DEFAULT_LOG_FILE_NAME: &str = "chunkbatch.log";

/// Default level filter.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Accepted level filters.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// =============================================================================
// Fault tolerance
// =============================================================================

/// Default skip limit. Nothing is skippable until classes are configured.
pub const DEFAULT_SKIP_LIMIT: u64 = 0;

/// Default first back-off delay in milliseconds.
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;

/// Default growth factor of exponential back-off.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default back-off cap in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = DEFAULT_BACKOFF_MAX.as_millis() as u64;

// =============================================================================
// ConfigFile defaults
// =============================================================================

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                file: config_directory().join(DEFAULT_LOG_FILE_NAME),
                level: DEFAULT_LOG_LEVEL.to_string(),
            },
            step: StepSettings {
                chunk_size: DEFAULT_CHUNK_SIZE,
                start_limit: DEFAULT_START_LIMIT,
                allow_start_if_complete: false,
            },
            fault_tolerance: FaultToleranceSettings {
                skippable: Vec::new(),
                skip_limit: DEFAULT_SKIP_LIMIT,
                retryable: Vec::new(),
                retry_limit: DEFAULT_RETRY_LIMIT,
                retry_mode: RetryMode::Chunk,
                backoff: BackoffKind::None,
                backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
                backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
                backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            },
            concurrency: ConcurrencySettings {
                worker_threads: num_cpus(),
                grid_size: DEFAULT_GRID_SIZE,
                throttle_limit: DEFAULT_THROTTLE_LIMIT,
            },
            job: JobSettings { restartable: true },
        }
    }
}
