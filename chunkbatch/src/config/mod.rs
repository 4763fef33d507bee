//! Configuration for the batch engine and CLI.
//!
//! User settings live in `~/.chunkbatch/config.ini`. [`ConfigFile`] loads
//! them over built-in defaults; each section converts into the engine's own
//! configuration type:
//!
//! | Section             | Engine type                                   |
//! |---------------------|-----------------------------------------------|
//! | `[step]`            | [`ChunkConfig`](crate::batch::ChunkConfig), [`StepOptions`](crate::batch::StepOptions) |
//! | `[fault_tolerance]` | [`FaultTolerance`](crate::batch::FaultTolerance) |
//! | `[concurrency]`     | [`ConcurrencyConfig`](crate::batch::ConcurrencyConfig) |
//!
//! # Example
//!
//! ```ignore
//! use chunkbatch::batch::{ChunkConfig, FaultTolerance};
//! use chunkbatch::config::ConfigFile;
//!
//! let config = ConfigFile::load()?;
//! let chunk = ChunkConfig::from(&config.step);
//! let fault = FaultTolerance::from(&config.fault_tolerance);
//! ```

mod defaults;
mod file;
mod parser;
mod settings;
mod writer;

pub use defaults::{
    DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_MULTIPLIER,
    DEFAULT_LOG_FILE_NAME, DEFAULT_LOG_LEVEL, DEFAULT_SKIP_LIMIT, LOG_LEVELS,
};
pub use file::{config_directory, config_file_path, ConfigFileError};
pub use settings::{
    BackoffKind, ConcurrencySettings, ConfigFile, FaultToleranceSettings, JobSettings,
    LoggingSettings, StepSettings,
};
