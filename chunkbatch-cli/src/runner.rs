//! CLI runner for common setup and operations.
//!
//! Encapsulates configuration loading, logging initialization and runtime
//! creation to reduce duplication across command handlers.

use std::path::PathBuf;

use chunkbatch::config::ConfigFile;
use chunkbatch::logging::{default_log_file, init_logging_full, LoggingGuard};
use tokio::runtime::Runtime;
use tracing::info;

use crate::error::CliError;

/// Runner that manages CLI lifecycle and common operations.
pub struct CliRunner {
    /// Logging guard - keeps logging active while runner exists
    #[allow(dead_code)]
    logging_guard: LoggingGuard,
    /// Loaded configuration file
    config: ConfigFile,
}

impl CliRunner {
    /// Create a new CLI runner, loading config and initializing logging.
    ///
    /// Log events always go to the configured log file. In debug mode they
    /// are mirrored to stdout as well.
    ///
    /// # Arguments
    ///
    /// * `debug_mode` - When true, enables debug-level logging regardless of RUST_LOG
    pub fn with_debug(debug_mode: bool) -> Result<Self, CliError> {
        // Load config file (or use defaults if not present)
        let config = ConfigFile::load()?;

        let log_path = &config.logging.file;
        let log_dir = log_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let log_file = log_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| default_log_file().to_string());

        let logging_guard = init_logging_full(
            &log_dir,
            &log_file,
            debug_mode,
            &config.logging.level,
            debug_mode,
        )
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;

        Ok(Self {
            logging_guard,
            config,
        })
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Log startup information for a command.
    pub fn log_startup(&self, command: &str) {
        info!("chunkbatch v{}", chunkbatch::VERSION);
        info!("chunkbatch CLI: {} command", command);
    }

    /// Build the multi-threaded runtime jobs run on.
    ///
    /// Sized from `[concurrency] worker_threads` so multi-threaded steps get
    /// real parallelism.
    pub fn runtime(&self) -> Result<Runtime, CliError> {
        let workers = self.config.concurrency.worker_threads.max(1);
        info!(worker_threads = workers, "Starting runtime");

        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("chunkbatch-worker")
            .enable_all()
            .build()
            .map_err(CliError::Runtime)
    }
}
