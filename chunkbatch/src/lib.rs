//! chunkbatch - chunk-oriented batch processing
//!
//! This library runs batch jobs that move large item sequences through a
//! read → process → write pipeline in bounded transactional chunks, with
//! skip/retry fault tolerance, conditional step flows, multi-threaded and
//! partitioned steps, and restart from the last committed chunk.
//!
//! # High-Level API
//!
//! The [`batch`] module holds the engine; [`config`] loads user settings and
//! [`logging`] installs the tracing subscriber:
//!
//! ```ignore
//! use chunkbatch::batch::{FaultTolerance, InMemoryJobRepository, Job, JobLauncher};
//! use chunkbatch::config::ConfigFile;
//!
//! let config = ConfigFile::load()?;
//! let fault = FaultTolerance::from(&config.fault_tolerance);
//!
//! let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));
//! let execution = launcher.run(&job, params).await?;
//! println!("{} -> {}", execution.job_name(), execution.status);
//! ```

pub mod batch;
pub mod config;
pub mod logging;

/// Version of the chunkbatch library and CLI.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
