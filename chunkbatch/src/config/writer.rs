//! INI serialization logic for converting `ConfigFile` → INI string.
//!
//! This module contains the `to_config_string()` function that produces
//! the commented INI representation written to `config.ini`.

use std::path::Path;

use super::settings::ConfigFile;

/// Convert a `ConfigFile` to a commented INI string for saving.
pub(super) fn to_config_string(config: &ConfigFile) -> String {
    let ft = &config.fault_tolerance;

    format!(
        r#"[logging]
; Log file path (default: ~/.chunkbatch/chunkbatch.log)
file = {}
; Level filter when RUST_LOG is not set: trace, debug, info, warn, error
level = {}

[step]
; Items read per chunk transaction (default: 10, minimum 1)
chunk_size = {}
; Maximum executions of one step per job instance
start_limit = {}
; Re-run steps that already completed when an instance restarts
allow_start_if_complete = {}

[fault_tolerance]
; Comma-separated error classes whose items may be skipped.
; A class covers its descendants: 'db' covers 'db.constraint'.
skippable = {}
; Maximum skipped items per step before the step fails
skip_limit = {}
; Comma-separated error classes worth retrying
retryable = {}
; Maximum attempts per item, first attempt included (default: 3)
retry_limit = {}
; How a retry is replayed:
;   chunk - roll back and replay the whole chunk
;   item  - retry only the failing operation
retry_mode = {}
; Delay between attempts: none, fixed or exponential
backoff = {}
backoff_initial_ms = {}
backoff_multiplier = {}
backoff_max_ms = {}

[concurrency]
; Chunk workers of a multi-threaded step (default: number of CPU cores)
worker_threads = {}
; Partitions requested from a partitioner (default: 4)
grid_size = {}
; Partitions running at once (default: 4)
throttle_limit = {}

[job]
; Allow a failed or stopped job instance to be launched again
restartable = {}
"#,
        path_to_string(&config.logging.file),
        config.logging.level,
        config.step.chunk_size,
        config.step.start_limit,
        config.step.allow_start_if_complete,
        ft.skippable.join(", "),
        ft.skip_limit,
        ft.retryable.join(", "),
        ft.retry_limit,
        ft.retry_mode.as_str(),
        ft.backoff.as_str(),
        ft.backoff_initial_ms,
        ft.backoff_multiplier,
        ft.backoff_max_ms,
        config.concurrency.worker_threads,
        config.concurrency.grid_size,
        config.concurrency.throttle_limit,
        config.job.restartable,
    )
}

fn path_to_string(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            return format!("~/{}", stripped.display());
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::super::settings::{BackoffKind, ConfigFile};
    use crate::batch::fault::RetryMode;
    use tempfile::TempDir;

    #[test]
    fn test_saved_defaults_load_back_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.ini");

        let config = ConfigFile::default();
        config.save_to(&config_path).unwrap();
        let loaded = ConfigFile::load_from(&config_path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_saved_custom_values_survive() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.step.chunk_size = 7;
        config.fault_tolerance.skippable = vec!["validation".into(), "db.constraint".into()];
        config.fault_tolerance.retry_mode = RetryMode::Item;
        config.fault_tolerance.backoff = BackoffKind::Fixed;
        config.concurrency.throttle_limit = 3;
        config.job.restartable = false;
        config.save_to(&config_path).unwrap();

        let loaded = ConfigFile::load_from(&config_path).unwrap();
        assert_eq!(loaded.step.chunk_size, 7);
        assert_eq!(
            loaded.fault_tolerance.skippable,
            vec!["validation", "db.constraint"]
        );
        assert_eq!(loaded.fault_tolerance.retry_mode, RetryMode::Item);
        assert_eq!(loaded.fault_tolerance.backoff, BackoffKind::Fixed);
        assert_eq!(loaded.concurrency.throttle_limit, 3);
        assert!(!loaded.job.restartable);
    }

    #[test]
    fn test_config_string_is_commented() {
        let content = super::to_config_string(&ConfigFile::default());
        assert!(content.contains("[fault_tolerance]"));
        assert!(content.contains("; Items read per chunk transaction"));
        assert!(content.contains("retry_mode = chunk"));
    }
}
