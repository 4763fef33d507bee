//! INI parsing logic for converting `Ini` → `ConfigFile`.
//!
//! This module contains the `parse_ini()` function and its helpers.
//! It is the single place where INI key names are mapped to struct fields.

use ini::{Ini, Properties};
use std::path::PathBuf;
use std::str::FromStr;

use super::defaults::LOG_LEVELS;
use super::file::ConfigFileError;
use super::settings::ConfigFile;

/// Parse an `Ini` object into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [logging] section
    if let Some(section) = ini.section(Some("logging")) {
        if let Some(v) = section.get("file") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.file = expand_tilde(v);
            }
        }
        if let Some(v) = section.get("level") {
            let v = v.trim().to_lowercase();
            if !LOG_LEVELS.contains(&v.as_str()) {
                return Err(invalid(
                    "logging",
                    "level",
                    &v,
                    "must be one of: trace, debug, info, warn, error",
                ));
            }
            config.logging.level = v;
        }
    }

    // [step] section
    if let Some(section) = ini.section(Some("step")) {
        if let Some(v) = section.get("chunk_size") {
            config.step.chunk_size = parse_at_least_one(v, "step", "chunk_size")?;
        }
        if let Some(v) = section.get("start_limit") {
            config.step.start_limit = parse_number(v, "step", "start_limit")?;
        }
        if let Some(v) = section.get("allow_start_if_complete") {
            config.step.allow_start_if_complete = parse_bool(v);
        }
    }

    // [fault_tolerance] section
    if let Some(section) = ini.section(Some("fault_tolerance")) {
        parse_fault_tolerance(section, &mut config)?;
    }

    // [concurrency] section
    if let Some(section) = ini.section(Some("concurrency")) {
        if let Some(v) = section.get("worker_threads") {
            config.concurrency.worker_threads =
                parse_at_least_one(v, "concurrency", "worker_threads")?;
        }
        if let Some(v) = section.get("grid_size") {
            config.concurrency.grid_size = parse_at_least_one(v, "concurrency", "grid_size")?;
        }
        if let Some(v) = section.get("throttle_limit") {
            config.concurrency.throttle_limit =
                parse_at_least_one(v, "concurrency", "throttle_limit")?;
        }
    }

    // [job] section
    if let Some(section) = ini.section(Some("job")) {
        if let Some(v) = section.get("restartable") {
            config.job.restartable = parse_bool(v);
        }
    }

    Ok(config)
}

fn parse_fault_tolerance(
    section: &Properties,
    config: &mut ConfigFile,
) -> Result<(), ConfigFileError> {
    const SECTION: &str = "fault_tolerance";
    let ft = &mut config.fault_tolerance;

    if let Some(v) = section.get("skippable") {
        ft.skippable = parse_list(v);
    }
    if let Some(v) = section.get("skip_limit") {
        ft.skip_limit = parse_number(v, SECTION, "skip_limit")?;
    }
    if let Some(v) = section.get("retryable") {
        ft.retryable = parse_list(v);
    }
    if let Some(v) = section.get("retry_limit") {
        ft.retry_limit = parse_at_least_one(v, SECTION, "retry_limit")?;
    }
    if let Some(v) = section.get("retry_mode") {
        ft.retry_mode = v
            .trim()
            .parse()
            .map_err(|_| invalid(SECTION, "retry_mode", v, "must be 'chunk' or 'item'"))?;
    }
    if let Some(v) = section.get("backoff") {
        ft.backoff = v.parse().map_err(|_| {
            invalid(
                SECTION,
                "backoff",
                v,
                "must be one of: none, fixed, exponential",
            )
        })?;
    }
    if let Some(v) = section.get("backoff_initial_ms") {
        ft.backoff_initial_ms = parse_number(v, SECTION, "backoff_initial_ms")?;
    }
    if let Some(v) = section.get("backoff_multiplier") {
        let multiplier: f64 = v.trim().parse().map_err(|_| {
            invalid(SECTION, "backoff_multiplier", v, "must be a number")
        })?;
        if multiplier < 1.0 {
            return Err(invalid(
                SECTION,
                "backoff_multiplier",
                v,
                "must be at least 1.0",
            ));
        }
        ft.backoff_multiplier = multiplier;
    }
    if let Some(v) = section.get("backoff_max_ms") {
        ft.backoff_max_ms = parse_number(v, SECTION, "backoff_max_ms")?;
    }
    Ok(())
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a non-negative integer.
fn parse_number<T: FromStr>(value: &str, section: &str, key: &str) -> Result<T, ConfigFileError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, "must be a non-negative integer"))
}

/// Parse an integer that must be at least 1.
fn parse_at_least_one<T>(value: &str, section: &str, key: &str) -> Result<T, ConfigFileError>
where
    T: FromStr + PartialOrd + From<u8>,
{
    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, "must be a positive integer"))?;
    if parsed < T::from(1) {
        return Err(invalid(section, key, value, "must be at least 1"));
    }
    Ok(parsed)
}

/// Parse a comma-separated list, dropping empty entries.
pub(super) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a boolean value from a string.
pub(super) fn parse_bool(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v == "true" || v == "1" || v == "yes" || v == "on"
}

/// Expand ~ to home directory in paths.
pub(super) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::fault::RetryMode;
    use crate::config::defaults::*;
    use crate::config::settings::BackoffKind;
    use tempfile::TempDir;

    fn load(content: &str) -> Result<ConfigFile, ConfigFileError> {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.ini");
        std::fs::write(&config_path, content).unwrap();
        ConfigFile::load_from(&config_path)
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = load("").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_step_section() {
        let config = load(
            r#"
[step]
chunk_size = 25
start_limit = 3
allow_start_if_complete = yes
"#,
        )
        .unwrap();

        assert_eq!(config.step.chunk_size, 25);
        assert_eq!(config.step.start_limit, 3);
        assert!(config.step.allow_start_if_complete);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let err = load("[step]\nchunk_size = 0\n").unwrap_err();
        match err {
            ConfigFileError::InvalidValue {
                section,
                key,
                value,
                ..
            } => {
                assert_eq!(section, "step");
                assert_eq!(key, "chunk_size");
                assert_eq!(value, "0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fault_tolerance_section() {
        let config = load(
            r#"
[fault_tolerance]
skippable = validation, db.constraint
skip_limit = 10
retryable = io.transient
retry_limit = 5
retry_mode = item
backoff = exponential
backoff_initial_ms = 50
backoff_multiplier = 3
backoff_max_ms = 2000
"#,
        )
        .unwrap();

        let ft = &config.fault_tolerance;
        assert_eq!(ft.skippable, vec!["validation", "db.constraint"]);
        assert_eq!(ft.skip_limit, 10);
        assert_eq!(ft.retryable, vec!["io.transient"]);
        assert_eq!(ft.retry_limit, 5);
        assert_eq!(ft.retry_mode, RetryMode::Item);
        assert_eq!(ft.backoff, BackoffKind::Exponential);
        assert_eq!(ft.backoff_initial_ms, 50);
        assert_eq!(ft.backoff_multiplier, 3.0);
        assert_eq!(ft.backoff_max_ms, 2000);
    }

    #[test]
    fn test_invalid_retry_mode_rejected() {
        let err = load("[fault_tolerance]\nretry_mode = sometimes\n").unwrap_err();
        assert!(matches!(err, ConfigFileError::InvalidValue { ref key, .. } if key == "retry_mode"));
    }

    #[test]
    fn test_invalid_backoff_multiplier_rejected() {
        let err = load("[fault_tolerance]\nbackoff_multiplier = 0.5\n").unwrap_err();
        assert!(
            matches!(err, ConfigFileError::InvalidValue { ref key, .. } if key == "backoff_multiplier")
        );
    }

    #[test]
    fn test_concurrency_section() {
        let config = load(
            r#"
[concurrency]
worker_threads = 6
grid_size = 8
throttle_limit = 2
"#,
        )
        .unwrap();

        assert_eq!(config.concurrency.worker_threads, 6);
        assert_eq!(config.concurrency.grid_size, 8);
        assert_eq!(config.concurrency.throttle_limit, 2);
    }

    #[test]
    fn test_zero_throttle_limit_rejected() {
        let err = load("[concurrency]\nthrottle_limit = 0\n").unwrap_err();
        assert!(matches!(err, ConfigFileError::InvalidValue { ref key, .. } if key == "throttle_limit"));
    }

    #[test]
    fn test_logging_and_job_sections() {
        let config = load(
            r#"
[logging]
file = /var/log/batch.log
level = DEBUG

[job]
restartable = false
"#,
        )
        .unwrap();

        assert_eq!(config.logging.file, PathBuf::from("/var/log/batch.log"));
        assert_eq!(config.logging.level, "debug");
        assert!(!config.job.restartable);
        assert_eq!(config.step.chunk_size, crate::batch::chunk::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.fault_tolerance.backoff_max_ms, DEFAULT_BACKOFF_MAX_MS);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let err = load("[logging]\nlevel = loud\n").unwrap_err();
        assert!(matches!(err, ConfigFileError::InvalidValue { ref section, .. } if section == "logging"));
    }

    #[test]
    fn test_parse_list_trims_and_drops_empty() {
        assert_eq!(parse_list(" a , ,b.c,"), vec!["a", "b.c"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_parse_bool_variants() {
        assert!(parse_bool("true"));
        assert!(parse_bool(" On "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("nope"));
    }
}
