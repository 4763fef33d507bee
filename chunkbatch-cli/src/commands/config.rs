//! Configuration management CLI commands.
//!
//! Provides `config path`, `config show` and `config init` for inspecting
//! and creating `~/.chunkbatch/config.ini`.

use clap::Subcommand;
use chunkbatch::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// Show the effective configuration (file values over defaults)
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Path => run_path(),
        ConfigCommands::Show => run_show(),
        ConfigCommands::Init { force } => run_init(force),
    }
}

/// Show the configuration file path.
fn run_path() -> Result<(), CliError> {
    println!("{}", config_file_path().display());
    Ok(())
}

/// Show the effective configuration.
fn run_show() -> Result<(), CliError> {
    let path = config_file_path();
    let config = ConfigFile::load()?;

    println!("Configuration Settings");
    println!("======================");
    if path.exists() {
        println!("Source: {}", path.display());
    } else {
        println!("Source: built-in defaults ({} not found)", path.display());
    }
    println!();

    for (section, entries) in describe(&config) {
        println!("[{}]", section);
        for (key, value) in entries {
            if value.is_empty() {
                println!("  {} = (not set)", key);
            } else {
                println!("  {} = {}", key, value);
            }
        }
        println!();
    }

    Ok(())
}

/// Create the configuration file with defaults.
fn run_init(force: bool) -> Result<(), CliError> {
    let path = config_file_path();

    if path.exists() && !force {
        println!("Configuration already exists at {}", path.display());
        println!("Use --force to overwrite it with defaults.");
        return Ok(());
    }

    ConfigFile::default().save_to(&path)?;
    println!("Wrote default configuration to {}", path.display());

    Ok(())
}

/// Flattens the configuration into printable sections.
fn describe(config: &ConfigFile) -> Vec<(&'static str, Vec<(&'static str, String)>)> {
    let ft = &config.fault_tolerance;
    vec![
        (
            "logging",
            vec![
                ("file", config.logging.file.display().to_string()),
                ("level", config.logging.level.clone()),
            ],
        ),
        (
            "step",
            vec![
                ("chunk_size", config.step.chunk_size.to_string()),
                ("start_limit", config.step.start_limit.to_string()),
                (
                    "allow_start_if_complete",
                    config.step.allow_start_if_complete.to_string(),
                ),
            ],
        ),
        (
            "fault_tolerance",
            vec![
                ("skippable", ft.skippable.join(", ")),
                ("skip_limit", ft.skip_limit.to_string()),
                ("retryable", ft.retryable.join(", ")),
                ("retry_limit", ft.retry_limit.to_string()),
                ("retry_mode", ft.retry_mode.as_str().to_string()),
                ("backoff", ft.backoff.as_str().to_string()),
                ("backoff_initial_ms", ft.backoff_initial_ms.to_string()),
                ("backoff_multiplier", ft.backoff_multiplier.to_string()),
                ("backoff_max_ms", ft.backoff_max_ms.to_string()),
            ],
        ),
        (
            "concurrency",
            vec![
                ("worker_threads", config.concurrency.worker_threads.to_string()),
                ("grid_size", config.concurrency.grid_size.to_string()),
                ("throttle_limit", config.concurrency.throttle_limit.to_string()),
            ],
        ),
        (
            "job",
            vec![("restartable", config.job.restartable.to_string())],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_covers_every_section() {
        let sections: Vec<_> = describe(&ConfigFile::default())
            .into_iter()
            .map(|(section, _)| section)
            .collect();
        assert_eq!(
            sections,
            vec!["logging", "step", "fault_tolerance", "concurrency", "job"]
        );
    }

    #[test]
    fn test_describe_leaves_empty_lists_blank() {
        let described = describe(&ConfigFile::default());
        let (_, fault) = &described[2];
        let skippable = fault.iter().find(|(key, _)| *key == "skippable").unwrap();
        assert!(skippable.1.is_empty());
    }
}
