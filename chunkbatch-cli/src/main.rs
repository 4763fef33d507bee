//! chunkbatch CLI - Command-line interface
//!
//! This binary launches batch jobs built on the chunkbatch library and
//! manages its configuration file.

mod commands;
mod error;
mod runner;

use clap::{Parser, Subcommand};

use commands::config::ConfigCommands;
use commands::run::RunArgs;

#[derive(Parser)]
#[command(name = "chunkbatch")]
#[command(version = chunkbatch::VERSION)]
#[command(about = "Chunk-oriented batch processing with skip, retry and restart", long_about = None)]
struct Cli {
    /// Enable debug logging and mirror log output to stdout
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the record processing job
    Run(RunArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args, cli.debug),
        Commands::Config(command) => commands::config::run(command),
    };

    if let Err(e) = result {
        e.exit();
    }
}
