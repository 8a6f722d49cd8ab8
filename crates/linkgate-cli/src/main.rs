//! linkgate - post-authentication consistency gate
//!
//! Runs the gate once against SQLite-backed linkage stores and prints the
//! decision, or validates and prints configuration.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// linkgate - post-authentication consistency gate
#[derive(Parser, Debug)]
#[command(name = "linkgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the gate configuration file
    #[arg(short, long, default_value = "linkgate.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gate for one authenticated principal
    Check(commands::check::CheckArgs),

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validate the configuration file
    Validate,

    /// Print an example configuration with every default filled in
    PrintDefault,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Check(args) => {
            // Exit codes: 0=allow, 2=block_recover, 3=block_unavailable.
            let exit_code = commands::check::run(&cli.config, &args)?;
            std::process::exit(i32::from(exit_code));
        },
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::Validate => commands::config::validate(&cli.config),
            ConfigCommands::PrintDefault => commands::config::print_default(),
        },
    }
}
