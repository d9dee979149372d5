//! # fedarb CLI entry point
//!
//! Parses command-line arguments, installs the tracing subscriber, loads
//! the configuration, and dispatches to subcommand handlers.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fedarb_cli::config::{run_config, ConfigArgs};
use fedarb_cli::load_config;
use fedarb_cli::simulate::{run_simulate, SimulateArgs};

/// Federation arbitration authority tools.
///
/// Inspect the effective arbitration configuration and replay arbitration
/// scenarios on a simulated clock.
#[derive(Parser, Debug)]
#[command(name = "fedarb", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv).
    /// Ignored when RUST_LOG is set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Path to the arbitration configuration (YAML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective configuration.
    Config(ConfigArgs),

    /// Replay a scenario against an authority on a simulated clock.
    Simulate(SimulateArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let result = load_config(cli.config.as_deref()).and_then(|config| match &cli.command {
        Commands::Config(args) => run_config(args, &config),
        Commands::Simulate(args) => run_simulate(args, config),
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
