//! Command-line entry point: `tapeline run <config-path> <mode>`.
//!
//! Exit codes: 0 success, 1 configuration error, 2 runtime error, 3 broker
//! disconnect. A SIGINT mid-run terminates with the shell's conventional
//! 130.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

use tl_core::{Engine, RiskRegistry, StrategyRegistry};
use tl_types::{BrokerError, Mode, RunConfig, TlError};

#[derive(Parser)]
#[command(name = "tapeline", version, about = "Event-driven trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a configured backtest or live session.
    Run {
        /// Path to the TOML run configuration.
        config: PathBuf,
        /// Execution mode: `backtest` or `live`.
        mode: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { config, mode } => run(&config, &mode),
    };
    std::process::exit(code);
}

fn run(config_path: &PathBuf, mode_arg: &str) -> i32 {
    let mode = match Mode::from_str(mode_arg) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let config = match RunConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let engine = match Engine::new(config, mode) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let strategies = StrategyRegistry::with_builtins();
    let risks = RiskRegistry::with_builtins();

    match engine.run(&strategies, &risks) {
        Ok(outcome) => {
            if let Some(reason) = outcome.quarantined {
                eprintln!("strategy quarantined: {reason}");
            }
            println!("session artifact: {}", outcome.artifact_path);
            0
        }
        Err(e @ (TlError::Config(_) | TlError::Plugin(_))) => {
            eprintln!("{e}");
            1
        }
        Err(e @ TlError::Broker(BrokerError::Disconnected { .. })) => {
            eprintln!("{e}");
            3
        }
        Err(e) => {
            eprintln!("{e}");
            2
        }
    }
}
