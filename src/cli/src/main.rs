//! Ripple CLI - run event store scenarios and benchmarks in-process.
//!
//! Provides scenario, bench, and configuration commands.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{bench, config, scenario};
use output::OutputFormat;
use ripple_core::telemetry::{init_telemetry, TelemetryConfig};

/// Ripple - in-process event store and demux aggregator
#[derive(Parser)]
#[command(
    name = "ripple",
    version = "0.1.0",
    about = "Ripple - in-process event store and demux aggregator",
    long_about = "Runs Ripple event store scenarios and publish benchmarks, and manages configuration.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "RIPPLE_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in aggregation or history scenario
    Scenario(scenario::ScenarioArgs),

    /// Measure publish throughput
    Bench(bench::BenchArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::status(output::Status::Failed, &format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let format = cli.output;
    let settings = config::load(cli.config.as_deref())?;

    let command = match cli.command {
        Commands::Config(cmd) => return config::execute(cmd, &settings, format).await,
        command => command,
    };

    let telemetry = init_telemetry(&TelemetryConfig {
        logging: settings.logging.clone(),
        metrics: settings.metrics.clone(),
    })?;

    let result = match command {
        Commands::Scenario(args) => scenario::execute(args, settings, format).await,
        Commands::Bench(args) => bench::execute(args, settings, &telemetry.metrics, format).await,
        Commands::Config(_) => Ok(()),
    };
    telemetry.shutdown();
    result
}
