use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod database;
mod error;
mod extractor;
mod generator;
mod judge;
mod models;
mod output;
mod runner;
mod storage;

use crate::config::Settings;
use crate::output::OutputFormat;
use crate::runner::Runner;

/// Schwerhörige-Hexe benchmark - generate German puns with candidate models
/// and score them with a judge model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the benchmark: generation phase, then judging phase
    Run {
        /// Candidate models to include; defaults to all configured models
        #[arg(short, long = "model")]
        model: Vec<String>,

        /// Generation attempts per model
        #[arg(short = 'n', long, default_value_t = 1)]
        iterations: u32,

        /// Run identifier; derived from the current time when omitted
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Judge raw generations of a run that have no judged artifact yet
    Resume {
        /// Run identifier to resume
        run_id: String,
    },
    /// Per-model statistics of the total score for a run
    Stats {
        /// Run identifier to inspect
        run_id: String,

        /// Output format: plain or json
        #[arg(short, long, default_value = "plain")]
        output: OutputFormat,
    },
}

fn configure_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(config: Option<&Path>) -> anyhow::Result<Settings> {
    match config {
        Some(path) => Settings::from_file(path),
        None => Ok(Settings::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    configure_logging(&args.log_level);
    let settings = load_settings(args.config.as_deref())?;

    match args.command {
        Command::Run {
            model,
            iterations,
            run_id,
        } => {
            let runner = Runner::new(settings)?;
            let models = (!model.is_empty()).then_some(model);
            let records = runner.run(run_id, models, iterations).await?;
            println!(
                "{} records judged, total cost ${:.4}",
                records.len(),
                runner.cumulative_cost_usd()
            );
        }
        Command::Resume { run_id } => {
            let runner = Runner::new(settings)?;
            let records = runner.resume(&run_id).await?;
            println!(
                "{} records judged, total cost ${:.4}",
                records.len(),
                runner.cumulative_cost_usd()
            );
        }
        Command::Stats { run_id, output } => {
            let conn = database::connect(&settings, &run_id)?;
            database::ensure_schema(&conn)?;
            let rows = database::model_aggregates(&conn)?;
            output::print_stats(&rows, output);
        }
    }

    Ok(())
}
