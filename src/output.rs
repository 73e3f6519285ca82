use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::database::ModelAggregate;

/// Output format options
#[derive(Debug, Clone, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print per-model score statistics in the specified format.
pub fn print_stats(rows: &[ModelAggregate], format: OutputFormat) {
    match format {
        OutputFormat::Plain => print_plain(rows),
        OutputFormat::Json => print_json(rows),
    }
}

fn print_plain(rows: &[ModelAggregate]) {
    if rows.is_empty() {
        println!("No records available for this run");
        return;
    }

    println!(
        "{:<40} {:<8} {:<8} {:<8} {:<8}",
        "Model", "Count", "Mean", "Min", "Max"
    );
    println!("{}", "-".repeat(76));

    for row in rows {
        println!(
            "{:<40} {:<8} {:<8.1} {:<8} {:<8}",
            row.model, row.count, row.mean, row.min, row.max
        );
    }
}

fn print_json(rows: &[ModelAggregate]) {
    match serde_json::to_string_pretty(rows) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing stats to JSON: {}", e),
    }
}
