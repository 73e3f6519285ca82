use chrono::Utc;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Settings;
use crate::database;
use crate::error::BenchResult;
use crate::models::{BenchmarkRecord, GenerationResult};

/// Per-run directory, with `raw/` and `judged/` created on first use.
pub fn run_path(settings: &Settings, run_id: &str) -> BenchResult<PathBuf> {
    let base = settings.storage.base_path.join(run_id);
    fs::create_dir_all(base.join("raw"))?;
    fs::create_dir_all(base.join("judged"))?;
    Ok(base)
}

/// Filename for one attempt; model names contain `/` and `:`.
pub fn safe_model_filename(model: &str, run_number: u32) -> String {
    format!("{}_{}.json", model.replace(['/', ':'], "_"), run_number)
}

/// Persist one generation attempt, write-through. Re-saving the same
/// (run_id, model, attempt) key overwrites the previous file.
pub fn save_generation_result(
    result: &GenerationResult,
    run_id: &str,
    settings: &Settings,
) -> BenchResult<PathBuf> {
    let run = run_path(settings, run_id)?;
    let file_path = run
        .join("raw")
        .join(safe_model_filename(&result.model, result.run));
    fs::write(&file_path, serde_json::to_string_pretty(result)?)?;
    info!(path = %file_path.display(), "generation saved");
    update_cost_report(&run, run_id, result)?;
    Ok(file_path)
}

fn update_cost_report(run: &Path, run_id: &str, result: &GenerationResult) -> BenchResult<()> {
    let cost_path = run.join("cost_report.csv");
    let file_exists = cost_path.exists();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cost_path)?;
    if !file_exists {
        writeln!(
            file,
            "timestamp,run_id,model,run,cost_usd,prompt_tokens,completion_tokens"
        )?;
    }
    writeln!(
        file,
        "{},{},{},{},{:.8},{},{}",
        result.timestamp.to_rfc3339(),
        run_id,
        result.model,
        result.run,
        result.cost_usd,
        result.prompt_tokens,
        result.completion_tokens
    )?;
    Ok(())
}

/// Persist one judged record: pretty JSON under `judged/` plus an idempotent
/// SQLite upsert.
pub fn save_benchmark_record(
    record: &BenchmarkRecord,
    run_id: &str,
    settings: &Settings,
) -> BenchResult<PathBuf> {
    let run = run_path(settings, run_id)?;
    let file_path = run.join("judged").join(safe_model_filename(
        &record.generation.model,
        record.generation.run,
    ));
    fs::write(&file_path, serde_json::to_string_pretty(record)?)?;
    info!(path = %file_path.display(), "benchmark record saved");

    let conn = database::connect(settings, run_id)?;
    database::ensure_schema(&conn)?;
    database::upsert_record(&conn, run_id, record)?;
    Ok(file_path)
}

/// Run metadata next to the artifacts; the API key never appears here
/// because settings only carry the variable name.
pub fn write_meta_json(run_id: &str, settings: &Settings) -> BenchResult<PathBuf> {
    let run = run_path(settings, run_id)?;
    let meta_path = run.join("meta.json");
    let payload = json!({
        "run_id": run_id,
        "created_at": Utc::now().to_rfc3339(),
        "config": settings,
    });
    fs::write(&meta_path, serde_json::to_string_pretty(&payload)?)?;
    info!(path = %meta_path.display(), "meta written");
    Ok(meta_path)
}

/// Raw generations of a run that have no judged counterpart yet, in
/// filename order. Basis for `resume`.
pub fn unjudged_generations(
    settings: &Settings,
    run_id: &str,
) -> BenchResult<Vec<GenerationResult>> {
    let run = run_path(settings, run_id)?;
    let judged_dir = run.join("judged");

    let mut raw_files: Vec<PathBuf> = fs::read_dir(run.join("raw"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    raw_files.sort();

    let mut pending = Vec::new();
    for raw_file in raw_files {
        let judged = raw_file
            .file_name()
            .map(|name| judged_dir.join(name).exists())
            .unwrap_or(false);
        if judged {
            continue;
        }
        let content = fs::read_to_string(&raw_file)?;
        pending.push(serde_json::from_str(&content)?);
    }
    Ok(pending)
}
