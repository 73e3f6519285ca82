use rusqlite::{Connection, params};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::Settings;
use crate::error::BenchResult;
use crate::models::BenchmarkRecord;

const RECORDS_DDL: &str = "
CREATE TABLE IF NOT EXISTS records (
  id TEXT PRIMARY KEY,
  run_id TEXT,
  model TEXT,
  run INTEGER,
  gewuenscht TEXT,
  bekommen TEXT,
  phonetische_aehnlichkeit INTEGER,
  anzueglichkeit INTEGER,
  logik INTEGER,
  kreativitaet INTEGER,
  gesamt INTEGER,
  prompt_tokens INTEGER,
  completion_tokens INTEGER,
  cost_usd REAL,
  ts TEXT
);
CREATE INDEX IF NOT EXISTS idx_records_model ON records(model);
";

fn database_path(settings: &Settings, run_id: &str) -> BenchResult<PathBuf> {
    let base = settings.storage.base_path.join(run_id);
    std::fs::create_dir_all(&base)?;
    let filename = settings
        .storage
        .sqlite_filename_template
        .replace("{run_id}", run_id);
    Ok(base.join(filename))
}

/// Open (creating if needed) the run's database in WAL mode.
pub fn connect(settings: &Settings, run_id: &str) -> BenchResult<Connection> {
    let conn = Connection::open(database_path(settings, run_id)?)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

pub fn ensure_schema(conn: &Connection) -> BenchResult<()> {
    conn.execute_batch(RECORDS_DDL)?;
    Ok(())
}

/// Insert or update one record, keyed by `{run_id}_{model}_{run}`.
/// Re-inserting the same key replaces the scores; idempotent by design of
/// the key.
pub fn upsert_record(conn: &Connection, run_id: &str, record: &BenchmarkRecord) -> BenchResult<()> {
    let generation = &record.generation;
    let summary = generation.summary.as_ref();
    conn.execute(
        "
        INSERT INTO records (
            id, run_id, model, run, gewuenscht, bekommen,
            phonetische_aehnlichkeit, anzueglichkeit, logik, kreativitaet, gesamt,
            prompt_tokens, completion_tokens, cost_usd, ts
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT(id) DO UPDATE SET
            phonetische_aehnlichkeit=excluded.phonetische_aehnlichkeit,
            anzueglichkeit=excluded.anzueglichkeit,
            logik=excluded.logik,
            kreativitaet=excluded.kreativitaet,
            gesamt=excluded.gesamt,
            prompt_tokens=excluded.prompt_tokens,
            completion_tokens=excluded.completion_tokens,
            cost_usd=excluded.cost_usd,
            ts=excluded.ts
        ",
        params![
            format!("{}_{}_{}", run_id, generation.model, generation.run),
            run_id,
            generation.model,
            generation.run,
            summary.map(|s| s.gewuenscht.as_str()),
            summary.map(|s| s.bekommen.as_str()),
            record.judge.phonetische_aehnlichkeit,
            record.judge.anzueglichkeit,
            record.judge.logik,
            record.judge.kreativitaet,
            record.judge.gesamt,
            generation.prompt_tokens,
            generation.completion_tokens,
            generation.cost_usd,
            generation.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Per-model aggregate of the total score, the basis of `stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelAggregate {
    pub model: String,
    pub count: i64,
    pub mean: f64,
    pub min: i64,
    pub max: i64,
}

pub fn model_aggregates(conn: &Connection) -> BenchResult<Vec<ModelAggregate>> {
    let mut stmt = conn.prepare(
        "SELECT model, COUNT(*), AVG(gesamt), MIN(gesamt), MAX(gesamt)
         FROM records GROUP BY model ORDER BY model",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ModelAggregate {
            model: row.get(0)?,
            count: row.get(1)?,
            mean: row.get(2)?,
            min: row.get(3)?,
            max: row.get(4)?,
        })
    })?;
    let mut aggregates = Vec::new();
    for row in rows {
        aggregates.push(row?);
    }
    Ok(aggregates)
}
