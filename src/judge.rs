use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{error, info};

use crate::client::{ChatRequest, RouterClient};
use crate::config::Settings;
use crate::error::{BenchError, BenchResult};
use crate::models::{BenchmarkRecord, GenerationResult, JudgeScore, RawJudgeScore, Summary};
use crate::storage;

/// Near-deterministic scoring.
const JUDGE_TEMPERATURE: f64 = 0.0;

static JSON_BLOCK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```(?:json)?\s*(.+?)```").unwrap());

/// Load the judge checklist template.
pub fn load_judge_prompt(path: &Path) -> BenchResult<String> {
    if !path.exists() {
        return Err(BenchError::PromptMissing {
            path: path.display().to_string(),
        });
    }
    Ok(std::fs::read_to_string(path)?)
}

/// Substitute the generation's summary and full text into the checklist.
pub fn format_judge_prompt(
    template: &str,
    summary: &Summary,
    generation: &GenerationResult,
) -> String {
    template
        .replace("{{gewuenscht}}", &summary.gewuenscht)
        .replace("{{bekommen}}", &summary.bekommen)
        .replace("{{vollstaendige_antwort}}", &generation.full_response)
}

/// The judge is asked for a fenced ```json block; fall back to treating the
/// whole reply as JSON when the fence is missing.
fn extract_json_block(text: &str) -> &str {
    JSON_BLOCK_PATTERN
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map_or(text, |m| m.as_str())
}

/// Score one generation with the judge model.
///
/// Returns `Ok(None)` without any network call when the generation has no
/// summary, and `Ok(None)` when the judge's reply is not usable JSON. Fails
/// only on fatal client errors or a missing justification mapping.
pub async fn judge_generation(
    client: &RouterClient,
    generation: &GenerationResult,
    judge_model: &str,
    template: &str,
) -> BenchResult<Option<JudgeScore>> {
    let Some(summary) = generation.summary.as_ref() else {
        info!(
            model = %generation.model,
            run = generation.run,
            "no summary, skipping judgement"
        );
        return Ok(None);
    };

    let prompt = format_judge_prompt(template, summary, generation);
    let response = client
        .chat_with(ChatRequest::new(judge_model, &prompt, JUDGE_TEMPERATURE))
        .await?;

    let payload = extract_json_block(&response.text);
    let raw: RawJudgeScore = match serde_json::from_str(payload) {
        Ok(raw) => raw,
        Err(err) => {
            let snippet: String = response.text.chars().take(200).collect();
            error!(
                model = %generation.model,
                run = generation.run,
                error = %err,
                payload = %snippet,
                "judge payload not usable"
            );
            return Ok(None);
        }
    };

    Ok(Some(raw.clamped()?))
}

/// Judge one generation and persist the combined record.
pub async fn judge_and_store(
    client: &RouterClient,
    generation: &GenerationResult,
    judge_model: &str,
    template: &str,
    run_id: &str,
    settings: &Settings,
) -> BenchResult<Option<BenchmarkRecord>> {
    let Some(score) = judge_generation(client, generation, judge_model, template).await? else {
        return Ok(None);
    };
    let record = BenchmarkRecord {
        generation: generation.clone(),
        judge: score,
    };
    storage::save_benchmark_record(&record, run_id, settings)?;
    Ok(Some(record))
}
