use chrono::Utc;
use std::path::Path;
use tracing::{info, warn};

use crate::client::{ChatRequest, RouterClient};
use crate::config::{ModelConfig, Settings};
use crate::error::{BenchError, BenchResult};
use crate::extractor::extract_summary;
use crate::models::GenerationResult;
use crate::storage;

/// Load the benchmark prompt template.
pub fn load_benchmark_prompt(prompt_path: &Path) -> BenchResult<String> {
    if !prompt_path.exists() {
        return Err(BenchError::PromptMissing {
            path: prompt_path.display().to_string(),
        });
    }
    Ok(std::fs::read_to_string(prompt_path)?)
}

/// One generation attempt. Extraction failure leaves the summary absent;
/// the full text is always preserved for audit.
pub async fn generate_joke(
    client: &RouterClient,
    model: &ModelConfig,
    prompt: &str,
    run_number: u32,
) -> Result<GenerationResult, crate::error::RouterError> {
    let response = client
        .chat_with(ChatRequest::for_model(model, prompt))
        .await?;

    let summary = match extract_summary(&response.text) {
        Ok(summary) => Some(summary),
        Err(err) => {
            warn!(model = %model.name, run = run_number, error = %err, "summary missing");
            None
        }
    };

    Ok(GenerationResult {
        model: model.name.clone(),
        run: run_number,
        summary,
        full_response: response.text,
        prompt_tokens: response.prompt_tokens,
        completion_tokens: response.completion_tokens,
        cost_usd: response.cost_usd,
        timestamp: Utc::now(),
    })
}

/// Produce `iterations` attempts for one model, strictly sequential, each
/// persisted as soon as it exists. Attempt-level failures are skipped;
/// budget exhaustion and authentication failures end the run.
pub async fn run_model_generations(
    client: &RouterClient,
    settings: &Settings,
    model: &ModelConfig,
    prompt: &str,
    run_id: &str,
    iterations: u32,
) -> BenchResult<Vec<GenerationResult>> {
    let mut results = Vec::new();
    for index in 1..=iterations {
        let result = match generate_joke(client, model, prompt, index).await {
            Ok(result) => result,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(model = %model.name, run = index, error = %err, "attempt skipped");
                continue;
            }
        };
        storage::save_generation_result(&result, run_id, settings)?;
        info!(
            model = %model.name,
            run = index,
            cost_usd = result.cost_usd,
            has_summary = result.summary.is_some(),
            "generation complete"
        );
        results.push(result);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY_VAR: &str = "HEXE_BENCH_TEST_API_KEY";

    fn test_settings(base_url: &str, storage_dir: &Path) -> Settings {
        unsafe {
            std::env::set_var(TEST_KEY_VAR, "test-key");
        }
        let mut settings = Settings::default();
        settings.env_var_api_key = TEST_KEY_VAR.to_string();
        settings.http.base_url = base_url.to_string();
        settings.storage.base_path = storage_dir.to_path_buf();
        settings
    }

    fn test_model() -> ModelConfig {
        ModelConfig {
            name: "test/model".to_string(),
            temperature: 0.8,
            top_p: 0.9,
            max_tokens: None,
            metadata: Default::default(),
        }
    }

    fn joke_with_summary() -> String {
        "Ein Gast wünscht sich ein Schloss...\n\n\
         ### ZUSAMMENFASSUNG\n\
         - Gewünscht: Ein Schloss\n\
         - Bekommen: Ein Floh\n"
            .to_string()
    }

    async fn mount_generation(server: &MockServer, text: &str) {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": text}}],
                "usage": {"prompt_tokens": 100, "completion_tokens": 50},
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_generate_joke_extracts_summary() {
        let server = MockServer::start().await;
        mount_generation(&server, &joke_with_summary()).await;

        let dir = tempdir().unwrap();
        let settings = test_settings(&server.uri(), dir.path());
        let client = RouterClient::new(&settings).unwrap();

        let result = generate_joke(&client, &test_model(), "prompt", 1)
            .await
            .unwrap();
        let summary = result.summary.unwrap();
        assert_eq!(summary.gewuenscht, "Ein Schloss");
        assert_eq!(summary.bekommen, "Ein Floh");
        assert_eq!(result.run, 1);
        assert_eq!(result.prompt_tokens, 100);
    }

    #[tokio::test]
    async fn test_generate_joke_without_summary_keeps_full_text() {
        let server = MockServer::start().await;
        mount_generation(&server, "Nur Prosa, kein Block.").await;

        let dir = tempdir().unwrap();
        let settings = test_settings(&server.uri(), dir.path());
        let client = RouterClient::new(&settings).unwrap();

        let result = generate_joke(&client, &test_model(), "prompt", 2)
            .await
            .unwrap();
        assert!(result.summary.is_none());
        assert_eq!(result.full_response, "Nur Prosa, kein Block.");
    }

    #[tokio::test]
    async fn test_run_model_generations_persists_each_attempt() {
        let server = MockServer::start().await;
        mount_generation(&server, &joke_with_summary()).await;

        let dir = tempdir().unwrap();
        let settings = test_settings(&server.uri(), dir.path());
        let client = RouterClient::new(&settings).unwrap();

        let results =
            run_model_generations(&client, &settings, &test_model(), "prompt", "run_x", 3)
                .await
                .unwrap();
        assert_eq!(results.len(), 3);
        for run_number in 1..=3 {
            let path = dir
                .path()
                .join("run_x")
                .join("raw")
                .join(format!("test_model_{run_number}.json"));
            assert!(path.exists(), "missing {}", path.display());
        }
    }

    #[tokio::test]
    async fn test_run_model_generations_skips_failed_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let settings = test_settings(&server.uri(), dir.path());
        let client = RouterClient::new(&settings).unwrap();

        let results =
            run_model_generations(&client, &settings, &test_model(), "prompt", "run_x", 2)
                .await
                .unwrap();
        assert!(results.is_empty());
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_model_generations_halts_on_budget() {
        let server = MockServer::start().await;
        mount_generation(&server, &joke_with_summary()).await;

        let dir = tempdir().unwrap();
        let mut settings = test_settings(&server.uri(), dir.path());
        settings.budget.max_budget_usd = 0.0;
        let client = RouterClient::new(&settings).unwrap();

        let err = run_model_generations(&client, &settings, &test_model(), "prompt", "run_x", 3)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            BenchError::Router(RouterError::BudgetExceeded { .. })
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn test_load_benchmark_prompt_missing_file() {
        let err = load_benchmark_prompt(Path::new("/nonexistent/prompt.md")).unwrap_err();
        assert!(matches!(err, BenchError::PromptMissing { .. }));
    }
}
