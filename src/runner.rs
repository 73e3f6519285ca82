use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::client::RouterClient;
use crate::config::{ModelConfig, Settings};
use crate::error::{BenchError, BenchResult};
use crate::generator;
use crate::judge;
use crate::models::{BenchmarkRecord, GenerationResult};
use crate::storage;

/// Lifecycle of one coordinator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Generating,
    Judging,
    Completed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Generating => "generating",
            Self::Judging => "judging",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Time-derived identifier for a new run.
pub fn generate_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Coordinates the generation and judging phases of one run. Retry lives in
/// the client; this level only decides which failures end the run.
pub struct Runner {
    settings: Arc<Settings>,
    client: Arc<RouterClient>,
}

impl Runner {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let client = RouterClient::new(&settings)?;
        Ok(Self {
            settings: Arc::new(settings),
            client: Arc::new(client),
        })
    }

    /// Total USD spent through this runner's client so far.
    pub fn cumulative_cost_usd(&self) -> f64 {
        self.client.cumulative_cost_usd()
    }

    fn filter_models(&self, names: Option<&[String]>) -> BenchResult<Vec<ModelConfig>> {
        let Some(names) = names else {
            return Ok(self.settings.candidate_models.clone());
        };
        let missing: Vec<&str> = names
            .iter()
            .filter(|name| {
                !self
                    .settings
                    .candidate_models
                    .iter()
                    .any(|cfg| &cfg.name == *name)
            })
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(BenchError::UnknownModels {
                names: missing.join(", "),
            });
        }
        Ok(self
            .settings
            .candidate_models
            .iter()
            .filter(|cfg| names.contains(&cfg.name))
            .cloned()
            .collect())
    }

    fn transition(run_id: &str, state: &mut RunState, to: RunState) {
        info!(run_id, from = %state, to = %to, "run state");
        *state = to;
    }

    /// Run generation then judging for the selected models.
    ///
    /// Budget exhaustion and authentication failures abort the run; all
    /// artifacts persisted before the abort are retained. Any other failure
    /// is logged and the next unit of work proceeds.
    pub async fn run(
        &self,
        run_id: Option<String>,
        model_names: Option<Vec<String>>,
        iterations: u32,
    ) -> BenchResult<Vec<BenchmarkRecord>> {
        let run_id = run_id.unwrap_or_else(generate_run_id);
        let mut state = RunState::Starting;

        let models = self.filter_models(model_names.as_deref())?;
        let prompt = generator::load_benchmark_prompt(&self.settings.prompt_path)?;
        let template = judge::load_judge_prompt(&self.settings.judge_prompt_path)?;
        info!(
            run_id,
            models = models.len(),
            iterations,
            budget_usd = self.settings.budget.max_budget_usd,
            "starting run"
        );

        Self::transition(&run_id, &mut state, RunState::Generating);
        let generations = match self.generation_phase(&run_id, models, &prompt, iterations).await {
            Ok(generations) => generations,
            Err(err) => {
                Self::transition(&run_id, &mut state, RunState::Aborted);
                error!(run_id, error = %err, "run aborted during generation");
                return Err(err);
            }
        };
        storage::write_meta_json(&run_id, &self.settings)?;

        Self::transition(&run_id, &mut state, RunState::Judging);
        let records = match self.judge_generations(&run_id, &generations, &template).await {
            Ok(records) => records,
            Err(err) => {
                Self::transition(&run_id, &mut state, RunState::Aborted);
                error!(run_id, error = %err, "run aborted during judging");
                return Err(err);
            }
        };

        Self::transition(&run_id, &mut state, RunState::Completed);
        info!(
            run_id,
            records = records.len(),
            cost_usd = self.cumulative_cost_usd(),
            "run complete"
        );
        Ok(records)
    }

    /// One task per model; attempts within a model stay sequential. The
    /// first fatal error wins, the remaining tasks fail fast on their own
    /// budget pre-checks.
    async fn generation_phase(
        &self,
        run_id: &str,
        models: Vec<ModelConfig>,
        prompt: &str,
        iterations: u32,
    ) -> BenchResult<Vec<GenerationResult>> {
        let mut join_set: JoinSet<BenchResult<Vec<GenerationResult>>> = JoinSet::new();
        for model in models {
            let client = Arc::clone(&self.client);
            let settings = Arc::clone(&self.settings);
            let prompt = prompt.to_string();
            let run_id = run_id.to_string();
            join_set.spawn(async move {
                generator::run_model_generations(
                    &client, &settings, &model, &prompt, &run_id, iterations,
                )
                .await
            });
        }

        let mut generations = Vec::new();
        let mut fatal: Option<BenchError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(results)) => generations.extend(results),
                Ok(Err(err)) if err.is_fatal() => {
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                }
                Ok(Err(err)) => warn!(run_id, error = %err, "model generation failed"),
                Err(join_err) => warn!(run_id, error = %join_err, "generation task panicked"),
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        // Stable order for the judging phase regardless of task completion.
        generations.sort_by(|a, b| a.model.cmp(&b.model).then(a.run.cmp(&b.run)));
        Ok(generations)
    }

    async fn judge_generations(
        &self,
        run_id: &str,
        generations: &[GenerationResult],
        template: &str,
    ) -> BenchResult<Vec<BenchmarkRecord>> {
        let mut records = Vec::new();
        for generation in generations {
            let judged = judge::judge_and_store(
                &self.client,
                generation,
                &self.settings.judge_model,
                template,
                run_id,
                &self.settings,
            )
            .await;
            match judged {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(
                    run_id,
                    model = %generation.model,
                    run = generation.run,
                    error = %err,
                    "judging failed"
                ),
            }
        }
        Ok(records)
    }

    /// Judge every raw generation of an earlier run that has no judged
    /// artifact yet.
    pub async fn resume(&self, run_id: &str) -> BenchResult<Vec<BenchmarkRecord>> {
        let pending = storage::unjudged_generations(&self.settings, run_id)?;
        info!(run_id, pending = pending.len(), "resuming run");
        let template = judge::load_judge_prompt(&self.settings.judge_prompt_path)?;
        self.judge_generations(run_id, &pending, &template).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY_VAR: &str = "HEXE_BENCH_TEST_API_KEY";

    fn write_prompts(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let prompt_path = dir.join("benchmark_prompt.md");
        let judge_path = dir.join("judge_checklist.md");
        fs::write(&prompt_path, "Erzähle einen Hexenwitz.").unwrap();
        fs::write(
            &judge_path,
            "Wunsch: {{gewuenscht}}\nErgebnis: {{bekommen}}\n{{vollstaendige_antwort}}",
        )
        .unwrap();
        (prompt_path, judge_path)
    }

    fn test_settings(base_url: &str, dir: &Path) -> Settings {
        unsafe {
            std::env::set_var(TEST_KEY_VAR, "test-key");
        }
        let (prompt_path, judge_path) = write_prompts(dir);
        let mut settings = Settings::default();
        settings.env_var_api_key = TEST_KEY_VAR.to_string();
        settings.http.base_url = base_url.to_string();
        settings.storage.base_path = dir.join("benchmarks");
        settings.prompt_path = prompt_path;
        settings.judge_prompt_path = judge_path;
        settings.judge_model = "judge/model".to_string();
        settings.candidate_models = vec![ModelConfig {
            name: "cand/model".to_string(),
            temperature: 0.8,
            top_p: 0.9,
            max_tokens: None,
            metadata: Default::default(),
        }];
        settings
    }

    fn generation_reply() -> serde_json::Value {
        json!({
            "choices": [{"message": {"content":
                "Witz...\n\n### ZUSAMMENFASSUNG\n- Gewünscht: Ein Schloss\n- Bekommen: Ein Floh\n"}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 50},
        })
    }

    fn judge_reply() -> serde_json::Value {
        let payload = json!({
            "phonetische_aehnlichkeit": 30,
            "anzueglichkeit": 15,
            "logik": 18,
            "kreativitaet": 12,
            "gesamt": 75,
            "begruendung": {"logik": "schluessig"},
        });
        json!({
            "choices": [{"message": {"content": format!("```json\n{payload}\n```")}}],
            "usage": {"prompt_tokens": 200, "completion_tokens": 100},
        })
    }

    async fn mount_both_models(server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"model": "cand/model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(generation_reply()))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"model": "judge/model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(judge_reply()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_run_generates_and_judges_all_attempts() {
        let server = MockServer::start().await;
        mount_both_models(&server).await;

        let dir = tempdir().unwrap();
        let settings = test_settings(&server.uri(), dir.path());
        let runner = Runner::new(settings).unwrap();

        let records = runner
            .run(Some("run_x".to_string()), None, 2)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.judge.gesamt == 75));

        let run_dir = dir.path().join("benchmarks").join("run_x");
        assert!(run_dir.join("raw").join("cand_model_1.json").exists());
        assert!(run_dir.join("raw").join("cand_model_2.json").exists());
        assert!(run_dir.join("judged").join("cand_model_1.json").exists());
        assert!(run_dir.join("judged").join("cand_model_2.json").exists());
        assert!(run_dir.join("meta.json").exists());
        // 2 generation calls + 2 judge calls
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_run_skips_judging_without_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"model": "cand/model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "Nur Prosa."}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5},
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let settings = test_settings(&server.uri(), dir.path());
        let runner = Runner::new(settings).unwrap();

        let records = runner
            .run(Some("run_x".to_string()), None, 1)
            .await
            .unwrap();
        assert!(records.is_empty());

        let run_dir = dir.path().join("benchmarks").join("run_x");
        assert!(run_dir.join("raw").join("cand_model_1.json").exists());
        assert!(!run_dir.join("judged").join("cand_model_1.json").exists());
        // Only the generation call; the judge is never contacted.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_rejects_unknown_model_names() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let settings = test_settings(&server.uri(), dir.path());
        let runner = Runner::new(settings).unwrap();

        let err = runner
            .run(None, Some(vec!["missing/model".to_string()]), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::UnknownModels { .. }));
    }

    #[tokio::test]
    async fn test_run_aborts_on_budget_exhaustion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(generation_reply())
                    .insert_header("x-openrouter-price", "10.0"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut settings = test_settings(&server.uri(), dir.path());
        settings.budget.max_budget_usd = 0.5;
        let runner = Runner::new(settings).unwrap();

        let err = runner
            .run(Some("run_x".to_string()), None, 3)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            BenchError::Router(RouterError::BudgetExceeded { .. })
        ));
        // The first attempt cost 1.5 USD and crossed the 0.5 ceiling.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_judges_only_pending_generations() {
        let server = MockServer::start().await;
        mount_both_models(&server).await;

        let dir = tempdir().unwrap();
        let settings = test_settings(&server.uri(), dir.path());

        let generation = crate::models::GenerationResult {
            model: "cand/model".to_string(),
            run: 1,
            summary: Some(crate::models::Summary {
                gewuenscht: "Ein Schloss".to_string(),
                bekommen: "Ein Floh".to_string(),
            }),
            full_response: "Witz...".to_string(),
            prompt_tokens: 100,
            completion_tokens: 50,
            cost_usd: 0.001,
            timestamp: Utc::now(),
        };
        storage::save_generation_result(&generation, "run_x", &settings).unwrap();

        let runner = Runner::new(settings).unwrap();
        let records = runner.resume("run_x").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].judge.gesamt, 75);

        // A second resume finds nothing left to judge.
        let records = runner.resume("run_x").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_models_all_complete() {
        let server = MockServer::start().await;
        mount_both_models(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"model": "cand/other"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(generation_reply()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut settings = test_settings(&server.uri(), dir.path());
        settings.candidate_models.push(ModelConfig {
            name: "cand/other".to_string(),
            temperature: 0.6,
            top_p: 0.9,
            max_tokens: None,
            metadata: Default::default(),
        });
        let runner = Runner::new(settings).unwrap();

        let records = runner
            .run(Some("run_x".to_string()), None, 2)
            .await
            .unwrap();
        // 2 models x 2 attempts, judged in stable model/run order.
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].generation.model, "cand/model");
        assert_eq!(records[3].generation.model, "cand/other");
    }
}
