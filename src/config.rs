use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Configuration for a single candidate model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Model identifier as the router knows it (e.g. "openai/gpt-4o-mini")
    pub name: String,
    /// Sampling temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Nucleus sampling parameter
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Optional completion token cap
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Free-form metadata carried through to artifacts
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_temperature() -> f64 {
    0.8
}

fn default_top_p() -> f64 {
    0.9
}

/// Cumulative spend limits for one run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    /// Hard ceiling in USD across all calls of a run
    #[serde(default = "default_max_budget")]
    pub max_budget_usd: f64,
    /// Fraction of the ceiling at which a warning is logged
    #[serde(default = "default_warn_fraction")]
    pub warn_at_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_budget_usd: default_max_budget(),
            warn_at_fraction: default_warn_fraction(),
        }
    }
}

fn default_max_budget() -> f64 {
    100.0
}

fn default_warn_fraction() -> f64 {
    0.9
}

/// Concurrency and request-rate caps.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// In-flight requests allowed per model name
    #[serde(default = "default_per_model_concurrency")]
    pub per_model_concurrency: usize,
    /// Requests allowed in any sliding 60 second window, all models combined
    #[serde(default = "default_global_rpm")]
    pub global_requests_per_minute: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_model_concurrency: default_per_model_concurrency(),
            global_requests_per_minute: default_global_rpm(),
        }
    }
}

fn default_per_model_concurrency() -> usize {
    2
}

fn default_global_rpm() -> usize {
    60
}

/// Retry tunables for the router client, per failure class.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Fixed delay between connection retries, seconds
    #[serde(default = "default_connection_delay")]
    pub connection_retry_delay_secs: f64,
    /// Total time allowed in the connection-failure state, seconds
    #[serde(default = "default_connection_ceiling")]
    pub connection_retry_ceiling_secs: f64,
    /// 429 responses tolerated before giving up
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_max_attempts: u32,
    /// Cap on any single 429 backoff, seconds
    #[serde(default = "default_rate_limit_cap")]
    pub rate_limit_max_delay_secs: f64,
    /// 5xx responses tolerated before giving up
    #[serde(default = "default_server_attempts")]
    pub server_error_max_attempts: u32,
    /// Linear backoff step for 5xx, seconds
    #[serde(default = "default_server_step")]
    pub server_error_step_secs: f64,
    /// Bound on the overall retry loop
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connection_retry_delay_secs: default_connection_delay(),
            connection_retry_ceiling_secs: default_connection_ceiling(),
            rate_limit_max_attempts: default_rate_limit_attempts(),
            rate_limit_max_delay_secs: default_rate_limit_cap(),
            server_error_max_attempts: default_server_attempts(),
            server_error_step_secs: default_server_step(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_connection_delay() -> f64 {
    2.0
}

fn default_connection_ceiling() -> f64 {
    30.0
}

fn default_rate_limit_attempts() -> u32 {
    5
}

fn default_rate_limit_cap() -> f64 {
    60.0
}

fn default_server_attempts() -> u32 {
    3
}

fn default_server_step() -> f64 {
    5.0
}

fn default_max_attempts() -> u32 {
    10
}

/// HTTP endpoint and timeout settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Router API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Connect timeout, seconds
    #[serde(default = "default_timeout_connect")]
    pub timeout_connect_secs: f64,
    /// Read timeout for a whole response, seconds
    #[serde(default = "default_timeout_read")]
    pub timeout_read_secs: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_connect_secs: default_timeout_connect(),
            timeout_read_secs: default_timeout_read(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_timeout_connect() -> f64 {
    5.0
}

fn default_timeout_read() -> f64 {
    90.0
}

/// Paths for file based artifacts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory under which per-run directories are created
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// SQLite filename, `{run_id}` substituted per run
    #[serde(default = "default_sqlite_template")]
    pub sqlite_filename_template: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            sqlite_filename_template: default_sqlite_template(),
        }
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from("benchmarks")
}

fn default_sqlite_template() -> String {
    "{run_id}_benchmark_data.sqlite".to_string()
}

/// Global application configuration, read once at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Environment variable name containing the router API key
    #[serde(default = "default_api_key_env")]
    pub env_var_api_key: String,
    /// Model used to score generations
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    /// Models to benchmark
    #[serde(default = "default_candidate_models")]
    pub candidate_models: Vec<ModelConfig>,
    /// Path to the benchmark prompt template
    #[serde(default = "default_prompt_path")]
    pub prompt_path: PathBuf,
    /// Path to the judge checklist template
    #[serde(default = "default_judge_prompt_path")]
    pub judge_prompt_path: PathBuf,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Static USD-per-1000-token prices, keyed by model name, used when the
    /// router response carries no price header
    #[serde(default)]
    pub price_overrides: HashMap<String, f64>,
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_judge_model() -> String {
    "openai/gpt-4o".to_string()
}

fn default_candidate_models() -> Vec<ModelConfig> {
    vec![
        ModelConfig {
            name: "mistralai/mistral-7b-instruct".to_string(),
            temperature: 0.8,
            top_p: default_top_p(),
            max_tokens: None,
            metadata: HashMap::new(),
        },
        ModelConfig {
            name: "openai/gpt-4o-mini".to_string(),
            temperature: 0.6,
            top_p: default_top_p(),
            max_tokens: None,
            metadata: HashMap::new(),
        },
    ]
}

fn default_prompt_path() -> PathBuf {
    PathBuf::from("prompts/benchmark_prompt.md")
}

fn default_judge_prompt_path() -> PathBuf {
    PathBuf::from("prompts/judge_checklist.md")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env_var_api_key: default_api_key_env(),
            judge_model: default_judge_model(),
            candidate_models: default_candidate_models(),
            prompt_path: default_prompt_path(),
            judge_prompt_path: default_judge_prompt_path(),
            budget: BudgetConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            http: HttpConfig::default(),
            storage: StorageConfig::default(),
            price_overrides: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.env_var_api_key)
            .with_context(|| format!("Environment variable {} not found", self.env_var_api_key))
    }

    /// Base path for run artifacts, created on first use.
    pub fn resolved_base_path(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.storage.base_path).with_context(|| {
            format!(
                "Failed to create base path: {}",
                self.storage.base_path.display()
            )
        })?;
        Ok(self.storage.base_path.clone())
    }
}
