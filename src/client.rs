use anyhow::{Context, Result};
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ModelConfig, Settings};
use crate::error::RouterError;
use crate::models::RouterResponse;

/// Response header carrying the USD price per 1000 combined tokens.
const PRICE_HEADER: &str = "x-openrouter-price";

/// Width of the global sliding request window.
const WINDOW: Duration = Duration::from_secs(60);

/// One chat call. `top_p`, `max_tokens` and the reasoning flags are optional
/// pass-throughs; reasoning flags default per model family when unset.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub include_reasoning: Option<bool>,
    pub reasoning_effort: Option<&'a str>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(model: &'a str, prompt: &'a str, temperature: f64) -> Self {
        Self {
            model,
            prompt,
            temperature,
            top_p: None,
            max_tokens: None,
            include_reasoning: None,
            reasoning_effort: None,
        }
    }

    /// Request carrying a candidate model's full sampling configuration.
    pub fn for_model(model: &'a ModelConfig, prompt: &'a str) -> Self {
        Self {
            model: &model.name,
            prompt,
            temperature: model.temperature,
            top_p: Some(model.top_p),
            max_tokens: model.max_tokens,
            include_reasoning: None,
            reasoning_effort: None,
        }
    }
}

/// Single chokepoint for all outbound chat-completion calls. Owns the
/// cumulative cost counter, the per-model concurrency gates and the global
/// request window for the lifetime of one run.
pub struct RouterClient {
    http: reqwest::Client,
    base_url: String,
    max_budget_usd: f64,
    warn_at_fraction: f64,
    per_model_concurrency: usize,
    global_limit: usize,
    retry: crate::config::RetryConfig,
    price_overrides: HashMap<String, f64>,
    model_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    window: Mutex<VecDeque<Instant>>,
    cumulative_cost: Mutex<f64>,
}

impl RouterClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let api_key = settings.api_key()?;
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("API key is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs_f64(settings.http.timeout_connect_secs))
            .timeout(Duration::from_secs_f64(settings.http.timeout_read_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: settings.http.base_url.trim_end_matches('/').to_string(),
            max_budget_usd: settings.budget.max_budget_usd,
            warn_at_fraction: settings.budget.warn_at_fraction,
            per_model_concurrency: settings.rate_limit.per_model_concurrency,
            global_limit: settings.rate_limit.global_requests_per_minute,
            retry: settings.retry.clone(),
            price_overrides: settings.price_overrides.clone(),
            model_gates: Mutex::new(HashMap::new()),
            window: Mutex::new(VecDeque::new()),
            cumulative_cost: Mutex::new(0.0),
        })
    }

    /// Total USD spent through this client so far.
    pub fn cumulative_cost_usd(&self) -> f64 {
        *self.cumulative_cost.lock().unwrap()
    }

    /// Lazily created concurrency gate for one model name.
    fn model_gate(&self, model: &str) -> Arc<Semaphore> {
        let mut gates = self.model_gates.lock().unwrap();
        gates
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_model_concurrency)))
            .clone()
    }

    /// Wait until the sliding 60s window admits one more request. Pruning is
    /// lazy; no background task touches the window.
    async fn respect_global_rate_limit(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().unwrap();
                match prune_and_admit(&mut window, Instant::now(), self.global_limit)
                {
                    None => return,
                    Some(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn build_payload(req: &ChatRequest<'_>) -> Value {
        let mut payload = json!({
            "model": req.model,
            "messages": [{"role": "user", "content": req.prompt}],
            "temperature": req.temperature,
        });
        if let Some(top_p) = req.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = req.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        // Reasoning models return incompatible payloads and burn tokens on
        // summaries unless told otherwise. Callers may still override.
        let reasoning_family = req.model.to_lowercase().starts_with("openai/o");
        if let Some(include) = req
            .include_reasoning
            .or(reasoning_family.then_some(false))
        {
            payload["include_reasoning"] = json!(include);
        }
        if let Some(effort) = req.reasoning_effort.or(reasoning_family.then_some("low")) {
            payload["reasoning"] = json!({"effort": effort});
        }
        payload
    }

    fn cost_for(&self, model: &str, header_price: Option<f64>, total_tokens: u32) -> f64 {
        if let Some(price) = header_price {
            return f64::from(total_tokens) / 1000.0 * price;
        }
        if let Some(price) = self.price_overrides.get(model) {
            return f64::from(total_tokens) / 1000.0 * price;
        }
        debug!(model, "no price information, cost recorded as zero");
        0.0
    }

    /// Perform one chat completion with the model's configured sampling.
    pub async fn chat(
        &self,
        model: &str,
        prompt: &str,
        temperature: f64,
    ) -> Result<RouterResponse, RouterError> {
        self.chat_with(ChatRequest::new(model, prompt, temperature))
            .await
    }

    /// Perform one chat completion.
    ///
    /// Checks the budget before any network activity, serializes per-model
    /// access through the model's gate, honors the global request window,
    /// and classifies failures into retryable and terminal classes.
    pub async fn chat_with(&self, req: ChatRequest<'_>) -> Result<RouterResponse, RouterError> {
        {
            let cost = self.cumulative_cost.lock().unwrap();
            if *cost >= self.max_budget_usd {
                return Err(RouterError::BudgetExceeded {
                    cumulative_cost_usd: *cost,
                    max_budget_usd: self.max_budget_usd,
                });
            }
        }

        let gate = self.model_gate(req.model);
        let _permit = gate.acquire().await.expect("model gate closed");

        let url = format!("{}/chat/completions", self.base_url);
        let payload = Self::build_payload(&req);

        let mut rate_limit_attempts: u32 = 0;
        let mut server_attempts: u32 = 0;
        let mut connection_started_at: Option<Instant> = None;

        for _ in 1..=self.retry.max_attempts {
            self.respect_global_rate_limit().await;

            let response = match self.http.post(&url).json(&payload).send().await {
                Ok(response) => response,
                Err(err) => {
                    let now = Instant::now();
                    let started = *connection_started_at.get_or_insert(now);
                    let ceiling =
                        Duration::from_secs_f64(self.retry.connection_retry_ceiling_secs);
                    if now.duration_since(started) > ceiling {
                        return Err(RouterError::Connection {
                            message: err.to_string(),
                        });
                    }
                    warn!(model = req.model, error = %err, "connection failed, retrying");
                    tokio::time::sleep(Duration::from_secs_f64(
                        self.retry.connection_retry_delay_secs,
                    ))
                    .await;
                    continue;
                }
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                rate_limit_attempts += 1;
                if rate_limit_attempts > self.retry.rate_limit_max_attempts {
                    return Err(RouterError::RateLimit {
                        attempts: rate_limit_attempts - 1,
                    });
                }
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok());
                let delay = rate_limit_delay(
                    retry_after,
                    rate_limit_attempts,
                    self.retry.rate_limit_max_delay_secs,
                );
                warn!(
                    model = req.model,
                    attempt = rate_limit_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if status.is_server_error() {
                server_attempts += 1;
                if server_attempts > self.retry.server_error_max_attempts {
                    return Err(RouterError::Server {
                        status: status.as_u16(),
                        attempts: server_attempts - 1,
                    });
                }
                let delay = Duration::from_secs_f64(
                    self.retry.server_error_step_secs * f64::from(server_attempts),
                );
                warn!(
                    model = req.model,
                    status = status.as_u16(),
                    attempt = server_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "server error, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(RouterError::Authentication {
                    status: status.as_u16(),
                });
            }

            if status.is_client_error() {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                return Err(RouterError::Api {
                    status: status.as_u16(),
                    message: message.chars().take(200).collect(),
                });
            }

            let header_price = response
                .headers()
                .get(PRICE_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|raw| match raw.parse::<f64>() {
                    Ok(price) => Some(price),
                    Err(_) => {
                        warn!(header_value = raw, "failed to parse price header");
                        None
                    }
                });

            let data: Value = response.json().await.map_err(|err| RouterError::Parse {
                message: format!("invalid JSON: {err}"),
            })?;

            let choices = data
                .get("choices")
                .and_then(Value::as_array)
                .filter(|choices| !choices.is_empty())
                .ok_or_else(|| RouterError::Parse {
                    message: "missing choices".to_string(),
                })?;
            let text = choices[0]
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .ok_or_else(|| RouterError::Parse {
                    message: "missing content".to_string(),
                })?
                .to_string();

            let (prompt_tokens, completion_tokens) = match data.get("usage") {
                Some(usage) => (
                    usage
                        .get("prompt_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                    usage
                        .get("completion_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                ),
                None => {
                    warn!(model = req.model, "usage missing, token counts default to 0");
                    (0, 0)
                }
            };

            let cost = self.cost_for(
                req.model,
                header_price,
                prompt_tokens + completion_tokens,
            );

            let cumulative = {
                let mut total = self.cumulative_cost.lock().unwrap();
                *total += cost;
                *total
            };

            // The request already happened; the response is still discarded
            // so the caller stops initiating further calls.
            if cumulative > self.max_budget_usd {
                warn!(cumulative_cost_usd = cumulative, "budget threshold crossed");
                return Err(RouterError::BudgetExceeded {
                    cumulative_cost_usd: cumulative,
                    max_budget_usd: self.max_budget_usd,
                });
            }
            if cumulative > self.max_budget_usd * self.warn_at_fraction {
                warn!(
                    cumulative_cost_usd = cumulative,
                    max_budget_usd = self.max_budget_usd,
                    "budget warning threshold crossed"
                );
            }

            return Ok(RouterResponse {
                text,
                prompt_tokens,
                completion_tokens,
                status_code: status.as_u16(),
                cost_usd: cost,
            });
        }

        Err(RouterError::RetriesExhausted {
            attempts: self.retry.max_attempts,
        })
    }
}

/// Prune entries older than the window, then either admit `now` (returning
/// None) or return how long the caller must wait for the oldest entry to
/// age out.
fn prune_and_admit(
    window: &mut VecDeque<Instant>,
    now: Instant,
    limit: usize,
) -> Option<Duration> {
    while window
        .front()
        .is_some_and(|t| now.duration_since(*t) >= WINDOW)
    {
        window.pop_front();
    }
    if window.len() < limit {
        window.push_back(now);
        return None;
    }
    let oldest = *window.front().expect("window non-empty at limit");
    Some((oldest + WINDOW).duration_since(now))
}

/// Backoff for a 429: the Retry-After header when parsable (capped), else
/// `2^attempt` seconds with jitter (also capped).
fn rate_limit_delay(retry_after_secs: Option<f64>, attempt: u32, cap_secs: f64) -> Duration {
    let secs = match retry_after_secs {
        Some(retry_after) => retry_after.min(cap_secs),
        None => {
            let base = 2.0_f64.powi(attempt as i32);
            let jitter: f64 = rand::thread_rng().gen_range(0.9..=1.1);
            (base * jitter).min(cap_secs)
        }
    };
    Duration::from_secs_f64(secs.max(0.0))
}
