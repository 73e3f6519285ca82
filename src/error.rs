//! Error types for the benchmark pipeline.

/// Errors raised by the router client.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Cumulative spend reached the configured ceiling. Fatal to the run.
    #[error("budget exhausted: ${cumulative_cost_usd:.4} of ${max_budget_usd:.4} spent")]
    BudgetExceeded {
        cumulative_cost_usd: f64,
        max_budget_usd: f64,
    },

    /// HTTP 429 persisted beyond the retry allowance.
    #[error("rate limit retries exhausted after {attempts} attempts")]
    RateLimit { attempts: u32 },

    /// HTTP 5xx persisted beyond the retry allowance.
    #[error("server error {status} after {attempts} attempts")]
    Server { status: u16, attempts: u32 },

    /// Network connectivity failed for longer than the retry ceiling.
    #[error("connection retry budget exhausted: {message}")]
    Connection { message: String },

    /// HTTP 401/403 — retrying cannot help. Fatal to the run.
    #[error("authentication failed with status {status}")]
    Authentication { status: u16 },

    /// Any other non-success status, non-retryable.
    #[error("http error {status}: {message}")]
    Api { status: u16, message: String },

    /// Malformed JSON payload or missing expected fields.
    #[error("unparsable response: {message}")]
    Parse { message: String },

    /// The bounded retry loop ran out of total attempts.
    #[error("exhausted retries after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl RouterError {
    /// True for failures that must terminate the whole run, not just the
    /// current attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BudgetExceeded { .. } | Self::Authentication { .. }
        )
    }
}

/// Errors surfaced by orchestrators and storage.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("prompt template missing at {path}")]
    PromptMissing { path: String },

    #[error("unknown models requested: {names}")]
    UnknownModels { names: String },

    #[error("judge response missing begruendung")]
    MissingJustification,
}

impl BenchError {
    /// Run-terminating errors; everything else is logged and the next unit
    /// of work proceeds.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Router(e) if e.is_fatal())
    }
}

/// Result type for benchmark operations.
pub type BenchResult<T> = Result<T, BenchError>;
