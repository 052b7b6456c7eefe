use thiserror::Error;

/// Failure classification for a single provider call.
///
/// Carried by value through the fallback chain so the manager can decide
/// whether to retry, advance to the next strategy, or give up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    /// Network, auth, or server-side failure. Not retried against the same
    /// strategy; the fallback chain advances.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The backend asked us to slow down. Retried with exponential backoff
    /// up to the configured cap; `retry_after_ms` overrides the computed
    /// delay when the backend supplied one.
    #[error("provider rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Content or policy rejection. Never retried against the same strategy
    /// for this input, but the next fallback strategy still gets a chance.
    #[error("provider rejected the request: {0}")]
    Rejected(String),
}

/// One entry in the diagnostics attached to `AllStrategiesExhausted`.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyFailure {
    pub strategy: String,
    pub failure: ProviderFailure,
}

#[derive(Error, Debug)]
pub enum OtoyakuError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Provider(#[from] ProviderFailure),

    #[error("no strategy registered under name: {0}")]
    StrategyNotFound(String),

    #[error("{}", render_exhausted(.0))]
    AllStrategiesExhausted(Vec<StrategyFailure>),

    #[error("request canceled")]
    Canceled,

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

fn render_exhausted(failures: &[StrategyFailure]) -> String {
    let reasons: Vec<String> = failures
        .iter()
        .map(|f| format!("{}: {}", f.strategy, f.failure))
        .collect();
    format!(
        "all {} strategies failed; reasons: [{}]",
        failures.len(),
        reasons.join("; ")
    )
}

pub type Result<T> = std::result::Result<T, OtoyakuError>;

/// Per-call result for provider adapters.
pub type ProviderResult<T> = std::result::Result<T, ProviderFailure>;
