use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::StrategyConfig;
use crate::error::{OtoyakuError, ProviderFailure, Result};
use super::{CallContext, ProviderMetrics};

/// Immutable view of one configuration generation: the parameters plus the
/// client built from them. Swapped whole on `update_config`, so a call that
/// grabbed a snapshot keeps a consistent pair for its entire lifetime.
pub struct Snapshot {
    pub config: StrategyConfig,
    pub client: Client,
}

/// Connection state and counters shared by every HTTP-backed adapter.
pub struct HttpCore {
    snapshot: RwLock<std::sync::Arc<Snapshot>>,
    total_requests: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl HttpCore {
    pub fn new(config: StrategyConfig) -> Result<Self> {
        let snapshot = Self::build_snapshot(config)?;
        Ok(Self {
            snapshot: RwLock::new(std::sync::Arc::new(snapshot)),
            total_requests: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
        })
    }

    fn build_snapshot(config: StrategyConfig) -> Result<Snapshot> {
        let client = Client::builder()
            .timeout(config.call_timeout())
            .build()
            .map_err(|e| OtoyakuError::Config(format!("HTTP client creation failed: {}", e)))?;
        Ok(Snapshot { config, client })
    }

    pub fn snapshot(&self) -> std::sync::Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace connection parameters atomically. Returns false when the new
    /// config cannot produce a working client; the old snapshot stays.
    pub fn update(&self, config: StrategyConfig) -> bool {
        match Self::build_snapshot(config) {
            Ok(snapshot) => {
                let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
                *guard = std::sync::Arc::new(snapshot);
                true
            }
            Err(e) => {
                warn!("Rejected config update: {}", e);
                false
            }
        }
    }

    pub fn record(&self, started: Instant, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> ProviderMetrics {
        let total = self.total_requests.load(Ordering::Relaxed);
        ProviderMetrics {
            total_requests: total,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            average_latency_ms: if total == 0 {
                0
            } else {
                self.total_latency_ms.load(Ordering::Relaxed) / total
            },
        }
    }
}

/// Resolve the credential named by `api_key_env`, when one is configured.
pub fn api_key(config: &StrategyConfig) -> Credential {
    match &config.api_key_env {
        Some(var) => match std::env::var(var) {
            Ok(key) if !key.is_empty() => Credential::Present(key),
            _ => Credential::Missing(var.clone()),
        },
        None => Credential::NotRequired,
    }
}

pub enum Credential {
    Present(String),
    Missing(String),
    NotRequired,
}

/// Map a network-level send error onto the failure taxonomy.
pub fn failure_from_transport(error: reqwest::Error) -> ProviderFailure {
    if error.is_timeout() {
        ProviderFailure::Unavailable(format!("request timed out: {}", error))
    } else {
        ProviderFailure::Unavailable(format!("request failed: {}", error))
    }
}

/// Consume an unsuccessful response and classify it. 429 carries the
/// backend's Retry-After as a backoff hint; 4xx content errors are
/// rejections (not retryable anywhere on this strategy); everything else is
/// unavailability.
pub async fn failure_from_response(response: Response) -> ProviderFailure {
    let status = response.status();
    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs * 1000);
    let body = response.text().await.unwrap_or_default();
    let summary = summarize(&body);

    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderFailure::RateLimited {
            message: format!("HTTP 429: {}", summary),
            retry_after_ms,
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderFailure::Rejected(format!("HTTP {}: {}", status.as_u16(), summary))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderFailure::Unavailable(format!("auth failure, HTTP {}: {}", status.as_u16(), summary))
        }
        _ => ProviderFailure::Unavailable(format!("HTTP {}: {}", status.as_u16(), summary)),
    }
}

fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        let head: String = trimmed.chars().take(200).collect();
        format!("{}...", head)
    } else {
        trimmed.to_string()
    }
}

const DEFAULT_PROMPT: &str = "You are a professional translator for audio library filenames.\n\
     \n\
     Translate the text from {source} to {target} ONLY. Keep it short and\n\
     suitable for a filename: no explanations, no alternatives, no\n\
     punctuation that was not in the input. Tokens between \u{E000} and\n\
     \u{E001} are internal markers and must be copied through unchanged.\n\
     \n\
     Text to translate: {text}";

/// Render the prompt for a call: the strategy's template when configured
/// (with `{text}` substitution, recovered behavior from the desktop tool),
/// otherwise the built-in filename-oriented prompt.
pub fn render_prompt(config: &StrategyConfig, text: &str, call: &CallContext) -> String {
    let template = config.prompt_template.as_deref().unwrap_or(DEFAULT_PROMPT);
    let mut prompt = template
        .replace("{text}", text)
        .replace("{source}", &language_name(&call.source_lang))
        .replace("{target}", &language_name(&call.target_lang));
    if let Some(domain) = &call.domain {
        prompt.push_str(&format!("\n\nDomain context (do not translate): {}", domain));
    }
    debug!("Rendered prompt of {} chars", prompt.len());
    prompt
}

/// Full language name for clearer prompts; falls back to the tag itself.
pub fn language_name(code: &str) -> String {
    match code.to_lowercase().as_str() {
        "en" => "English",
        "ja" => "Japanese",
        "ko" => "Korean",
        "zh" => "Chinese",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "ru" => "Russian",
        "it" => "Italian",
        "pt" => "Portuguese",
        "pl" => "Polish",
        "nl" => "Dutch",
        "tr" => "Turkish",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "th" => "Thai",
        "vi" => "Vietnamese",
        "sv" => "Swedish",
        "da" => "Danish",
        "no" => "Norwegian",
        "fi" => "Finnish",
        "cs" => "Czech",
        "uk" => "Ukrainian",
        _ => return code.to_string(),
    }
    .to_string()
}

/// Strip the framing a chat backend tends to wrap around a short answer:
/// surrounding quotes, "Translation:" prefixes, markdown emphasis.
pub fn clean_response(raw: &str) -> String {
    let mut cleaned = raw.trim();
    for prefix in ["Translation:", "translation:", "Translated:"] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.trim();
        }
    }
    let cleaned = cleaned.trim_matches(|c| c == '"' || c == '\'' || c == '`');
    let cleaned = cleaned.trim_matches('*').trim();
    cleaned.to_string()
}
