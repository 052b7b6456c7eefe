use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::StrategyConfig;
use crate::error::{ProviderFailure, ProviderResult, Result};
use super::common::{HttpCore, clean_response, failure_from_response, failure_from_transport, render_prompt};
use super::{CallContext, Capabilities, ProbeStatus, Provider, ProviderMetrics};

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResult {
    text: String,
}

/// Local Ollama daemon. Requests the structured JSON output format and falls
/// back to response cleaning when the model ignores it.
pub struct OllamaProvider {
    /// Registry name, fixed at construction; config updates cannot rename
    name: String,
    core: HttpCore,
}

impl OllamaProvider {
    pub fn new(config: StrategyConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            core: HttpCore::new(config)?,
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_batch: false,
            max_batch_size: 1,
            supported_languages: Vec::new(),
            requires_credential: false,
        }
    }

    fn metrics(&self) -> ProviderMetrics {
        self.core.metrics()
    }

    async fn translate(&self, text: &str, call: &CallContext) -> ProviderResult<String> {
        let snapshot = self.core.snapshot();
        let started = Instant::now();

        let request = GenerateRequest {
            model: snapshot.config.model.clone(),
            prompt: render_prompt(&snapshot.config, text, call),
            stream: false,
            format: "json".to_string(),
        };
        let url = format!("{}/api/generate", snapshot.config.endpoint);
        debug!("Sending translation request to: {}", url);

        let response = snapshot
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                self.core.record(started, false);
                failure_from_transport(e)
            })?;

        if !response.status().is_success() {
            self.core.record(started, false);
            return Err(failure_from_response(response).await);
        }

        let generated: GenerateResponse = response.json().await.map_err(|e| {
            self.core.record(started, false);
            ProviderFailure::Unavailable(format!("failed to parse response: {}", e))
        })?;

        let raw = generated.response.trim().to_string();
        if raw.is_empty() {
            self.core.record(started, false);
            return Err(ProviderFailure::Unavailable(
                "empty translation received".to_string(),
            ));
        }

        self.core.record(started, true);
        if let Ok(result) = serde_json::from_str::<GenerateResult>(&raw) {
            return Ok(result.text.trim().to_string());
        }
        Ok(clean_response(&raw))
    }

    async fn test_connection(&self) -> ProbeStatus {
        let snapshot = self.core.snapshot();
        let started = Instant::now();
        let url = format!("{}/api/show", snapshot.config.endpoint);
        let request = json!({ "name": snapshot.config.model });

        match snapshot.client.post(&url).json(&request).send().await {
            Ok(response) if response.status().is_success() => ProbeStatus::Reachable {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(response) => ProbeStatus::Unreachable {
                reason: format!(
                    "model '{}' not found (HTTP {}); pull it first: ollama pull {}",
                    snapshot.config.model,
                    response.status().as_u16(),
                    snapshot.config.model
                ),
            },
            Err(e) => ProbeStatus::Unreachable {
                reason: format!("failed to connect to Ollama: {}", e),
            },
        }
    }

    fn update_config(&self, config: StrategyConfig) -> bool {
        self.core.update(config)
    }
}
