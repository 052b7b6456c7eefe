use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StrategyConfig;
use crate::error::{ProviderFailure, ProviderResult, Result};
use super::common::{
    Credential, HttpCore, api_key, clean_response, failure_from_response, failure_from_transport,
    render_prompt,
};
use super::{CallContext, Capabilities, ProbeStatus, Provider, ProviderMetrics};

const API_VERSION: &str = "2023-06-01";

const DEFAULT_SYSTEM_MESSAGE: &str =
    "You are a translation engine for audio library filenames. Output only \
     the translated text with no explanation.";

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Anthropic messages API.
pub struct AnthropicProvider {
    /// Registry name, fixed at construction; config updates cannot rename
    name: String,
    core: HttpCore,
}

impl AnthropicProvider {
    pub fn new(config: StrategyConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            core: HttpCore::new(config)?,
        })
    }

    fn credential(&self, config: &StrategyConfig) -> ProviderResult<String> {
        match api_key(config) {
            Credential::Present(key) => Ok(key),
            Credential::Missing(var) => Err(ProviderFailure::Unavailable(format!(
                "credential environment variable {} is not set",
                var
            ))),
            Credential::NotRequired => Err(ProviderFailure::Unavailable(
                "anthropic strategy requires api_key_env in its config".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_batch: false,
            max_batch_size: 1,
            supported_languages: Vec::new(),
            requires_credential: true,
        }
    }

    fn metrics(&self) -> ProviderMetrics {
        self.core.metrics()
    }

    async fn translate(&self, text: &str, call: &CallContext) -> ProviderResult<String> {
        let snapshot = self.core.snapshot();
        let started = Instant::now();

        let key = self.credential(&snapshot.config).inspect_err(|_| {
            self.core.record(started, false);
        })?;

        let request = MessagesRequest {
            model: snapshot.config.model.clone(),
            max_tokens: 512,
            system: snapshot
                .config
                .system_message
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_MESSAGE.to_string()),
            messages: vec![Message {
                role: "user".to_string(),
                content: render_prompt(&snapshot.config, text, call),
            }],
        };

        let url = format!("{}/v1/messages", snapshot.config.endpoint);
        debug!("Sending translation request to: {}", url);

        let response = snapshot
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
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

        let messages: MessagesResponse = response.json().await.map_err(|e| {
            self.core.record(started, false);
            ProviderFailure::Unavailable(format!("failed to parse response: {}", e))
        })?;

        let Some(block) = messages.content.into_iter().next() else {
            self.core.record(started, false);
            return Err(ProviderFailure::Unavailable(
                "response carried no content".to_string(),
            ));
        };

        self.core.record(started, true);
        Ok(clean_response(&block.text))
    }

    async fn test_connection(&self) -> ProbeStatus {
        let snapshot = self.core.snapshot();
        let key = match self.credential(&snapshot.config) {
            Ok(key) => key,
            Err(e) => {
                return ProbeStatus::Unreachable {
                    reason: e.to_string(),
                };
            }
        };

        let started = Instant::now();
        let request = MessagesRequest {
            model: snapshot.config.model.clone(),
            max_tokens: 1,
            system: String::new(),
            messages: vec![Message {
                role: "user".to_string(),
                content: "ping".to_string(),
            }],
        };
        let url = format!("{}/v1/messages", snapshot.config.endpoint);

        match snapshot
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => ProbeStatus::Reachable {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(response) => ProbeStatus::Unreachable {
                reason: format!("HTTP {}", response.status().as_u16()),
            },
            Err(e) => ProbeStatus::Unreachable {
                reason: format!("failed to connect: {}", e),
            },
        }
    }

    fn update_config(&self, config: StrategyConfig) -> bool {
        self.core.update(config)
    }
}
