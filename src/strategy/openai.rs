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

const DEFAULT_SYSTEM_MESSAGE: &str =
    "You are a translation engine for audio library filenames. Output only \
     the translated text with no explanation.";

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// OpenAI-compatible chat completions. The endpoint override makes this the
/// adapter for DeepSeek, Zhipu, Alibaba, and every other lookalike API.
pub struct OpenAiProvider {
    /// Registry name, fixed at construction; config updates cannot rename
    name: String,
    core: HttpCore,
}

impl OpenAiProvider {
    pub fn new(config: StrategyConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            core: HttpCore::new(config)?,
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
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

        let key = match api_key(&snapshot.config) {
            Credential::Present(key) => Some(key),
            Credential::NotRequired => None,
            Credential::Missing(var) => {
                self.core.record(started, false);
                return Err(ProviderFailure::Unavailable(format!(
                    "credential environment variable {} is not set",
                    var
                )));
            }
        };

        let system = snapshot
            .config
            .system_message
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_MESSAGE.to_string());
        let request = ChatRequest {
            model: snapshot.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: render_prompt(&snapshot.config, text, call),
                },
            ],
            temperature: 0.2,
        };

        let url = format!("{}/v1/chat/completions", snapshot.config.endpoint);
        debug!("Sending translation request to: {}", url);
        let mut builder = snapshot.client.post(&url).json(&request);
        if let Some(key) = key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            self.core.record(started, false);
            failure_from_transport(e)
        })?;

        if !response.status().is_success() {
            self.core.record(started, false);
            return Err(failure_from_response(response).await);
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            self.core.record(started, false);
            ProviderFailure::Unavailable(format!("failed to parse response: {}", e))
        })?;

        let Some(choice) = chat.choices.into_iter().next() else {
            self.core.record(started, false);
            return Err(ProviderFailure::Unavailable(
                "response carried no choices".to_string(),
            ));
        };

        self.core.record(started, true);
        Ok(clean_response(&choice.message.content))
    }

    async fn test_connection(&self) -> ProbeStatus {
        let snapshot = self.core.snapshot();
        let started = Instant::now();
        let url = format!("{}/v1/models", snapshot.config.endpoint);
        let mut builder = snapshot.client.get(&url);
        if let Credential::Present(key) = api_key(&snapshot.config) {
            builder = builder.bearer_auth(key);
        }

        match builder.send().await {
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
