// Pluggable provider adapters behind one capability contract.
//
// Each adapter wraps a remote translation backend. The registry hands out
// Arc'd instances; in-flight calls keep whatever instance they captured, so
// unregistering or hot-reloading never tears a running call.

pub mod common;
pub mod ollama;
pub mod openai;
pub mod anthropic;
pub mod registry;
pub mod loader;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ProviderKind, StrategyConfig};
use crate::error::{ProviderResult, Result};

pub use registry::StrategyRegistry;
pub use loader::{PluginCandidate, StrategyLoader};

/// Fields an adapter needs from the surrounding request. Deliberately small:
/// adapters are stateless per call beyond their connection config.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub source_lang: String,
    pub target_lang: String,
    /// Domain hint woven into the prompt when present
    pub domain: Option<String>,
}

/// Static capability set, fixed at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the backend accepts batched payloads natively
    pub supports_batch: bool,
    pub max_batch_size: usize,
    /// Empty means unrestricted
    pub supported_languages: Vec<String>,
    pub requires_credential: bool,
}

/// Snapshot of an adapter's running counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_latency_ms: u64,
}

/// Result of a side-effect-free liveness probe. Probes never fail; an
/// unreachable backend is a value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStatus {
    Reachable { latency_ms: u64 },
    Unreachable { reason: String },
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reachable { latency_ms } => write!(f, "reachable ({} ms)", latency_ms),
            Self::Unreachable { reason } => write!(f, "unreachable: {}", reason),
        }
    }
}

/// Registry metadata for one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub capabilities: Capabilities,
    pub metrics: ProviderMetrics,
}

/// Uniform contract over one remote translation backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Pure; computed once at construction.
    fn capabilities(&self) -> Capabilities;

    /// Updated after every call attempt, success and failure alike.
    fn metrics(&self) -> ProviderMetrics;

    async fn translate(&self, text: &str, call: &CallContext) -> ProviderResult<String>;

    /// All-or-nothing: either every text translates or the whole batch
    /// fails. Finer-grained retry belongs to the manager.
    async fn translate_batch(
        &self,
        texts: &[String],
        call: &CallContext,
    ) -> ProviderResult<Vec<String>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.translate(text, call).await?);
        }
        Ok(results)
    }

    async fn test_connection(&self) -> ProbeStatus;

    /// Atomic connection-parameter swap: a concurrent in-flight call sees
    /// either the old config or the new one, never a mix.
    fn update_config(&self, config: StrategyConfig) -> bool;
}

/// Explicit construction table, one entry per adapter kind. Plugins name a
/// kind in their descriptor file instead of shipping code.
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn build(config: &StrategyConfig) -> Result<Arc<dyn Provider>> {
        let provider: Arc<dyn Provider> = match config.kind {
            ProviderKind::Ollama => Arc::new(ollama::OllamaProvider::new(config.clone())?),
            ProviderKind::Openai => Arc::new(openai::OpenAiProvider::new(config.clone())?),
            ProviderKind::Anthropic => {
                Arc::new(anthropic::AnthropicProvider::new(config.clone())?)
            }
        };
        Ok(provider)
    }
}
