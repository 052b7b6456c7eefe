use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{Result, OtoyakuError};

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_call_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub segment: SegmentConfig,
    pub cache: CacheConfig,
    pub plugins: PluginConfig,
    /// Strategies registered at startup, before plugin discovery runs.
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Strategy tried first when a request names none
    pub default_strategy: String,
    /// Strategies tried in order after the default fails
    pub fallback_order: Vec<String>,
    /// Rate-limit retries per strategy before advancing to the next one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential rate-limit backoff
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Concurrent provider calls across all requests
    pub max_concurrency: usize,
    /// Wall-clock bound for a whole request, retries and backoff included
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Upper length bound for a segment, in characters
    pub max_segment_length: usize,
    /// Lower length bound; the final segment may be shorter
    pub min_segment_length: usize,
    /// Substrings matching these patterns pass through untranslated
    pub preserve_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Backing store for translated segments
    pub backend: CacheBackend,
    /// Entry-count budget for eviction
    pub max_entries: usize,
    /// Byte budget for eviction (source + translation estimate)
    pub max_bytes: usize,
    /// Entries older than this are logically expired
    pub ttl_secs: u64,
    /// Entry directory for the file backend
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process map, lost on restart
    Memory,
    /// One JSON entry file per key, shared between runs
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Directories scanned for strategy descriptor files
    pub locations: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Registry name, unique per engine instance
    pub name: String,
    /// Which adapter implementation to construct
    pub kind: ProviderKind,
    /// Base URL of the backend
    pub endpoint: String,
    /// Model identifier passed to the backend
    pub model: String,
    /// Environment variable holding the API credential
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Prompt override; `{text}` is replaced with the input
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// System message override for chat-style backends
    #[serde(default)]
    pub system_message: Option<String>,
    /// Per-call network timeout
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama daemon, `/api/generate` protocol
    Ollama,
    /// OpenAI-compatible chat completions (also DeepSeek, Zhipu, etc.)
    Openai,
    /// Anthropic messages API
    Anthropic,
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl StrategyConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                default_strategy: "ollama".to_string(),
                fallback_order: vec![],
                max_retries: 2,
                backoff_base_ms: 500,
                max_concurrency: 4,
                request_timeout_secs: 120,
            },
            segment: SegmentConfig {
                max_segment_length: 120,
                min_segment_length: 8,
                preserve_patterns: vec![
                    r"\{.*?\}".to_string(),
                    r"\$\w+".to_string(),
                    r"<.*?>".to_string(),
                ],
            },
            cache: CacheConfig {
                enabled: true,
                backend: CacheBackend::Memory,
                max_entries: 4096,
                max_bytes: 8 * 1024 * 1024,
                ttl_secs: 86400,
                dir: PathBuf::from(".otoyaku/cache/translations"),
            },
            plugins: PluginConfig {
                locations: vec![PathBuf::from("plugins/strategies")],
            },
            strategies: vec![StrategyConfig {
                name: "ollama".to_string(),
                kind: ProviderKind::Ollama,
                endpoint: "http://localhost:11434".to_string(),
                model: "llama3.2:3b".to_string(),
                api_key_env: None,
                prompt_template: None,
                system_message: None,
                call_timeout_secs: 30,
            }],
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OtoyakuError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| OtoyakuError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| OtoyakuError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| OtoyakuError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}
