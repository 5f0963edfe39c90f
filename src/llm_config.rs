//! LLM and embedding model configuration service

use crate::error::{EngineError, EngineResult};
use crate::provider::{self, ChatMessage, LlmCallParams};
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Gemini => "gemini",
            LlmProvider::Ollama => "ollama",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(LlmProvider::OpenAi),
            "anthropic" => Some(LlmProvider::Anthropic),
            "gemini" => Some(LlmProvider::Gemini),
            "ollama" => Some(LlmProvider::Ollama),
            _ => None,
        }
    }
}

/// Infer the provider from an endpoint URL. Ollama's default port and
/// the provider hostnames are the signals; openai is the fallback.
pub fn detect_provider(endpoint: &str) -> LlmProvider {
    let endpoint = endpoint.to_lowercase();
    if endpoint.contains("11434") || endpoint.contains("ollama") {
        LlmProvider::Ollama
    } else if endpoint.contains("anthropic") {
        LlmProvider::Anthropic
    } else if endpoint.contains("generativelanguage") || endpoint.contains("gemini") {
        LlmProvider::Gemini
    } else {
        LlmProvider::OpenAi
    }
}

/// LLM model configuration row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModelConfig {
    pub name: String,
    pub provider: LlmProvider,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model_name: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Embedding model configuration row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModelConfig {
    pub name: String,
    pub provider: LlmProvider,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model_name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub dimensions: i64,
}

/// Result of a provider connection test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: i64,
}

/// Build provider-agnostic call parameters from a model config.
///
/// Ollama models get an `ollama/` prefix and a base URL stripped of any
/// `/v1/...` suffix; ollama carries no API key. Other providers pass
/// through with endpoint and key as configured.
pub fn prepare_llm_call(
    config: &LlmModelConfig,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
    timeout: Option<Duration>,
) -> LlmCallParams {
    match config.provider {
        LlmProvider::Ollama => LlmCallParams {
            model: format!("ollama/{}", config.model_name),
            api_base: strip_v1_suffix(&config.endpoint),
            api_key: None,
            messages,
            temperature,
            max_tokens,
            timeout,
            metadata_trace_id: None,
        },
        _ => LlmCallParams {
            model: config.model_name.clone(),
            api_base: config.endpoint.clone(),
            api_key: (!config.api_key.is_empty()).then(|| config.api_key.clone()),
            messages,
            temperature,
            max_tokens,
            timeout,
            metadata_trace_id: None,
        },
    }
}

fn strip_v1_suffix(endpoint: &str) -> String {
    match endpoint.find("/v1") {
        Some(index) => endpoint[..index].to_string(),
        None => endpoint.trim_end_matches('/').to_string(),
    }
}

/// Centralized manager for LLM and embedding configurations
#[derive(Clone)]
pub struct LlmConfigManager {
    storage: Storage,
}

impl LlmConfigManager {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Resolve an LLM config by name, or fall back so blocks always have
    /// a model: requested name, then the default-flagged row, then the
    /// first row, then the env-derived config.
    pub async fn get_llm_model(&self, name: Option<&str>) -> EngineResult<LlmModelConfig> {
        if let Some(name) = name {
            return self
                .storage
                .get_llm_model(name)
                .await?
                .ok_or_else(|| EngineError::LlmConfigNotFound(format!("llm model '{name}'")));
        }

        let models = self.storage.list_llm_models().await?;
        if let Some(default) = models.iter().find(|m| m.is_default) {
            return Ok(default.clone());
        }
        if let Some(first) = models.first() {
            return Ok(first.clone());
        }
        if let Some(config) = env_fallback_config() {
            return Ok(config);
        }
        Err(EngineError::LlmConfigNotFound(
            "no llm models configured and no env fallback available".to_string(),
        ))
    }

    pub async fn list_llm_models(&self) -> EngineResult<Vec<LlmModelConfig>> {
        self.storage.list_llm_models().await
    }

    pub async fn save_llm_model(&self, config: &LlmModelConfig) -> EngineResult<()> {
        self.storage.save_llm_model(config).await
    }

    pub async fn delete_llm_model(&self, name: &str) -> EngineResult<()> {
        if !self.storage.delete_llm_model(name).await? {
            return Err(EngineError::LlmConfigNotFound(format!("llm model '{name}'")));
        }
        Ok(())
    }

    pub async fn set_default_llm_model(&self, name: &str) -> EngineResult<()> {
        if !self.storage.set_default_llm_model(name).await? {
            return Err(EngineError::LlmConfigNotFound(format!("llm model '{name}'")));
        }
        Ok(())
    }

    /// Issue a minimal chat call to validate connectivity before saving
    pub async fn test_llm_connection(&self, config: &LlmModelConfig) -> ConnectionTestResult {
        let params = prepare_llm_call(
            config,
            vec![ChatMessage::user("Say hello")],
            0.0,
            10,
            Some(Duration::from_secs(10)),
        );
        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(10), provider::complete(&params)).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(Ok(_)) => ConnectionTestResult {
                success: true,
                message: "connection successful".to_string(),
                latency_ms,
            },
            Ok(Err(e)) => ConnectionTestResult {
                success: false,
                message: format!("connection failed: {e}"),
                latency_ms,
            },
            Err(_) => ConnectionTestResult {
                success: false,
                message: "connection failed: timed out after 10s".to_string(),
                latency_ms,
            },
        }
    }

    /// Resolve an embedding config: requested name, default-flagged row,
    /// first row. Embeddings have no env fallback.
    pub async fn get_embedding_model(
        &self,
        name: Option<&str>,
    ) -> EngineResult<EmbeddingModelConfig> {
        if let Some(name) = name {
            return self.storage.get_embedding_model(name).await?.ok_or_else(|| {
                EngineError::LlmConfigNotFound(format!("embedding model '{name}'"))
            });
        }

        let models = self.storage.list_embedding_models().await?;
        if let Some(default) = models.iter().find(|m| m.is_default) {
            return Ok(default.clone());
        }
        models.into_iter().next().ok_or_else(|| {
            EngineError::LlmConfigNotFound("no embedding models configured".to_string())
        })
    }

    pub async fn list_embedding_models(&self) -> EngineResult<Vec<EmbeddingModelConfig>> {
        self.storage.list_embedding_models().await
    }

    pub async fn save_embedding_model(&self, config: &EmbeddingModelConfig) -> EngineResult<()> {
        self.storage.save_embedding_model(config).await
    }

    pub async fn delete_embedding_model(&self, name: &str) -> EngineResult<()> {
        if !self.storage.delete_embedding_model(name).await? {
            return Err(EngineError::LlmConfigNotFound(format!(
                "embedding model '{name}'"
            )));
        }
        Ok(())
    }

    /// Issue a minimal embedding call to validate connectivity
    pub async fn test_embedding_connection(
        &self,
        config: &EmbeddingModelConfig,
    ) -> ConnectionTestResult {
        let chat_shape = LlmModelConfig {
            name: config.name.clone(),
            provider: config.provider,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model_name: config.model_name.clone(),
            is_default: config.is_default,
        };
        let params = prepare_llm_call(&chat_shape, Vec::new(), 0.0, 0, Some(Duration::from_secs(10)));
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(Duration::from_secs(10), provider::embed(&params, "test")).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(Ok(_)) => ConnectionTestResult {
                success: true,
                message: "connection successful".to_string(),
                latency_ms,
            },
            Ok(Err(e)) => ConnectionTestResult {
                success: false,
                message: format!("connection failed: {e}"),
                latency_ms,
            },
            Err(_) => ConnectionTestResult {
                success: false,
                message: "connection failed: timed out after 10s".to_string(),
                latency_ms,
            },
        }
    }
}

/// Config derived from `LLM_ENDPOINT`/`LLM_API_KEY`/`LLM_MODEL`, if set
fn env_fallback_config() -> Option<LlmModelConfig> {
    let endpoint = std::env::var("LLM_ENDPOINT").unwrap_or_default();
    let model = std::env::var("LLM_MODEL").unwrap_or_default();
    if endpoint.is_empty() || model.is_empty() {
        return None;
    }
    Some(LlmModelConfig {
        name: "env-fallback".to_string(),
        provider: detect_provider(&endpoint),
        endpoint,
        api_key: std::env::var("LLM_API_KEY").unwrap_or_default(),
        model_name: model,
        is_default: false,
    })
}

static GLOBAL_MANAGER: OnceLock<parking_lot::RwLock<Option<LlmConfigManager>>> = OnceLock::new();

fn global_slot() -> &'static parking_lot::RwLock<Option<LlmConfigManager>> {
    GLOBAL_MANAGER.get_or_init(|| parking_lot::RwLock::new(None))
}

/// Install the process-wide manager used by blocks that resolve model
/// configs by name
pub fn set_global_manager(manager: LlmConfigManager) {
    *global_slot().write() = Some(manager);
}

/// Resolve a model through the global manager, falling back to the
/// env-derived config when no manager is installed
pub async fn resolve_model(name: Option<&str>) -> EngineResult<LlmModelConfig> {
    let manager = global_slot().read().clone();
    match manager {
        Some(manager) => manager.get_llm_model(name).await,
        None => env_fallback_config().ok_or_else(|| {
            EngineError::LlmConfigNotFound(
                "no llm config manager installed and no env fallback available".to_string(),
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_detection() {
        assert_eq!(detect_provider("http://localhost:11434/v1"), LlmProvider::Ollama);
        assert_eq!(detect_provider("https://my-ollama.host/api"), LlmProvider::Ollama);
        assert_eq!(
            detect_provider("https://api.anthropic.com/v1"),
            LlmProvider::Anthropic
        );
        assert_eq!(
            detect_provider("https://generativelanguage.googleapis.com/v1beta"),
            LlmProvider::Gemini
        );
        assert_eq!(detect_provider("https://api.openai.com/v1"), LlmProvider::OpenAi);
        assert_eq!(detect_provider("https://unknown.example.com"), LlmProvider::OpenAi);
    }

    #[test]
    fn ollama_call_params_strip_v1_and_key() {
        let config = LlmModelConfig {
            name: "local".to_string(),
            provider: LlmProvider::Ollama,
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            api_key: "ignored".to_string(),
            model_name: "llama3".to_string(),
            is_default: false,
        };
        let params = prepare_llm_call(&config, Vec::new(), 0.7, 128, None);
        assert_eq!(params.model, "ollama/llama3");
        assert_eq!(params.api_base, "http://localhost:11434");
        assert!(params.api_key.is_none());
    }

    #[test]
    fn openai_call_params_pass_through() {
        let config = LlmModelConfig {
            name: "prod".to_string(),
            provider: LlmProvider::OpenAi,
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: "sk-test".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            is_default: true,
        };
        let params = prepare_llm_call(&config, Vec::new(), 0.7, 128, None);
        assert_eq!(params.model, "gpt-4o-mini");
        assert_eq!(params.api_base, "https://api.openai.com/v1");
        assert_eq!(params.api_key.as_deref(), Some("sk-test"));
    }
}
