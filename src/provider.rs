//! Opaque provider gateway
//!
//! The core treats LLM and embedding providers as opaque callable
//! services behind the [`ChatService`] and [`EmbeddingService`] traits.
//! A process-global gateway owns the active adapter (swappable for
//! tests) and fires the usage-tracker success hook after each call.

use crate::error::{EngineError, EngineResult};
use crate::pipeline::TokenCounts;
use crate::usage_tracker::UsageTracker;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// One chat message in provider-agnostic form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Provider-agnostic call parameters produced by
/// [`crate::llm_config::prepare_llm_call`]
#[derive(Debug, Clone)]
pub struct LlmCallParams {
    /// Model identifier; ollama models carry an `ollama/` prefix
    pub model: String,
    /// Base URL of the provider endpoint
    pub api_base: String,
    /// API key, absent for ollama
    pub api_key: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Per-call timeout; only connection tests set this
    pub timeout: Option<Duration>,
    /// Trace id forwarded to the usage-tracker success hook
    pub metadata_trace_id: Option<String>,
}

/// Response of a chat completion call
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<TokenCounts>,
}

/// Chat completion service consumed by blocks and the connection test
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn complete(&self, params: &LlmCallParams) -> EngineResult<ChatResponse>;
}

/// Embedding service consumed by the embedding connection test
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, params: &LlmCallParams, input: &str) -> EngineResult<Vec<f64>>;
}

/// Default adapter speaking the OpenAI-compatible HTTP dialect
pub struct HttpChatService {
    client: reqwest::Client,
}

impl HttpChatService {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn completions_url(api_base: &str) -> String {
        let base = api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn embeddings_url(api_base: &str) -> String {
        let base = api_base.trim_end_matches('/');
        if base.ends_with("/embeddings") {
            base.to_string()
        } else {
            format!("{base}/embeddings")
        }
    }

    fn parse_usage(body: &Value) -> Option<TokenCounts> {
        let usage = body.get("usage")?;
        Some(TokenCounts {
            input_tokens: usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0),
            output_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            cached_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
    }
}

impl Default for HttpChatService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatService for HttpChatService {
    async fn complete(&self, params: &LlmCallParams) -> EngineResult<ChatResponse> {
        let url = Self::completions_url(&params.api_base);
        let body = json!({
            "model": params.model,
            "messages": params.messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &params.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(timeout) = params.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Provider(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))?;

        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Provider("response carried no message content".to_string())
            })?
            .to_string();

        Ok(ChatResponse {
            content,
            usage: Self::parse_usage(&body),
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpChatService {
    async fn embed(&self, params: &LlmCallParams, input: &str) -> EngineResult<Vec<f64>> {
        let url = Self::embeddings_url(&params.api_base);
        let body = json!({ "model": params.model, "input": input });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &params.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(timeout) = params.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Provider(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))?;

        let embedding = body
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("embedding"))
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::Provider("response carried no embedding".to_string()))?
            .iter()
            .filter_map(Value::as_f64)
            .collect();
        Ok(embedding)
    }
}

struct Gateway {
    chat: RwLock<Arc<dyn ChatService>>,
    embedding: RwLock<Arc<dyn EmbeddingService>>,
}

fn gateway() -> &'static Gateway {
    static GATEWAY: OnceLock<Gateway> = OnceLock::new();
    GATEWAY.get_or_init(|| Gateway {
        chat: RwLock::new(Arc::new(HttpChatService::new())),
        embedding: RwLock::new(Arc::new(HttpChatService::new())),
    })
}

/// Swap the active chat adapter (tests install mocks here)
pub fn set_chat_service(service: Arc<dyn ChatService>) {
    *gateway().chat.write() = service;
}

/// Swap the active embedding adapter
pub fn set_embedding_service(service: Arc<dyn EmbeddingService>) {
    *gateway().embedding.write() = service;
}

/// Issue a chat completion through the active adapter. On success the
/// usage-tracker hook fires with the call's trace id (metadata first,
/// worker-local binding as fallback).
pub async fn complete(params: &LlmCallParams) -> EngineResult<ChatResponse> {
    let service = gateway().chat.read().clone();
    let response = service.complete(params).await?;
    if let Some(usage) = &response.usage {
        UsageTracker::global().on_provider_success(params.metadata_trace_id.as_deref(), usage);
    }
    Ok(response)
}

/// Issue an embedding call through the active adapter
pub async fn embed(params: &LlmCallParams, input: &str) -> EngineResult<Vec<f64>> {
    let service = gateway().embedding.read().clone();
    service.embed(params, input).await
}
