//! LLM text generation block

use crate::blocks::{parse_config, Block, BlockFactory, BlockOutput, BlockSpec, ConfigSchema, ParamSchema, USAGE_KEY};
use crate::context::BlockExecutionContext;
use crate::error::EngineResult;
use crate::llm_config::{self, prepare_llm_call};
use crate::provider::{self, ChatMessage};
use crate::render::render_template;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TextGeneratorConfig {
    model: Option<String>,
    temperature: f64,
    max_tokens: u32,
    system_prompt: String,
    user_prompt: String,
}

impl Default for TextGeneratorConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: 2048,
            system_prompt: String::new(),
            user_prompt: String::new(),
        }
    }
}

/// Generate text with the configured LLM. Prompts are templates rendered
/// against accumulated state; the configured prompts win over `system`/
/// `user` fields already present in state.
pub struct TextGenerator {
    model: Option<String>,
    temperature: f64,
    max_tokens: u32,
    system_prompt: String,
    user_prompt: String,
}

impl TextGenerator {
    pub fn spec() -> BlockSpec {
        BlockSpec {
            type_name: "TextGenerator".to_string(),
            name: "Text Generator".to_string(),
            description: "Generate text using LLM with configurable parameters".to_string(),
            category: "generators".to_string(),
            inputs: vec![],
            outputs: vec![
                "assistant".to_string(),
                "system".to_string(),
                "user".to_string(),
            ],
            is_multiplier: false,
            dependencies: vec![],
            config_schema: ConfigSchema::new()
                .property(
                    "model",
                    ParamSchema::new("string")
                        .with_description("Select LLM model to use (leave empty for default)"),
                )
                .property(
                    "temperature",
                    ParamSchema::new("number").with_default(json!(0.7)),
                )
                .property(
                    "max_tokens",
                    ParamSchema::new("integer").with_default(json!(2048)),
                )
                .property(
                    "system_prompt",
                    ParamSchema::new("string").with_default(json!("")).with_description(
                        "Template. Reference fields with {{ field_name }}",
                    ),
                )
                .property(
                    "user_prompt",
                    ParamSchema::new("string").with_default(json!("")).with_description(
                        "Template. Reference fields with {{ field_name }}",
                    ),
                ),
        }
    }

    pub fn factory() -> BlockFactory {
        Arc::new(|config| {
            let config: TextGeneratorConfig = parse_config("TextGenerator", config)?;
            Ok(Arc::new(TextGenerator {
                model: config.model,
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                system_prompt: config.system_prompt,
                user_prompt: config.user_prompt,
            }) as Arc<dyn Block>)
        })
    }
}

#[async_trait]
impl Block for TextGenerator {
    async fn execute(&self, context: &BlockExecutionContext) -> EngineResult<BlockOutput> {
        let state = &context.accumulated_state;

        // config prompts win over prompts carried in state
        let system_template = if self.system_prompt.is_empty() {
            context.get_state_str("system").to_string()
        } else {
            self.system_prompt.clone()
        };
        let user_template = if self.user_prompt.is_empty() {
            context.get_state_str("user").to_string()
        } else {
            self.user_prompt.clone()
        };

        let system = if system_template.is_empty() {
            String::new()
        } else {
            render_template(&system_template, state)?
        };
        let user = if user_template.is_empty() {
            String::new()
        } else {
            render_template(&user_template, state)?
        };

        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage::system(system.clone()));
        }
        if !user.is_empty() {
            messages.push(ChatMessage::user(user.clone()));
        }

        let model_config = llm_config::resolve_model(self.model.as_deref()).await?;
        let params = prepare_llm_call(
            &model_config,
            messages,
            self.temperature,
            self.max_tokens,
            None,
        );

        tracing::debug!("[{}] calling model {}", context.trace_id, params.model);
        let response = provider::complete(&params).await?;

        let mut result = serde_json::Map::new();
        result.insert("assistant".to_string(), Value::String(response.content));
        result.insert("system".to_string(), Value::String(system));
        result.insert("user".to_string(), Value::String(user));
        if let Some(usage) = response.usage {
            result.insert(USAGE_KEY.to_string(), serde_json::to_value(usage)?);
        }
        Ok(BlockOutput::Single(result))
    }
}
