//! Text validation block

use crate::blocks::{parse_config, Block, BlockFactory, BlockOutput, BlockSpec, ConfigSchema, ParamSchema};
use crate::context::BlockExecutionContext;
use crate::error::EngineResult;
use crate::render::{normalize_json_or_template, render_string_list};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ValidatorConfig {
    min_length: usize,
    max_length: usize,
    forbidden_words: Value,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_length: 0,
            max_length: 100_000,
            forbidden_words: Value::String(String::new()),
        }
    }
}

/// Validate `text` (or `assistant`) against length bounds and a
/// forbidden-word list. `forbidden_words` is JSON-or-template.
pub struct Validator {
    min_length: usize,
    max_length: usize,
    forbidden_words_template: String,
}

impl Validator {
    pub fn spec() -> BlockSpec {
        BlockSpec {
            type_name: "Validator".to_string(),
            name: "Validator".to_string(),
            description: "Validate text against rules".to_string(),
            category: "validators".to_string(),
            inputs: vec!["text".to_string(), "assistant".to_string()],
            outputs: vec![
                "text".to_string(),
                "valid".to_string(),
                "assistant".to_string(),
            ],
            is_multiplier: false,
            dependencies: vec![],
            config_schema: ConfigSchema::new()
                .property(
                    "min_length",
                    ParamSchema::new("integer").with_default(json!(0)),
                )
                .property(
                    "max_length",
                    ParamSchema::new("integer").with_default(json!(100_000)),
                )
                .property(
                    "forbidden_words",
                    ParamSchema::new("string")
                        .with_default(json!(""))
                        .with_description(
                            "JSON array or template, e.g. [\"spam\"] or \
                             {{ forbidden_words | tojson }} (leave empty for none)",
                        ),
                ),
        }
    }

    pub fn factory() -> BlockFactory {
        Arc::new(|config| {
            let config: ValidatorConfig = parse_config("Validator", config)?;
            Ok(Arc::new(Validator {
                min_length: config.min_length,
                max_length: config.max_length,
                forbidden_words_template: normalize_json_or_template(&config.forbidden_words)?,
            }) as Arc<dyn Block>)
        })
    }
}

#[async_trait]
impl Block for Validator {
    async fn execute(&self, context: &BlockExecutionContext) -> EngineResult<BlockOutput> {
        let forbidden_words = if self.forbidden_words_template.is_empty() {
            Vec::new()
        } else {
            render_string_list(
                &self.forbidden_words_template,
                &context.accumulated_state,
                "forbidden_words",
            )?
        };

        // prefer text, fall back to assistant
        let text = {
            let text = context.get_state_str("text");
            if text.is_empty() {
                context.get_state_str("assistant")
            } else {
                text
            }
        };

        let length = text.chars().count();
        let valid = if length < self.min_length || length > self.max_length {
            false
        } else {
            let lower = text.to_lowercase();
            !forbidden_words
                .iter()
                .any(|word| lower.contains(&word.to_lowercase()))
        };

        let mut result = serde_json::Map::new();
        result.insert("valid".to_string(), Value::Bool(valid));
        if let Some(text) = context.get_state("text") {
            result.insert("text".to_string(), text.clone());
        }
        if let Some(assistant) = context.get_state("assistant") {
            result.insert("assistant".to_string(), assistant.clone());
        }
        Ok(BlockOutput::Single(result))
    }
}
