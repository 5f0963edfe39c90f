//! JSON extraction and validation block

use crate::blocks::{parse_config, Block, BlockFactory, BlockOutput, BlockSpec, ConfigSchema, ParamSchema, WILDCARD};
use crate::context::BlockExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::render::{normalize_json_or_template, render_string_list};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct JsonValidatorConfig {
    field_name: String,
    required_fields: Value,
    strict: bool,
}

impl Default for JsonValidatorConfig {
    fn default() -> Self {
        Self {
            field_name: "assistant".to_string(),
            required_fields: Value::String(String::new()),
            strict: false,
        }
    }
}

/// Parse and validate JSON from a field in accumulated state. LLM
/// responses often wrap JSON in prose or code fences, so parsing falls
/// back from a direct parse to fenced-block and first-object extraction.
pub struct JsonValidator {
    field_name: String,
    required_fields_template: String,
    strict: bool,
}

impl JsonValidator {
    pub fn spec() -> BlockSpec {
        BlockSpec {
            type_name: "JsonValidator".to_string(),
            name: "JSON Validator".to_string(),
            description: "Parse and validate JSON from any field in accumulated state".to_string(),
            category: "validators".to_string(),
            inputs: vec![WILDCARD.to_string()],
            outputs: vec!["valid".to_string(), "parsed_json".to_string()],
            is_multiplier: false,
            dependencies: vec![],
            config_schema: ConfigSchema::new()
                .property(
                    "field_name",
                    ParamSchema::new("string")
                        .with_default(json!("assistant"))
                        .field_reference(),
                )
                .property(
                    "required_fields",
                    ParamSchema::new("string")
                        .with_default(json!(""))
                        .with_description(
                            "JSON array or template, e.g. [\"name\"] or \
                             {{ required_fields | tojson }} (leave empty for none)",
                        ),
                )
                .property(
                    "strict",
                    ParamSchema::new("boolean").with_default(json!(false)),
                ),
        }
    }

    pub fn factory() -> BlockFactory {
        Arc::new(|config| {
            let config: JsonValidatorConfig = parse_config("JsonValidator", config)?;
            Ok(Arc::new(JsonValidator {
                field_name: config.field_name,
                required_fields_template: normalize_json_or_template(&config.required_fields)?,
                strict: config.strict,
            }) as Arc<dyn Block>)
        })
    }
}

/// Parse a JSON object out of an LLM response: direct parse first, then
/// the content of a code fence, then the outermost brace span
fn parse_llm_json(content: &str) -> Option<Value> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(content) {
        return Some(value);
    }

    if let Some(fenced) = extract_fenced(content) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&fenced) {
            return Some(value);
        }
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&content[start..=end]) {
            return Some(value);
        }
    }
    None
}

fn extract_fenced(content: &str) -> Option<String> {
    let fence_start = content.find("```")?;
    let after_fence = &content[fence_start + 3..];
    let body_start = after_fence.find('\n')?;
    let body = &after_fence[body_start + 1..];
    let fence_end = body.find("```")?;
    Some(body[..fence_end].trim().to_string())
}

#[async_trait]
impl Block for JsonValidator {
    async fn execute(&self, context: &BlockExecutionContext) -> EngineResult<BlockOutput> {
        let required_fields = if self.required_fields_template.is_empty() {
            Vec::new()
        } else {
            render_string_list(
                &self.required_fields_template,
                &context.accumulated_state,
                "required_fields",
            )?
        };

        let content = context.get_state_str(&self.field_name);
        let parsed = parse_llm_json(content);

        let mut result = serde_json::Map::new();
        match parsed {
            Some(value) => {
                let missing: Vec<&String> = required_fields
                    .iter()
                    .filter(|field| value.get(field.as_str()).is_none())
                    .collect();
                if !missing.is_empty() {
                    if self.strict {
                        return Err(EngineError::Block(format!(
                            "required fields missing from {}: {missing:?}",
                            self.field_name
                        )));
                    }
                    result.insert("valid".to_string(), Value::Bool(false));
                } else {
                    result.insert("valid".to_string(), Value::Bool(true));
                }
                result.insert("parsed_json".to_string(), value);
            }
            None => {
                if self.strict {
                    return Err(EngineError::Block(format!(
                        "failed to parse {} as JSON",
                        self.field_name
                    )));
                }
                result.insert("valid".to_string(), Value::Bool(false));
            }
        }
        Ok(BlockOutput::Single(result))
    }
}
