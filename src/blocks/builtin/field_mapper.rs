//! Field mapping block

use crate::blocks::{parse_config, Block, BlockFactory, BlockOutput, BlockSpec, ConfigSchema, ParamSchema, WILDCARD};
use crate::context::BlockExecutionContext;
use crate::error::EngineResult;
use crate::render::render_template;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FieldMapperConfig {
    mappings: BTreeMap<String, String>,
}

/// Create new fields by rendering template expressions against
/// accumulated state. Rendered values that parse as JSON are stored
/// structurally; render failures degrade to empty strings.
pub struct FieldMapper {
    mappings: BTreeMap<String, String>,
}

impl FieldMapper {
    pub fn spec() -> BlockSpec {
        BlockSpec {
            type_name: "FieldMapper".to_string(),
            name: "Field Mapper".to_string(),
            description: "Create new fields by rendering template expressions".to_string(),
            category: "utilities".to_string(),
            inputs: vec![WILDCARD.to_string()],
            outputs: vec![WILDCARD.to_string()],
            is_multiplier: false,
            dependencies: vec![],
            config_schema: ConfigSchema::new().property(
                "mappings",
                ParamSchema::new("object").with_description(
                    "Map of new field names to template expressions, \
                     e.g. {\"question\": \"{{ parsed_json.qa.q }}\"}",
                ),
            ),
        }
    }

    pub fn factory() -> BlockFactory {
        Arc::new(|config| {
            let config: FieldMapperConfig = parse_config("FieldMapper", config)?;
            Ok(Arc::new(FieldMapper {
                mappings: config.mappings,
            }) as Arc<dyn Block>)
        })
    }

    fn maybe_parse_json(value: String) -> Value {
        serde_json::from_str(&value).unwrap_or(Value::String(value))
    }
}

#[async_trait]
impl Block for FieldMapper {
    async fn execute(&self, context: &BlockExecutionContext) -> EngineResult<BlockOutput> {
        if self.mappings.is_empty() {
            tracing::warn!("no mappings configured, returning empty result");
            return Ok(BlockOutput::Single(serde_json::Map::new()));
        }

        let mut result = serde_json::Map::new();
        for (field_name, template) in &self.mappings {
            match render_template(template, &context.accumulated_state) {
                Ok(rendered) => {
                    result.insert(field_name.clone(), Self::maybe_parse_json(rendered));
                }
                Err(e) => {
                    tracing::error!("failed to render template for '{field_name}': {e}");
                    result.insert(field_name.clone(), Value::String(String::new()));
                }
            }
        }
        Ok(BlockOutput::Single(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Constraints;
    use serde_json::json;

    fn mapper(pairs: &[(&str, &str)]) -> FieldMapper {
        FieldMapper {
            mappings: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn ctx(state: serde_json::Map<String, Value>) -> BlockExecutionContext {
        BlockExecutionContext::new("t".to_string(), 0, 1, state, Constraints::default())
    }

    #[tokio::test]
    async fn maps_fields_and_parses_json() {
        let mut state = serde_json::Map::new();
        state.insert("parsed".to_string(), json!({"answer": 42}));
        let output = mapper(&[
            ("answer", "{{ parsed.answer }}"),
            ("copy", "{{ parsed | tojson }}"),
        ])
        .execute(&ctx(state))
        .await
        .unwrap();

        let BlockOutput::Single(result) = output else {
            panic!("expected single output");
        };
        assert_eq!(result.get("answer"), Some(&json!(42)));
        assert_eq!(result.get("copy"), Some(&json!({"answer": 42})));
    }

    #[tokio::test]
    async fn render_failure_degrades_to_empty_string() {
        let output = mapper(&[("broken", "{{ missing_field }}")])
            .execute(&ctx(serde_json::Map::new()))
            .await
            .unwrap();
        let BlockOutput::Single(result) = output else {
            panic!("expected single output");
        };
        assert_eq!(result.get("broken"), Some(&json!("")));
    }
}
