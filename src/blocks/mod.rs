//! Block contract and configuration schema model
//!
//! A block is the unit of work inside a pipeline: stateless across
//! executions, configured at pipeline load time, invoked once per
//! execution with a [`BlockExecutionContext`]. Non-multiplier blocks
//! return one mapping; multiplier blocks return a list of seed maps.

pub mod builtin;
pub mod registry;

use crate::context::BlockExecutionContext;
use crate::error::EngineResult;
use crate::pipeline::StateMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Wildcard marking unrestricted inputs or outputs
pub const WILDCARD: &str = "*";

/// Reserved output key carrying token usage extracted by the executor
pub const USAGE_KEY: &str = "_usage";

/// Return value of a block invocation
#[derive(Debug, Clone)]
pub enum BlockOutput {
    /// Mapping merged into accumulated state (non-multiplier blocks)
    Single(StateMap),
    /// Independent seed maps, one downstream execution each
    /// (multiplier blocks)
    Fanout(Vec<StateMap>),
}

/// The block contract: async execution over the shared context
#[async_trait]
pub trait Block: Send + Sync {
    async fn execute(&self, context: &BlockExecutionContext) -> EngineResult<BlockOutput>;
}

impl std::fmt::Debug for dyn Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Block>")
    }
}

/// JSON-schema-style description of one config parameter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSchema {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
    #[serde(
        rename = "isFieldReference",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub is_field_reference: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParamSchema>>,
}

impl ParamSchema {
    pub fn new(param_type: &str) -> Self {
        Self {
            param_type: param_type.to_string(),
            default: None,
            enum_values: None,
            is_field_reference: None,
            description: None,
            items: None,
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_enum(mut self, values: Vec<serde_json::Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn field_reference(mut self) -> Self {
        self.is_field_reference = Some(true);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Config schema derived from a block's constructor parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, ParamSchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

fn object_type() -> String {
    "object".to_string()
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self {
            schema_type: object_type(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn property(mut self, name: &str, schema: ParamSchema) -> Self {
        self.properties.insert(name.to_string(), schema);
        self
    }

    pub fn require(mut self, name: &str) -> Self {
        self.required.push(name.to_string());
        self
    }
}

/// Class-level block metadata declared alongside each implementation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockSpec {
    /// Registry type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Display name
    pub name: String,
    pub description: String,
    pub category: String,
    /// Required field names in accumulated state, or `["*"]` for any
    pub inputs: Vec<String>,
    /// Field names the block may set, or `["*"]` for unrestricted
    pub outputs: Vec<String>,
    #[serde(default)]
    pub is_multiplier: bool,
    /// Package requirement strings checked at registration
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config_schema: ConfigSchema,
}

impl BlockSpec {
    /// Whether the declared outputs disable the subset check
    pub fn outputs_unrestricted(&self) -> bool {
        self.outputs.iter().any(|o| o == WILDCARD)
    }
}

/// Factory producing a configured block instance from its config mapping
pub type BlockFactory = Arc<dyn Fn(&StateMap) -> EngineResult<Arc<dyn Block>> + Send + Sync>;

/// Where a registered block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockSource {
    Builtin,
    Custom,
    User,
}

impl BlockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockSource::Builtin => "builtin",
            BlockSource::Custom => "custom",
            BlockSource::User => "user",
        }
    }
}

/// Block schema with extensibility metadata, as listed to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(flatten)]
    pub spec: BlockSpec,
    pub source: BlockSource,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counts of registered blocks by source and availability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlocksStatus {
    pub total: usize,
    pub builtin_blocks: usize,
    pub custom_blocks: usize,
    pub user_blocks: usize,
    pub available: usize,
    pub unavailable: usize,
}

/// Parse a block's config mapping into its typed config struct
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    type_name: &str,
    config: &StateMap,
) -> EngineResult<T> {
    serde_json::from_value(serde_json::Value::Object(config.clone())).map_err(|e| {
        crate::error::EngineError::Validation(format!("invalid config for {type_name}: {e}"))
    })
}
