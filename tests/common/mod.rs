//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use datagenflow::blocks::{Block, BlockFactory, BlockOutput, BlockSource, BlockSpec};
use datagenflow::provider::{ChatResponse, ChatService, LlmCallParams};
use datagenflow::{
    BlockExecutionContext, BlockRegistry, EngineError, EngineResult, StateMap, TokenCounts,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Build a state map from key/value pairs
pub fn state(pairs: &[(&str, Value)]) -> StateMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn spec(type_name: &str, outputs: &[&str], is_multiplier: bool) -> BlockSpec {
    BlockSpec {
        type_name: type_name.to_string(),
        name: type_name.to_string(),
        description: String::new(),
        category: "test".to_string(),
        inputs: vec![],
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        is_multiplier,
        dependencies: vec![],
        config_schema: Default::default(),
    }
}

/// Block that always returns the same mapping
pub struct StaticBlock {
    pub result: StateMap,
}

#[async_trait]
impl Block for StaticBlock {
    async fn execute(&self, _context: &BlockExecutionContext) -> EngineResult<BlockOutput> {
        Ok(BlockOutput::Single(self.result.clone()))
    }
}

/// Register a block that returns `result` under the given type name
pub fn register_static(
    registry: &BlockRegistry,
    type_name: &str,
    outputs: &[&str],
    result: StateMap,
) {
    let factory: BlockFactory = Arc::new(move |_config| {
        Ok(Arc::new(StaticBlock {
            result: result.clone(),
        }) as Arc<dyn Block>)
    });
    registry.register(
        spec(type_name, outputs, false),
        factory,
        BlockSource::Builtin,
        true,
        None,
    );
}

/// Block that fails whenever `field` equals `value` in accumulated state
pub struct FailWhenBlock {
    pub field: String,
    pub value: Value,
    pub result: StateMap,
}

#[async_trait]
impl Block for FailWhenBlock {
    async fn execute(&self, context: &BlockExecutionContext) -> EngineResult<BlockOutput> {
        if context.get_state(&self.field) == Some(&self.value) {
            return Err(EngineError::Block(format!(
                "induced failure on {}={}",
                self.field, self.value
            )));
        }
        Ok(BlockOutput::Single(self.result.clone()))
    }
}

/// Block that signals when a call starts and waits for a permit before
/// returning; lets tests cancel a job while a block is in flight
pub struct GateBlock {
    pub started: Arc<Semaphore>,
    pub proceed: Arc<Semaphore>,
    pub result: StateMap,
}

#[async_trait]
impl Block for GateBlock {
    async fn execute(&self, _context: &BlockExecutionContext) -> EngineResult<BlockOutput> {
        self.started.add_permits(1);
        let permit = self
            .proceed
            .acquire()
            .await
            .map_err(|e| EngineError::Block(e.to_string()))?;
        permit.forget();
        Ok(BlockOutput::Single(self.result.clone()))
    }
}

pub fn register_gate(
    registry: &BlockRegistry,
    type_name: &str,
    outputs: &[&str],
    started: Arc<Semaphore>,
    proceed: Arc<Semaphore>,
    result: StateMap,
) {
    let factory: BlockFactory = Arc::new(move |_config| {
        Ok(Arc::new(GateBlock {
            started: started.clone(),
            proceed: proceed.clone(),
            result: result.clone(),
        }) as Arc<dyn Block>)
    });
    registry.register(
        spec(type_name, outputs, false),
        factory,
        BlockSource::Builtin,
        true,
        None,
    );
}

/// Chat adapter returning a fixed response, for gateway tests
pub struct MockChat {
    pub content: String,
    pub usage: Option<TokenCounts>,
}

#[async_trait]
impl ChatService for MockChat {
    async fn complete(&self, _params: &LlmCallParams) -> EngineResult<ChatResponse> {
        Ok(ChatResponse {
            content: self.content.clone(),
            usage: self.usage,
        })
    }
}
