//! Execution context passed to blocks

use crate::pipeline::{Constraints, StateMap, TraceEntry, Usage};
use serde_json::Value;

/// Execution context handed to every block invocation.
///
/// Gives blocks full visibility into the running execution:
/// the unique `trace_id`, which job (if any) drives the execution,
/// the accumulated state so far, cumulative token usage, the trace of
/// previous blocks and the pipeline's constraints.
#[derive(Debug, Clone)]
pub struct BlockExecutionContext {
    /// Unique identifier of this execution
    pub trace_id: String,
    /// `0` for direct calls, a storage id for background jobs
    pub job_id: i64,
    /// Pipeline this execution belongs to
    pub pipeline_id: i64,
    /// Outputs of all previous blocks, merged over the seed input
    pub accumulated_state: StateMap,
    /// Cumulative token usage for this execution so far
    pub usage: Usage,
    /// Execution history up to this block
    pub trace: Vec<TraceEntry>,
    /// Pipeline execution limits
    pub constraints: Constraints,
}

impl BlockExecutionContext {
    pub fn new(
        trace_id: String,
        job_id: i64,
        pipeline_id: i64,
        accumulated_state: StateMap,
        constraints: Constraints,
    ) -> Self {
        Self {
            trace_id,
            job_id,
            pipeline_id,
            accumulated_state,
            usage: Usage::default(),
            trace: Vec::new(),
            constraints,
        }
    }

    /// Read a field from accumulated state
    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.accumulated_state.get(key)
    }

    /// Read a string field, empty when absent or not a string
    pub fn get_state_str(&self, key: &str) -> &str {
        self.accumulated_state
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Merge new outputs into accumulated state
    pub fn update(&mut self, other: StateMap) {
        for (key, value) in other {
            self.accumulated_state.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context_with(state: StateMap) -> BlockExecutionContext {
        BlockExecutionContext::new(
            "trace-1".to_string(),
            0,
            1,
            state,
            Constraints::default(),
        )
    }

    #[test]
    fn state_helpers() {
        let mut state = StateMap::new();
        state.insert("user".to_string(), json!("Ann"));
        state.insert("count".to_string(), json!(3));
        let ctx = context_with(state);

        assert_eq!(ctx.get_state_str("user"), "Ann");
        assert_eq!(ctx.get_state_str("count"), "");
        assert_eq!(ctx.get_state_str("missing"), "");
        assert_eq!(ctx.get_state("count"), Some(&json!(3)));
    }

    #[test]
    fn update_merges_and_overwrites() {
        let mut state = StateMap::new();
        state.insert("a".to_string(), json!(1));
        let mut ctx = context_with(state);

        let mut delta = StateMap::new();
        delta.insert("a".to_string(), json!(2));
        delta.insert("b".to_string(), json!("x"));
        ctx.update(delta);

        assert_eq!(ctx.get_state("a"), Some(&json!(2)));
        assert_eq!(ctx.get_state("b"), Some(&json!("x")));
    }
}
