//! Pipeline executor
//!
//! Materialises a pipeline definition into block instances and runs them
//! in sequence over an accumulated state, capturing a trace entry per
//! block. A leading multiplier block fans the execution out into
//! independent per-seed sub-executions, each with a fresh trace id.

use crate::blocks::registry::BlockRegistry;
use crate::blocks::{Block, BlockOutput, BlockSpec, USAGE_KEY};
use crate::context::BlockExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::job::JobUpdate;
use crate::job_queue::JobQueue;
use crate::pipeline::{
    BlockDefinition, Constraints, ExecutionResult, StateMap, TokenCounts, TraceEntry,
};
use crate::record::NewRecord;
use crate::storage::Storage;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Outcome of one `execute` call
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// Non-multiplier pipelines produce exactly one result
    Single(ExecutionResult),
    /// Multiplier pipelines produce one result per surviving seed
    Fanout(Vec<ExecutionResult>),
}

impl ExecutionOutcome {
    /// Unwrap a single result; fails on fan-out outcomes
    pub fn into_single(self) -> EngineResult<ExecutionResult> {
        match self {
            ExecutionOutcome::Single(result) => Ok(result),
            ExecutionOutcome::Fanout(_) => Err(EngineError::Validation(
                "expected a single execution result, got fan-out".to_string(),
            )),
        }
    }

    /// Results as a list regardless of shape
    pub fn into_results(self) -> Vec<ExecutionResult> {
        match self {
            ExecutionOutcome::Single(result) => vec![result],
            ExecutionOutcome::Fanout(results) => results,
        }
    }
}

/// Job wiring for an execution; `job_id == 0` means a direct call
pub struct ExecuteOptions<'a> {
    pub job_id: i64,
    pub pipeline_id: i64,
    pub constraints: Constraints,
    pub job_queue: Option<&'a JobQueue>,
    pub storage: Option<&'a Storage>,
}

impl Default for ExecuteOptions<'_> {
    fn default() -> Self {
        Self {
            job_id: 0,
            pipeline_id: 0,
            constraints: Constraints::default(),
            job_queue: None,
            storage: None,
        }
    }
}

struct LoadedBlock {
    spec: BlockSpec,
    block: Arc<dyn Block>,
}

/// An ordered sequence of configured block instances
pub struct Pipeline {
    name: String,
    blocks: Vec<LoadedBlock>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("block_count", &self.blocks.len())
            .finish()
    }
}

impl Pipeline {
    /// Look up and instantiate every block, then validate multiplier
    /// placement: at most one, and only at the first position.
    pub fn from_definition(
        name: impl Into<String>,
        definitions: &[BlockDefinition],
        registry: &BlockRegistry,
    ) -> EngineResult<Self> {
        let mut blocks = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let (spec, block) = registry.instantiate(&definition.block_type, &definition.config)?;
            blocks.push(LoadedBlock { spec, block });
        }

        let multiplier_positions: Vec<usize> = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.spec.is_multiplier)
            .map(|(i, _)| i)
            .collect();
        if multiplier_positions.len() > 1 {
            return Err(EngineError::Validation(
                "only one multiplier block allowed per pipeline".to_string(),
            ));
        }
        if let Some(&position) = multiplier_positions.first() {
            if position != 0 {
                return Err(EngineError::Validation(
                    "multiplier block must be first in pipeline".to_string(),
                ));
            }
        }

        Ok(Self {
            name: name.into(),
            blocks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this pipeline fans out from a leading multiplier
    pub fn has_multiplier(&self) -> bool {
        self.blocks
            .first()
            .map(|b| b.spec.is_multiplier)
            .unwrap_or(false)
    }

    /// Run the pipeline over one seed input
    pub async fn execute(
        &self,
        initial_data: StateMap,
        options: ExecuteOptions<'_>,
    ) -> EngineResult<ExecutionOutcome> {
        if self.blocks.is_empty() {
            let context = self.new_context(initial_data, &options);
            return Ok(ExecutionOutcome::Single(finish(context)));
        }

        if self.has_multiplier() {
            self.execute_multiplier(initial_data, options).await
        } else {
            self.execute_normal(initial_data, options).await
        }
    }

    fn new_context(&self, state: StateMap, options: &ExecuteOptions<'_>) -> BlockExecutionContext {
        BlockExecutionContext::new(
            Uuid::new_v4().to_string(),
            options.job_id,
            options.pipeline_id,
            state,
            options.constraints.clone(),
        )
    }

    fn is_cancelled(&self, options: &ExecuteOptions<'_>) -> bool {
        options.job_id > 0
            && options
                .job_queue
                .map(|queue| queue.is_cancelled(options.job_id))
                .unwrap_or(false)
    }

    async fn update_progress(&self, options: &ExecuteOptions<'_>, update: JobUpdate) {
        if options.job_id == 0 {
            return;
        }
        if let Some(queue) = options.job_queue {
            queue
                .update_and_persist(options.job_id, options.storage, &update)
                .await;
        }
    }

    async fn execute_normal(
        &self,
        initial_data: StateMap,
        options: ExecuteOptions<'_>,
    ) -> EngineResult<ExecutionOutcome> {
        let mut context = self.new_context(initial_data, &options);
        let total = self.blocks.len();
        tracing::info!(
            "[{}] starting pipeline '{}' with {} blocks",
            context.trace_id,
            self.name,
            total
        );

        for (index, loaded) in self.blocks.iter().enumerate() {
            if self.is_cancelled(&options) {
                tracing::info!("[{}] cancelled before block {}", context.trace_id, index + 1);
                return Ok(ExecutionOutcome::Single(finish(context)));
            }

            self.update_progress(
                &options,
                JobUpdate::new()
                    .current_block(loaded.spec.type_name.clone())
                    .current_step(format!("Block {}/{}", index + 1, total)),
            )
            .await;

            run_block(loaded, &mut context, index + 1).await?;
        }

        tracing::info!(
            "[{}] pipeline '{}' completed successfully",
            context.trace_id,
            self.name
        );
        Ok(ExecutionOutcome::Single(finish(context)))
    }

    async fn execute_multiplier(
        &self,
        initial_data: StateMap,
        options: ExecuteOptions<'_>,
    ) -> EngineResult<ExecutionOutcome> {
        let first = &self.blocks[0];
        let remaining = &self.blocks[1..];

        tracing::info!("starting multiplier pipeline '{}' with fan-out", self.name);
        let seed_context = self.new_context(initial_data.clone(), &options);
        let started = Instant::now();
        let seeds = match first.block.execute(&seed_context).await {
            Ok(BlockOutput::Fanout(seeds)) => seeds,
            Ok(BlockOutput::Single(_)) => {
                return Err(EngineError::Validation(format!(
                    "multiplier block '{}' returned a single mapping",
                    first.spec.type_name
                )))
            }
            Err(e) if e.is_validation() => return Err(e),
            Err(e) => {
                return Err(EngineError::BlockExecution {
                    block_type: first.spec.type_name.clone(),
                    step: 1,
                    message: e.to_string(),
                    input: Value::Object(initial_data),
                })
            }
        };
        tracing::info!(
            "multiplier block generated {} seeds in {:.3}s",
            seeds.len(),
            started.elapsed().as_secs_f64()
        );

        let total_seeds = seeds.len();
        self.update_progress(
            &options,
            JobUpdate::new().total_seeds(total_seeds as i64).current_seed(0),
        )
        .await;

        let mut results = Vec::new();
        for (seed_index, seed_data) in seeds.into_iter().enumerate() {
            if self.is_cancelled(&options) {
                tracing::info!(
                    "multiplier pipeline '{}' cancelled before seed {}",
                    self.name,
                    seed_index + 1
                );
                break;
            }

            let completed = self
                .process_seed(seed_index, total_seeds, seed_data, remaining, &initial_data, &options)
                .await;
            if let Some(result) = completed {
                results.push(result);
            }

            // between seeds: enforce pipeline constraints against the
            // job's cumulative usage
            if options.job_id > 0 {
                if let Some(queue) = options.job_queue {
                    if queue
                        .stop_if_exceeded(options.job_id, options.storage, &options.constraints)
                        .await
                    {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "multiplier pipeline '{}' completed with {} results",
            self.name,
            results.len()
        );
        Ok(ExecutionOutcome::Fanout(results))
    }

    /// Run one seed through the remaining blocks. Failures are absorbed:
    /// the error lands in the trace, `records_failed` is bumped, and the
    /// next seed proceeds.
    async fn process_seed(
        &self,
        seed_index: usize,
        total_seeds: usize,
        seed_data: StateMap,
        remaining: &[LoadedBlock],
        initial_data: &StateMap,
        options: &ExecuteOptions<'_>,
    ) -> Option<ExecutionResult> {
        let mut context = self.new_context(seed_data, options);
        let mut failed = false;

        for (index, loaded) in remaining.iter().enumerate() {
            if self.is_cancelled(options) {
                return None;
            }

            self.update_progress(
                options,
                JobUpdate::new()
                    .current_seed(seed_index as i64 + 1)
                    .progress(seed_index as f64 / total_seeds.max(1) as f64)
                    .current_block(loaded.spec.type_name.clone())
                    .current_step(format!(
                        "Seed {}/{}, Block {}/{}",
                        seed_index + 1,
                        total_seeds,
                        index + 1,
                        remaining.len()
                    )),
            )
            .await;

            let block_input = context.accumulated_state.clone();
            if let Err(e) = run_block(loaded, &mut context, index + 1).await {
                tracing::error!(
                    "[{}] seed {}/{} failed: {e}",
                    context.trace_id,
                    seed_index + 1,
                    total_seeds
                );
                context.trace.push(TraceEntry {
                    block_type: loaded.spec.type_name.clone(),
                    input: block_input,
                    output: None,
                    accumulated_state: None,
                    execution_time_seconds: None,
                    error: Some(e.to_string()),
                });
                if options.job_id > 0 {
                    if let Some(queue) = options.job_queue {
                        if let Some(count) = queue.bump_records_failed(options.job_id) {
                            queue
                                .update_and_persist(
                                    options.job_id,
                                    options.storage,
                                    &JobUpdate::new().records_failed(count),
                                )
                                .await;
                        }
                    }
                }
                failed = true;
                break;
            }
        }

        let result = if failed { None } else { Some(finish(context)) };

        if let Some(result) = &result {
            self.persist_seed_result(result, initial_data, options).await;
        }

        let status = if result.is_some() {
            format!("Completed seed {}/{}", seed_index + 1, total_seeds)
        } else {
            format!("Failed seed {}/{}", seed_index + 1, total_seeds)
        };
        self.update_progress(
            options,
            JobUpdate::new()
                .current_seed(seed_index as i64 + 1)
                .progress((seed_index + 1) as f64 / total_seeds.max(1) as f64)
                .current_block("")
                .current_step(status),
        )
        .await;

        result
    }

    /// Persist the seed's record and fold its usage into the job
    async fn persist_seed_result(
        &self,
        result: &ExecutionResult,
        initial_data: &StateMap,
        options: &ExecuteOptions<'_>,
    ) {
        let (Some(storage), Some(queue)) = (options.storage, options.job_queue) else {
            return;
        };
        if options.pipeline_id == 0 || options.job_id == 0 {
            return;
        }

        let record = NewRecord {
            output: Value::Object(result.result.clone()).to_string(),
            metadata: initial_data.clone(),
            trace: result.trace.clone(),
        };
        if let Err(e) = storage
            .save_record(&record, Some(options.pipeline_id), Some(options.job_id))
            .await
        {
            tracing::error!("failed to persist record for job {}: {e}", options.job_id);
            return;
        }

        let mut update = JobUpdate::new();
        if let Some(count) = queue.bump_records_generated(options.job_id) {
            update = update.records_generated(count);
        }
        if let Some(usage) = queue.add_usage(options.job_id, &result.usage) {
            update = update.usage(usage);
        }
        queue
            .update_and_persist(options.job_id, options.storage, &update)
            .await;
    }
}

/// Seal a context into an execution result
fn finish(context: BlockExecutionContext) -> ExecutionResult {
    ExecutionResult {
        result: context.accumulated_state,
        trace: context.trace,
        trace_id: context.trace_id,
        usage: context.usage,
    }
}

/// Run one block over the context: snapshot the input, execute, extract
/// the reserved `_usage` key, validate declared outputs, merge, trace.
async fn run_block(
    loaded: &LoadedBlock,
    context: &mut BlockExecutionContext,
    step: usize,
) -> EngineResult<()> {
    let block_type = &loaded.spec.type_name;
    let block_input = context.accumulated_state.clone();
    let started = Instant::now();

    let output = loaded.block.execute(context).await;
    let elapsed = started.elapsed().as_secs_f64();

    let mut result = match output {
        Ok(BlockOutput::Single(map)) => map,
        Ok(BlockOutput::Fanout(_)) => {
            return Err(EngineError::Validation(format!(
                "block '{block_type}' returned fan-out output outside the multiplier position"
            )))
        }
        // validation errors pass through unchanged
        Err(e) if e.is_validation() => {
            tracing::error!("[{}] {block_type} validation error at step {step}", context.trace_id);
            return Err(e);
        }
        Err(e) => {
            tracing::error!("[{}] {block_type} failed at step {step}: {e}", context.trace_id);
            return Err(EngineError::BlockExecution {
                block_type: block_type.clone(),
                step,
                message: e.to_string(),
                input: Value::Object(block_input),
            });
        }
    };

    // reserved usage key: extracted before validation, never merged;
    // malformed deltas are logged and discarded
    if let Some(raw) = result.remove(USAGE_KEY) {
        match serde_json::from_value::<TokenCounts>(raw) {
            Ok(counts) => context.usage.add_counts(&counts),
            Err(e) => tracing::warn!(
                "[{}] {block_type} returned malformed _usage, discarding: {e}",
                context.trace_id
            ),
        }
    }

    validate_output(&loaded.spec, &result)?;

    for (key, value) in result.clone() {
        context.accumulated_state.insert(key, value);
    }
    context.trace.push(TraceEntry {
        block_type: block_type.clone(),
        input: block_input,
        output: Some(result),
        accumulated_state: Some(context.accumulated_state.clone()),
        execution_time_seconds: Some(elapsed),
        error: None,
    });
    tracing::debug!(
        "[{}] {block_type} completed in {elapsed:.3}s",
        context.trace_id
    );
    Ok(())
}

/// The returned key set must be a subset of the declared outputs unless
/// the declaration carries the `*` wildcard
fn validate_output(spec: &BlockSpec, result: &StateMap) -> EngineResult<()> {
    if spec.outputs_unrestricted() {
        return Ok(());
    }
    let mut extra: Vec<&String> = result
        .keys()
        .filter(|key| !spec.outputs.iter().any(|o| o == *key))
        .collect();
    extra.sort();
    if extra.is_empty() {
        return Ok(());
    }
    Err(EngineError::Validation(format!(
        "block '{}' returned undeclared fields: {extra:?} (declared: {:?})",
        spec.type_name, spec.outputs
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_outputs(outputs: &[&str]) -> BlockSpec {
        BlockSpec {
            type_name: "Probe".to_string(),
            name: "Probe".to_string(),
            description: String::new(),
            category: "test".to_string(),
            inputs: vec![],
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            is_multiplier: false,
            dependencies: vec![],
            config_schema: Default::default(),
        }
    }

    #[test]
    fn undeclared_outputs_are_rejected() {
        let spec = spec_with_outputs(&["x"]);
        let mut result = StateMap::new();
        result.insert("x".to_string(), Value::from(1));
        result.insert("y".to_string(), Value::from(2));
        let err = validate_output(&spec, &result).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("\"y\""));
    }

    #[test]
    fn wildcard_disables_the_subset_check() {
        let spec = spec_with_outputs(&["*"]);
        let mut result = StateMap::new();
        result.insert("anything".to_string(), Value::from(1));
        assert!(validate_output(&spec, &result).is_ok());
    }

    #[test]
    fn empty_output_is_valid() {
        let spec = spec_with_outputs(&["x"]);
        assert!(validate_output(&spec, &StateMap::new()).is_ok());
    }
}
