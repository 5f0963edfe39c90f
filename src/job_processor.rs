//! Background job worker
//!
//! Each job runs on a dedicated OS thread carrying its own Tokio
//! runtime, so a job never blocks request handling. The worker iterates
//! seeds and repetitions, checks the queue mirror for cooperative
//! cancellation before every repetition, accumulates usage and enforces
//! pipeline constraints.

use crate::blocks::registry::BlockRegistry;
use crate::error::EngineResult;
use crate::executor::{ExecuteOptions, ExecutionOutcome, Pipeline};
use crate::job::{JobStatus, JobUpdate};
use crate::job_queue::JobQueue;
use crate::pipeline::{PipelineDefinition, Usage};
use crate::record::NewRecord;
use crate::seed;
use crate::storage::Storage;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a worker needs to drive one job
pub struct JobContext {
    pub job_id: i64,
    pub pipeline_id: i64,
    pub seed_file: PathBuf,
    pub queue: Arc<JobQueue>,
    pub storage: Storage,
    pub registry: Arc<BlockRegistry>,
}

/// Spawn the worker thread for a job. The thread owns a current-thread
/// runtime; the handle can be joined in tests.
pub fn spawn_job_worker(context: JobContext) -> EngineResult<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(format!("job-{}", context.job_id))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!("[job {}] failed to build runtime: {e}", context.job_id);
                    context.queue.update_job(
                        context.job_id,
                        &JobUpdate::new()
                            .status(JobStatus::Failed)
                            .error(format!("failed to build runtime: {e}")),
                    );
                    return;
                }
            };
            runtime.block_on(process_job(context));
        })?;
    Ok(handle)
}

/// Execute the pipeline for every seed in the file, tracking progress.
/// Single-seed failures never abort the job; only scheduler-level
/// failures (unloadable pipeline, bad seed file) are terminal.
pub async fn process_job(context: JobContext) {
    let job_id = context.job_id;
    if let Err(e) = process_job_inner(&context).await {
        tracing::error!("[job {job_id}] failed: {e}");
        context
            .queue
            .update_and_persist(
                job_id,
                Some(&context.storage),
                &JobUpdate::new()
                    .status(JobStatus::Failed)
                    .error(e.to_string())
                    .completed_at(chrono::Utc::now().to_rfc3339()),
            )
            .await;
    }

    // the seed file is temporary; removal is best-effort
    if let Err(e) = std::fs::remove_file(&context.seed_file) {
        tracing::warn!(
            "failed to delete seed file {}: {e}",
            context.seed_file.display()
        );
    }
}

async fn process_job_inner(context: &JobContext) -> EngineResult<()> {
    let JobContext {
        job_id,
        pipeline_id,
        seed_file,
        queue,
        storage,
        registry,
    } = context;
    let job_id = *job_id;
    let pipeline_id = *pipeline_id;

    let Some(pipeline_row) = storage.get_pipeline(pipeline_id).await? else {
        queue
            .update_and_persist(
                job_id,
                Some(storage),
                &JobUpdate::new()
                    .status(JobStatus::Failed)
                    .error("Pipeline not found")
                    .completed_at(chrono::Utc::now().to_rfc3339()),
            )
            .await;
        return Ok(());
    };

    let definition: PipelineDefinition = serde_json::from_value(pipeline_row.definition)?;
    let pipeline = Pipeline::from_definition(&pipeline_row.name, &definition.blocks, registry)?;
    let constraints = definition.constraints;

    let seeds = seed::load_seed_file(seed_file)?;
    let total_executions = seed::total_executions(&seeds);
    tracing::info!(
        "[job {job_id}] starting pipeline {pipeline_id} with {} seeds ({} total executions)",
        seeds.len(),
        total_executions
    );

    let mut cumulative_usage = Usage::default();
    let mut records_generated: i64 = 0;
    let mut records_failed: i64 = 0;
    let mut execution_index: i64 = 0;

    for seed in &seeds {
        if queue.is_cancelled(job_id) {
            tracing::info!(
                "[job {job_id}] cancelled at execution {execution_index}/{total_executions}"
            );
            break;
        }

        let repetitions = seed.repetitions.max(0);
        if repetitions == 0 {
            // repetitions=0 means "skip this seed": no record, no failure
            tracing::info!("[job {job_id}] skipping seed with 0 repetitions");
            continue;
        }

        for _ in 0..repetitions {
            execution_index += 1;

            if queue.is_cancelled(job_id) {
                tracing::info!(
                    "[job {job_id}] cancelled at execution {execution_index}/{total_executions}"
                );
                break;
            }

            queue
                .update_and_persist(
                    job_id,
                    Some(storage),
                    &JobUpdate::new()
                        .current_seed(execution_index)
                        .total_seeds(total_executions)
                        .progress(execution_index as f64 / total_executions.max(1) as f64)
                        .current_block("")
                        .current_step(format!(
                            "Processing execution {execution_index}/{total_executions}"
                        )),
                )
                .await;

            let outcome = pipeline
                .execute(
                    seed.metadata.clone(),
                    ExecuteOptions {
                        job_id,
                        pipeline_id,
                        constraints: constraints.clone(),
                        job_queue: Some(queue.as_ref()),
                        storage: Some(storage),
                    },
                )
                .await;

            match outcome {
                Ok(ExecutionOutcome::Fanout(results)) => {
                    // multiplier executions persist their records inside
                    // the executor; fold their usage into the job total
                    records_generated += results.len() as i64;
                    for result in &results {
                        cumulative_usage.add_tokens(&result.usage);
                    }
                    queue
                        .update_and_persist(
                            job_id,
                            Some(storage),
                            &JobUpdate::new()
                                .records_generated(records_generated)
                                .usage(cumulative_usage.clone()),
                        )
                        .await;
                    if queue.stop_if_exceeded(job_id, Some(storage), &constraints).await {
                        break;
                    }
                }
                Ok(ExecutionOutcome::Single(result)) => {
                    cumulative_usage.add_tokens(&result.usage);
                    queue
                        .update_and_persist(
                            job_id,
                            Some(storage),
                            &JobUpdate::new().usage(cumulative_usage.clone()),
                        )
                        .await;

                    // constraints are enforced on the updated cumulative
                    // usage before the triggering record is persisted
                    if queue.stop_if_exceeded(job_id, Some(storage), &constraints).await {
                        break;
                    }

                    // a trace shorter than the pipeline means the executor
                    // returned early from a cancellation check point; the
                    // cut-short execution must not become a record
                    if result.trace.len() < definition.blocks.len() {
                        break;
                    }

                    let record = NewRecord {
                        output: Value::Object(result.result).to_string(),
                        metadata: seed.metadata.clone(),
                        trace: result.trace,
                    };
                    storage
                        .save_record(&record, Some(pipeline_id), Some(job_id))
                        .await?;
                    records_generated += 1;
                    queue
                        .update_and_persist(
                            job_id,
                            Some(storage),
                            &JobUpdate::new().records_generated(records_generated),
                        )
                        .await;
                }
                Err(e) => {
                    records_failed += 1;
                    tracing::error!("[job {job_id}] execution {execution_index} failed: {e}");
                    queue
                        .update_and_persist(
                            job_id,
                            Some(storage),
                            &JobUpdate::new()
                                .records_failed(records_failed)
                                .error(e.to_string()),
                        )
                        .await;
                    continue;
                }
            }
        }

        // the inner break only exits the repetition loop; without this
        // re-check a cancelled or stopped job would keep consuming the
        // remaining seeds
        let status = queue.get_job(job_id).map(|job| job.status);
        if matches!(status, Some(JobStatus::Cancelled) | Some(JobStatus::Stopped)) {
            tracing::info!("[job {job_id}] stopping seed processing: status={status:?}");
            break;
        }
    }

    let final_status = queue.get_job(job_id).map(|job| job.status);
    if !matches!(
        final_status,
        Some(JobStatus::Cancelled) | Some(JobStatus::Stopped)
    ) {
        cumulative_usage.finish();
        queue
            .update_and_persist(
                job_id,
                Some(storage),
                &JobUpdate::new()
                    .status(JobStatus::Completed)
                    .progress(1.0)
                    .completed_at(chrono::Utc::now().to_rfc3339())
                    .usage(cumulative_usage),
            )
            .await;
        tracing::info!(
            "[job {job_id}] completed: {records_generated} generated, {records_failed} failed"
        );
    }
    Ok(())
}
