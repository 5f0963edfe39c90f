//! Background job lifecycle: completion, cancellation, constraint stops

mod common;

use common::{register_gate, register_static, state};
use datagenflow::storage::RecordFilter;
use datagenflow::{
    spawn_job_worker, BlockRegistry, JobContext, JobQueue, JobStatus, Storage,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

async fn setup_job(
    storage: &Storage,
    queue: &Arc<JobQueue>,
    definition: Value,
    seeds: Value,
    dir: &tempfile::TempDir,
) -> (i64, i64, PathBuf) {
    let pipeline_id = storage.save_pipeline("test pipeline", &definition).await.unwrap();
    let job_id = storage.create_job(pipeline_id, 1, JobStatus::Running).await.unwrap();
    queue
        .create_job(job_id, pipeline_id, 1, JobStatus::Running)
        .unwrap();

    let seed_path = dir.path().join(format!("seeds-{job_id}.json"));
    std::fs::write(&seed_path, serde_json::to_string(&seeds).unwrap()).unwrap();
    (pipeline_id, job_id, seed_path)
}

async fn run_job_to_completion(context: JobContext) {
    let handle = spawn_job_worker(context).unwrap();
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .unwrap()
        .unwrap();
}

fn mock_generator_definition() -> Value {
    json!({
        "blocks": [{"type": "TextGenerator", "config": {}}]
    })
}

/// Register a stand-in TextGenerator that answers like a mocked LLM
/// call: fixed assistant text plus a usage delta of 8 tokens
fn register_mock_generator(registry: &BlockRegistry) {
    register_static(
        registry,
        "TextGenerator",
        &["assistant"],
        state(&[
            ("assistant", json!("hello Ann")),
            (
                "_usage",
                json!({"input_tokens": 5, "output_tokens": 3, "cached_tokens": 0}),
            ),
        ]),
    );
}

#[tokio::test]
async fn job_completes_and_persists_records_and_usage() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());
    register_mock_generator(&registry);

    let dir = tempfile::tempdir().unwrap();
    let (pipeline_id, job_id, seed_path) = setup_job(
        &storage,
        &queue,
        mock_generator_definition(),
        json!([{"repetitions": 2, "metadata": {"user": "Ann"}}]),
        &dir,
    )
    .await;

    run_job_to_completion(JobContext {
        job_id,
        pipeline_id,
        seed_file: seed_path.clone(),
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .await;

    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 2);
    assert_eq!(job.records_failed, 0);
    assert_eq!(job.progress, 1.0);
    assert_eq!(job.usage.total_tokens(), 16);
    assert!(job.usage.end_time.is_some());
    assert!(job.completed_at.is_some());

    // the storage row agrees with the mirror
    let stored = storage.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.records_generated, 2);
    assert_eq!(stored.usage.total_tokens(), 16);

    let records = storage
        .get_records(&RecordFilter {
            job_id: Some(job_id),
            limit: 100,
            ..RecordFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        let output: Value = serde_json::from_str(&record.output).unwrap();
        assert_eq!(output.get("user"), Some(&json!("Ann")));
        assert_eq!(output.get("assistant"), Some(&json!("hello Ann")));
        assert_eq!(record.metadata.get("user"), Some(&json!("Ann")));
        assert_eq!(record.trace.len(), 1);
    }

    // the temporary seed file is gone
    assert!(!seed_path.exists());
}

#[tokio::test]
async fn cancellation_between_repetitions_stops_the_job() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());

    let started = Arc::new(Semaphore::new(0));
    let proceed = Arc::new(Semaphore::new(0));
    register_gate(
        &registry,
        "Gate",
        &["done"],
        started.clone(),
        proceed.clone(),
        state(&[("done", json!(true))]),
    );

    let dir = tempfile::tempdir().unwrap();
    let (pipeline_id, job_id, seed_path) = setup_job(
        &storage,
        &queue,
        json!({"blocks": [{"type": "Gate", "config": {}}]}),
        json!([{"repetitions": 10, "metadata": {}}]),
        &dir,
    )
    .await;

    let handle = spawn_job_worker(JobContext {
        job_id,
        pipeline_id,
        seed_file: seed_path,
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .unwrap();

    // first repetition is in flight: cancel, then let the call finish
    started.acquire().await.unwrap().forget();
    queue.cancel_job(job_id);
    proceed.add_permits(1);

    tokio::task::spawn_blocking(move || handle.join())
        .await
        .unwrap()
        .unwrap();

    // in-flight work completed and was persisted; nothing further ran
    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.records_generated, 1);

    let records = storage
        .get_records(&RecordFilter {
            job_id: Some(job_id),
            limit: 100,
            ..RecordFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn constraint_stop_names_the_limit_and_discards_the_triggering_record() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());
    register_mock_generator(&registry);

    let dir = tempfile::tempdir().unwrap();
    let seeds: Vec<Value> = (0..10)
        .map(|_| json!({"repetitions": 1, "metadata": {"user": "Ann"}}))
        .collect();
    let (pipeline_id, job_id, seed_path) = setup_job(
        &storage,
        &queue,
        json!({
            "blocks": [{"type": "TextGenerator", "config": {}}],
            "constraints": {"max_total_tokens": 20}
        }),
        Value::Array(seeds),
        &dir,
    )
    .await;

    run_job_to_completion(JobContext {
        job_id,
        pipeline_id,
        seed_file: seed_path,
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .await;

    // 8 tokens per execution: the third execution pushes usage to 24,
    // which trips the limit before its record lands
    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.error.contains("max_total_tokens"));
    assert_eq!(job.records_generated, 2);
    assert_eq!(job.usage.total_tokens(), 24);
    assert!(job.usage.end_time.is_some());

    // the stopped state satisfies the constraint predicate
    let constraints = datagenflow::Constraints {
        max_total_tokens: 20,
        ..Default::default()
    };
    assert_eq!(constraints.is_exceeded(&job.usage), Some("max_total_tokens"));

    let records = storage
        .get_records(&RecordFilter {
            job_id: Some(job_id),
            limit: 100,
            ..RecordFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn all_unlimited_constraints_never_stop_a_job() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());
    register_mock_generator(&registry);

    let dir = tempfile::tempdir().unwrap();
    let (pipeline_id, job_id, seed_path) = setup_job(
        &storage,
        &queue,
        mock_generator_definition(),
        json!([{"repetitions": 5, "metadata": {"user": "Ann"}}]),
        &dir,
    )
    .await;

    run_job_to_completion(JobContext {
        job_id,
        pipeline_id,
        seed_file: seed_path,
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .await;

    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 5);
}

#[tokio::test]
async fn zero_repetition_seeds_are_skipped_without_failures() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());
    register_mock_generator(&registry);

    let dir = tempfile::tempdir().unwrap();
    let (pipeline_id, job_id, seed_path) = setup_job(
        &storage,
        &queue,
        mock_generator_definition(),
        json!([
            {"repetitions": 0, "metadata": {"user": "skipped"}},
            {"repetitions": 1, "metadata": {"user": "Ann"}}
        ]),
        &dir,
    )
    .await;

    run_job_to_completion(JobContext {
        job_id,
        pipeline_id,
        seed_file: seed_path,
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .await;

    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 1);
    assert_eq!(job.records_failed, 0);
}

#[tokio::test]
async fn output_violation_counts_as_a_failed_repetition() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());
    // declares only "x" but leaks "y"
    register_static(
        &registry,
        "Leaky",
        &["x"],
        state(&[("x", json!(1)), ("y", json!(2))]),
    );

    let dir = tempfile::tempdir().unwrap();
    let (pipeline_id, job_id, seed_path) = setup_job(
        &storage,
        &queue,
        json!({"blocks": [{"type": "Leaky", "config": {}}]}),
        json!([{"repetitions": 1, "metadata": {}}]),
        &dir,
    )
    .await;

    run_job_to_completion(JobContext {
        job_id,
        pipeline_id,
        seed_file: seed_path,
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .await;

    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.records_failed, 1);
    assert_eq!(job.records_generated, 0);
    assert!(job.error.contains("undeclared"));

    let records = storage
        .get_records(&RecordFilter {
            job_id: Some(job_id),
            limit: 100,
            ..RecordFilter::default()
        })
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn missing_pipeline_fails_the_job() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());

    let job_id = storage.create_job(4242, 1, JobStatus::Running).await.unwrap();
    queue.create_job(job_id, 4242, 1, JobStatus::Running).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("seeds.json");
    std::fs::write(&seed_path, "[]").unwrap();

    run_job_to_completion(JobContext {
        job_id,
        pipeline_id: 4242,
        seed_file: seed_path,
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .await;

    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.contains("Pipeline not found"));
}
