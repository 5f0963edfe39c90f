//! Multiplier fan-out execution

mod common;

use common::{spec, state};
use datagenflow::blocks::{Block, BlockFactory, BlockSource};
use datagenflow::storage::RecordFilter;
use datagenflow::{
    spawn_job_worker, BlockRegistry, ExecuteOptions, JobContext, JobQueue, JobStatus, Pipeline,
    Storage,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

fn chunking_definition() -> Value {
    json!({
        "blocks": [
            {"type": "MarkdownMultiplier", "config": {"parser_type": "sentence", "chunk_size": 100}},
            {"type": "Validator", "config": {"min_length": 1}}
        ]
    })
}

#[tokio::test]
async fn direct_fanout_returns_one_result_per_seed() {
    let registry = BlockRegistry::new();
    let definition: datagenflow::PipelineDefinition =
        serde_json::from_value(chunking_definition()).unwrap();
    let pipeline =
        Pipeline::from_definition("chunking", &definition.blocks, &registry).unwrap();

    let results = pipeline
        .execute(
            state(&[("file_content", json!("A. B. C."))]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap()
        .into_results();

    assert_eq!(results.len(), 3);
    let trace_ids: HashSet<&str> = results.iter().map(|r| r.trace_id.as_str()).collect();
    assert_eq!(trace_ids.len(), 3, "each seed gets a fresh trace id");
    for result in &results {
        // the downstream blocks (block count minus the multiplier)
        assert_eq!(result.trace.len(), 1);
        assert!(result.result.contains_key("chunk_text"));
        assert_eq!(result.result.get("valid"), Some(&json!(false)));
    }
}

#[tokio::test]
async fn fanout_job_persists_one_record_per_chunk() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());

    let pipeline_id = storage
        .save_pipeline("chunking", &chunking_definition())
        .await
        .unwrap();
    let job_id = storage
        .create_job(pipeline_id, 1, JobStatus::Running)
        .await
        .unwrap();
    queue
        .create_job(job_id, pipeline_id, 1, JobStatus::Running)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("seeds.json");
    std::fs::write(
        &seed_path,
        serde_json::to_string(&json!([
            {"repetitions": 1, "metadata": {"file_content": "A. B. C."}}
        ]))
        .unwrap(),
    )
    .unwrap();

    let handle = spawn_job_worker(JobContext {
        job_id,
        pipeline_id,
        seed_file: seed_path,
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .unwrap();
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .unwrap()
        .unwrap();

    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 3);
    assert_eq!(job.records_failed, 0);

    let records = storage
        .get_records(&RecordFilter {
            job_id: Some(job_id),
            limit: 100,
            ..RecordFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 3);

    let mut seen_chunks = HashSet::new();
    for record in &records {
        // metadata holds the original seed input, not the chunk
        assert_eq!(
            record.metadata.get("file_content"),
            Some(&json!("A. B. C."))
        );
        assert_eq!(record.trace.len(), 1);
        let output: Value = serde_json::from_str(&record.output).unwrap();
        seen_chunks.insert(output.get("chunk_text").unwrap().as_str().unwrap().to_string());
    }
    assert_eq!(seen_chunks.len(), 3);
}

#[tokio::test]
async fn one_failing_seed_does_not_abort_the_rest() {
    let storage = Storage::connect(":memory:").await.unwrap();
    let queue = Arc::new(JobQueue::new());
    let registry = Arc::new(BlockRegistry::new());

    // fails only on the second chunk
    let factory: BlockFactory = Arc::new(|_config| {
        Ok(Arc::new(common::FailWhenBlock {
            field: "chunk_index".to_string(),
            value: json!(1),
            result: state(&[("checked", json!(true))]),
        }) as Arc<dyn Block>)
    });
    registry.register(
        spec("ChunkChecker", &["checked"], false),
        factory,
        BlockSource::Builtin,
        true,
        None,
    );

    let definition = json!({
        "blocks": [
            {"type": "MarkdownMultiplier", "config": {"parser_type": "sentence", "chunk_size": 100}},
            {"type": "ChunkChecker", "config": {}}
        ]
    });
    let pipeline_id = storage.save_pipeline("flaky", &definition).await.unwrap();
    let job_id = storage
        .create_job(pipeline_id, 1, JobStatus::Running)
        .await
        .unwrap();
    queue
        .create_job(job_id, pipeline_id, 1, JobStatus::Running)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("seeds.json");
    std::fs::write(
        &seed_path,
        serde_json::to_string(&json!([
            {"repetitions": 1, "metadata": {"file_content": "A. B. C."}}
        ]))
        .unwrap(),
    )
    .unwrap();

    let handle = spawn_job_worker(JobContext {
        job_id,
        pipeline_id,
        seed_file: seed_path,
        queue: queue.clone(),
        storage: storage.clone(),
        registry,
    })
    .unwrap();
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .unwrap()
        .unwrap();

    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 2);
    assert_eq!(job.records_failed, 1);

    let records = storage
        .get_records(&RecordFilter {
            job_id: Some(job_id),
            limit: 100,
            ..RecordFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 2, "the failed seed's record is not persisted");
}

#[tokio::test]
async fn empty_content_fans_out_to_nothing() {
    let registry = BlockRegistry::new();
    let definition: datagenflow::PipelineDefinition =
        serde_json::from_value(chunking_definition()).unwrap();
    let pipeline =
        Pipeline::from_definition("chunking", &definition.blocks, &registry).unwrap();

    let results = pipeline
        .execute(
            state(&[("file_content", json!(""))]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap()
        .into_results();
    assert!(results.is_empty());
}

#[tokio::test]
async fn fanout_seed_state_is_independent_per_seed() {
    let registry = BlockRegistry::new();
    let definition: datagenflow::PipelineDefinition = serde_json::from_value(json!({
        "blocks": [
            {"type": "MarkdownMultiplier", "config": {"parser_type": "sentence", "chunk_size": 100}}
        ]
    }))
    .unwrap();
    let pipeline = Pipeline::from_definition("bare", &definition.blocks, &registry).unwrap();

    let results = pipeline
        .execute(
            state(&[("file_content", json!("First. Second."))]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap()
        .into_results();

    // no downstream blocks: accumulated state is exactly the seed map
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].result.get("chunk_text"), Some(&json!("First.")));
    assert_eq!(results[1].result.get("chunk_text"), Some(&json!("Second.")));
    assert!(results[0].result.get("file_content").is_none());
}
