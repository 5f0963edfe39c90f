//! Direct (one-shot) pipeline execution

mod common;

use common::{register_static, spec, state, MockChat, StaticBlock};
use datagenflow::blocks::{Block, BlockFactory, BlockOutput, BlockSource};
use datagenflow::{
    provider, BlockDefinition, BlockRegistry, EngineError, ExecuteOptions, Pipeline, StateMap,
    UsageTracker,
};
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;

fn definitions(types: &[&str]) -> Vec<BlockDefinition> {
    types
        .iter()
        .map(|t| BlockDefinition {
            block_type: t.to_string(),
            config: StateMap::new(),
        })
        .collect()
}

#[tokio::test]
async fn normal_pipeline_returns_one_result_with_full_trace() {
    let registry = BlockRegistry::new();
    register_static(&registry, "A", &["a"], state(&[("a", json!(1))]));
    register_static(&registry, "B", &["b"], state(&[("b", json!(2))]));

    let pipeline = Pipeline::from_definition("two-step", &definitions(&["A", "B"]), &registry)
        .unwrap();
    let result = pipeline
        .execute(state(&[("seed", json!("x"))]), ExecuteOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert_eq!(result.trace.len(), 2);
    assert_eq!(result.result.get("a"), Some(&json!(1)));
    assert_eq!(result.result.get("b"), Some(&json!(2)));
    assert_eq!(result.result.get("seed"), Some(&json!("x")));

    // trace chaining: each entry's input is the previous post-merge state
    assert_eq!(result.trace[0].input, state(&[("seed", json!("x"))]));
    assert_eq!(
        Some(&result.trace[1].input),
        result.trace[0].accumulated_state.as_ref()
    );
    assert_eq!(
        result.trace[1].accumulated_state.as_ref(),
        Some(&result.result)
    );
}

#[tokio::test]
async fn empty_pipeline_is_a_trivial_execution() {
    let registry = BlockRegistry::new();
    let pipeline = Pipeline::from_definition("empty", &[], &registry).unwrap();
    let initial = state(&[("k", json!("v"))]);
    let result = pipeline
        .execute(initial.clone(), ExecuteOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(result.result, initial);
    assert!(result.trace.is_empty());
    assert!(!result.trace_id.is_empty());
    assert_eq!(result.usage.total_tokens(), 0);
}

#[tokio::test]
async fn block_returning_nothing_is_valid() {
    let registry = BlockRegistry::new();
    register_static(&registry, "Noop", &["x"], StateMap::new());
    let pipeline = Pipeline::from_definition("noop", &definitions(&["Noop"]), &registry).unwrap();
    let result = pipeline
        .execute(state(&[("k", json!(1))]), ExecuteOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(result.result, state(&[("k", json!(1))]));
    assert_eq!(result.trace.len(), 1);
    assert_eq!(result.trace[0].output, Some(StateMap::new()));
}

#[tokio::test]
async fn undeclared_output_raises_validation_error() {
    let registry = BlockRegistry::new();
    register_static(
        &registry,
        "Leaky",
        &["x"],
        state(&[("x", json!(1)), ("y", json!(2))]),
    );
    let pipeline = Pipeline::from_definition("leaky", &definitions(&["Leaky"]), &registry).unwrap();
    let err = pipeline
        .execute(StateMap::new(), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("\"y\""));
}

#[tokio::test]
async fn wildcard_outputs_disable_validation() {
    let registry = BlockRegistry::new();
    register_static(
        &registry,
        "Free",
        &["*"],
        state(&[("whatever", json!(true))]),
    );
    let pipeline = Pipeline::from_definition("free", &definitions(&["Free"]), &registry).unwrap();
    let result = pipeline
        .execute(StateMap::new(), ExecuteOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(result.result.get("whatever"), Some(&json!(true)));
}

#[tokio::test]
async fn block_failures_are_wrapped_with_step_detail() {
    let registry = BlockRegistry::new();
    register_static(&registry, "Ok1", &["a"], state(&[("a", json!(1))]));
    let factory: BlockFactory = Arc::new(|_config| {
        Ok(Arc::new(common::FailWhenBlock {
            field: "a".to_string(),
            value: json!(1),
            result: StateMap::new(),
        }) as Arc<dyn Block>)
    });
    registry.register(spec("Boom", &["b"], false), factory, BlockSource::Builtin, true, None);

    let pipeline =
        Pipeline::from_definition("boom", &definitions(&["Ok1", "Boom"]), &registry).unwrap();
    let err = pipeline
        .execute(StateMap::new(), ExecuteOptions::default())
        .await
        .unwrap_err();
    match err {
        EngineError::BlockExecution {
            block_type,
            step,
            input,
            ..
        } => {
            assert_eq!(block_type, "Boom");
            assert_eq!(step, 2);
            assert_eq!(input.get("a"), Some(&json!(1)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unknown_block_type_lists_available() {
    let registry = BlockRegistry::new();
    let err = Pipeline::from_definition("nope", &definitions(&["Mystery"]), &registry).unwrap_err();
    match err {
        EngineError::BlockNotFound {
            block_type,
            available,
        } => {
            assert_eq!(block_type, "Mystery");
            assert!(available.contains(&"TextGenerator".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn multiplier_must_be_first_and_unique() {
    let registry = BlockRegistry::new();
    register_static(&registry, "Plain", &["a"], StateMap::new());

    let err = Pipeline::from_definition(
        "late-multiplier",
        &definitions(&["Plain", "MarkdownMultiplier"]),
        &registry,
    )
    .unwrap_err();
    assert!(err.to_string().contains("must be first"));

    let err = Pipeline::from_definition(
        "double-multiplier",
        &definitions(&["MarkdownMultiplier", "MarkdownMultiplier"]),
        &registry,
    )
    .unwrap_err();
    assert!(err.to_string().contains("one multiplier"));
}

#[tokio::test]
async fn usage_deltas_accumulate_and_never_merge() {
    let registry = BlockRegistry::new();
    register_static(
        &registry,
        "Spender1",
        &["a"],
        state(&[
            ("a", json!(1)),
            ("_usage", json!({"input_tokens": 1, "output_tokens": 2})),
        ]),
    );
    register_static(
        &registry,
        "Spender2",
        &["b"],
        state(&[
            ("b", json!(2)),
            (
                "_usage",
                json!({"input_tokens": 3, "output_tokens": 4, "cached_tokens": 5}),
            ),
        ]),
    );

    let pipeline =
        Pipeline::from_definition("spend", &definitions(&["Spender1", "Spender2"]), &registry)
            .unwrap();
    let result = pipeline
        .execute(StateMap::new(), ExecuteOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert_eq!(result.usage.input_tokens, 4);
    assert_eq!(result.usage.output_tokens, 6);
    assert_eq!(result.usage.cached_tokens, 5);
    // the reserved key never reaches accumulated state or the trace output
    assert!(!result.result.contains_key("_usage"));
    assert!(!result.trace[0]
        .output
        .as_ref()
        .unwrap()
        .contains_key("_usage"));
}

#[tokio::test]
async fn malformed_usage_is_discarded_not_fatal() {
    let registry = BlockRegistry::new();
    register_static(
        &registry,
        "BadUsage",
        &["a"],
        state(&[("a", json!(1)), ("_usage", json!("not a usage object"))]),
    );
    let pipeline =
        Pipeline::from_definition("bad-usage", &definitions(&["BadUsage"]), &registry).unwrap();
    let result = pipeline
        .execute(StateMap::new(), ExecuteOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(result.usage.total_tokens(), 0);
    assert_eq!(result.result.get("a"), Some(&json!(1)));
}

#[tokio::test]
#[serial]
async fn text_generator_renders_prompts_and_extracts_usage() {
    std::env::set_var("LLM_ENDPOINT", "http://localhost:9/v1");
    std::env::set_var("LLM_MODEL", "test-model");
    provider::set_chat_service(Arc::new(MockChat {
        content: "hello Ann".to_string(),
        usage: Some(datagenflow::TokenCounts {
            input_tokens: 5,
            output_tokens: 3,
            cached_tokens: 0,
        }),
    }));

    let registry = BlockRegistry::new();
    let mut config = StateMap::new();
    config.insert("user_prompt".to_string(), json!("hi {{ user }}"));
    let pipeline = Pipeline::from_definition(
        "greeting",
        &[BlockDefinition {
            block_type: "TextGenerator".to_string(),
            config,
        }],
        &registry,
    )
    .unwrap();

    let result = pipeline
        .execute(state(&[("user", json!("Ann"))]), ExecuteOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert_eq!(result.result.get("assistant"), Some(&json!("hello Ann")));
    assert_eq!(result.result.get("user"), Some(&json!("hi Ann")));
    assert_eq!(result.usage.total_tokens(), 8);

    std::env::remove_var("LLM_ENDPOINT");
    std::env::remove_var("LLM_MODEL");
}

#[tokio::test]
#[serial]
async fn gateway_success_hook_feeds_the_usage_tracker() {
    provider::set_chat_service(Arc::new(MockChat {
        content: "ok".to_string(),
        usage: Some(datagenflow::TokenCounts {
            input_tokens: 7,
            output_tokens: 2,
            cached_tokens: 1,
        }),
    }));

    let params = datagenflow::provider::LlmCallParams {
        model: "test".to_string(),
        api_base: "http://localhost:9".to_string(),
        api_key: None,
        messages: vec![],
        temperature: 0.0,
        max_tokens: 1,
        timeout: None,
        metadata_trace_id: Some("trace-hook".to_string()),
    };
    provider::complete(&params).await.unwrap();

    let counts = UsageTracker::global().get_and_clear("trace-hook");
    assert_eq!(counts.input_tokens, 7);
    assert_eq!(counts.output_tokens, 2);
    assert_eq!(counts.cached_tokens, 1);
}

#[tokio::test]
async fn static_block_helper_ignores_context() {
    // sanity check of the test scaffolding itself
    let block = StaticBlock {
        result: state(&[("x", json!(1))]),
    };
    let ctx = datagenflow::BlockExecutionContext::new(
        "t".to_string(),
        0,
        1,
        StateMap::new(),
        Default::default(),
    );
    match block.execute(&ctx).await.unwrap() {
        BlockOutput::Single(map) => assert_eq!(map.get("x"), Some(&json!(1))),
        _ => panic!("expected single output"),
    }
}

#[tokio::test]
async fn into_single_rejects_fanout() {
    let registry = BlockRegistry::new();
    let mut config = StateMap::new();
    config.insert("parser_type".to_string(), Value::String("sentence".into()));
    let pipeline = Pipeline::from_definition(
        "fanout",
        &[BlockDefinition {
            block_type: "MarkdownMultiplier".to_string(),
            config,
        }],
        &registry,
    )
    .unwrap();
    let outcome = pipeline
        .execute(state(&[("file_content", json!("A. B."))]), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(outcome.into_single().is_err());
}
