//! Integration tests for the concrete scenarios in spec.md §8.
//!
//! Mirrors the teacher's `tool_integration_tests.rs`: each test wires a
//! `MockLmClient` (or a sequence of scripted replies) through the public
//! `Rlm`/`Environment`/`LmHandler` surface and asserts on the observable
//! outcome, not on internals.

use std::sync::{Arc, Mutex};

use serde_json::json;

use rlm::rlm::clients::mock::MockLmClient;
use rlm::rlm::environment::{create_environment, LmHandlerAddress};
use rlm::rlm::logger::TrajectoryLogger;
use rlm::rlm::verbose::VerbosePrinter;
use rlm::{BindingValue, CompletionRequest, Environment, LmClient, LmHandler, Prompt, Rlm, RlmIteration};

/// Captures every iteration a completion emits, in order, so tests can
/// inspect per-turn detail (stderr text, final_answer) without the
/// controller exposing history directly.
#[derive(Default)]
struct CapturingPrinter {
    iterations: Mutex<Vec<RlmIteration>>,
}

impl VerbosePrinter for CapturingPrinter {
    fn on_iteration_complete(&self, iteration: &RlmIteration) {
        self.iterations.lock().unwrap().push(iteration.clone());
    }
}

#[tokio::test]
async fn s1_happy_path_final_marker_stops_at_first_turn() {
    let rlm = Rlm::new("mock", json!({ "model_name": "m", "reply": "FINAL(42)" }));

    let result = rlm.completion("Return 42.", None).await.unwrap();

    assert_eq!(result.response, "42");
    assert_eq!(result.usage_summary.total_call_count(), 1);
}

#[tokio::test]
async fn s2_code_then_final_var_resolves_persisted_binding() {
    let rlm = Rlm::new(
        "mock",
        json!({
            "model_name": "m",
            "script": ["```repl\nx = sum(range(1,11))\n```", "FINAL_VAR(x)"],
        }),
    );

    let result = rlm.completion("compute the sum", None).await.unwrap();

    assert_eq!(result.response, "55");
}

#[tokio::test]
async fn s3_nested_sub_query_lands_in_nested_calls() {
    let primary: Arc<dyn LmClient> = Arc::new(MockLmClient::constant("inner-model", "pong"));
    let mut handler = LmHandler::start(primary, Vec::new(), 8).await.unwrap();
    let address = LmHandlerAddress {
        host: handler.host().to_string(),
        port: handler.port(),
    };

    let env = create_environment("local", &json!({})).unwrap();
    env.setup(address).await.unwrap();
    env.load_context(&CompletionRequest::Text("ignored".to_string()))
        .await
        .unwrap();

    let result = env.execute_code("print(llm_query(\"ping\"))").await;

    assert!(result.stdout.contains("pong"), "stdout was: {:?}", result.stdout);
    assert_eq!(result.nested_calls.len(), 1);
    assert_eq!(result.nested_calls[0].prompt, "ping");
    assert_eq!(result.nested_calls[0].result.response, "pong");

    env.cleanup().await;
    handler.stop().await;
}

#[tokio::test]
async fn s4_batched_sub_queries_preserve_caller_order() {
    // Reverses whatever text it's asked, so the reply order only matches
    // input order if the handler reassembles by index rather than by
    // completion order.
    let primary: Arc<dyn LmClient> = Arc::new(MockLmClient::new("inner-model", |prompt| match prompt {
        Prompt::Text(s) => s.chars().rev().collect(),
        Prompt::Messages(_) => String::new(),
    }));
    let mut handler = LmHandler::start(primary, Vec::new(), 8).await.unwrap();
    let address = LmHandlerAddress {
        host: handler.host().to_string(),
        port: handler.port(),
    };

    let env = create_environment("local", &json!({})).unwrap();
    env.setup(address).await.unwrap();
    env.load_context(&CompletionRequest::Text("ignored".to_string()))
        .await
        .unwrap();

    let result = env
        .execute_code("result = llm_query_batched([\"abc\", \"de\", \"f\"])")
        .await;

    assert!(result.stderr.is_empty(), "stderr was: {:?}", result.stderr);
    match result.bindings.get("result") {
        Some(BindingValue::List(items)) => {
            assert_eq!(items.len(), 3);
            assert!(matches!(&items[0], BindingValue::Str(s) if s == "cba"));
            assert!(matches!(&items[1], BindingValue::Str(s) if s == "ed"));
            assert!(matches!(&items[2], BindingValue::Str(s) if s == "f"));
        }
        other => panic!("expected a list binding named `result`, got {:?}", other),
    }
    assert_eq!(result.nested_calls.len(), 3);

    env.cleanup().await;
    handler.stop().await;
}

#[tokio::test]
async fn s5_execution_error_becomes_prompt_text_not_a_failure() {
    let printer = Arc::new(CapturingPrinter::default());
    let rlm = Rlm::new(
        "mock",
        json!({
            "model_name": "m",
            "script": ["```repl\n1 / 0\n```", "FINAL(recovered)"],
        }),
    )
    .with_verbose_printer(printer.clone());

    let result = rlm.completion("divide by zero", None).await.unwrap();

    assert_eq!(result.response, "recovered");

    let iterations = printer.iterations.lock().unwrap();
    assert_eq!(iterations.len(), 2);
    assert!(iterations[0].final_answer.is_none());
    assert!(
        iterations[0].code_blocks[0].result.stderr.contains("ZeroDivisionError"),
        "stderr was: {:?}",
        iterations[0].code_blocks[0].result.stderr
    );
    assert_eq!(iterations[1].final_answer.as_deref(), Some("recovered"));
}

#[tokio::test]
async fn s6_iteration_exhaustion_logs_synthesis_as_a_third_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let logger = Arc::new(TrajectoryLogger::new(dir.path(), "rlm", "s6", "20260101T000000Z").unwrap());

    let rlm = Rlm::new("mock", json!({ "model_name": "m", "reply": "no marker here" }))
        .with_max_iterations(2)
        .with_logger(logger.clone());

    let result = rlm.completion("keep going", None).await.unwrap();
    assert_eq!(result.response, "no marker here");

    let path = dir.path().join("rlm_20260101T000000Z_s6.jsonl");
    let contents = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();

    // metadata + 2 normal turns + 1 synthesizing turn.
    assert_eq!(lines.len(), 4);
    assert!(lines[1].contains("\"iteration\":1"));
    assert!(lines[2].contains("\"iteration\":2"));
    assert!(lines[3].contains("\"iteration\":3"));
    assert!(lines[3].contains("\"final_answer\":\"no marker here\""));
}

#[tokio::test]
async fn flat_fallback_bypasses_the_turn_loop_at_depth_zero() {
    let rlm = Rlm::new("mock", json!({ "model_name": "m", "reply": "flat answer" }))
        .with_max_depth(0)
        .unwrap();

    let result = rlm.completion("anything", None).await.unwrap();

    assert_eq!(result.response, "flat answer");
}
