use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::testing::test_audit;
use crate::workflow::{Block, StepSpec, WorkflowContext, WorkflowExecutor};

struct ConstBlock(Value);

#[async_trait]
impl Block for ConstBlock {
    async fn call(&self, _input: Value) -> Result<Value> {
        Ok(self.0.clone())
    }
}

struct EchoBlock;

#[async_trait]
impl Block for EchoBlock {
    async fn call(&self, input: Value) -> Result<Value> {
        Ok(input)
    }
}

struct FailBlock;

#[async_trait]
impl Block for FailBlock {
    async fn call(&self, _input: Value) -> Result<Value> {
        bail!("scripted failure")
    }
}

struct CountingBlock(Arc<AtomicU32>);

#[async_trait]
impl Block for CountingBlock {
    async fn call(&self, _input: Value) -> Result<Value> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": true }))
    }
}

fn executor() -> WorkflowExecutor {
    WorkflowExecutor::new("sess-test", test_audit())
}

#[tokio::test]
async fn failing_step_does_not_halt_the_batch() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut exec = executor();
    exec.register("first", Arc::new(ConstBlock(json!({ "value": 1 }))));
    exec.register("boom", Arc::new(FailBlock));
    exec.register("last", Arc::new(CountingBlock(calls.clone())));

    let outcome = exec
        .run(&[
            StepSpec::new("a", "first", json!({})),
            StepSpec::new("b", "boom", json!({})),
            StepSpec::new("c", "last", json!({})),
        ])
        .await;

    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].step, "b");
    assert!(outcome.errors[0].error.contains("scripted failure"));
    // The step after the failure still ran.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.results[1].step, "c");
}

#[tokio::test]
async fn references_resolve_against_prior_outputs() {
    let mut exec = executor();
    exec.register(
        "detail",
        Arc::new(ConstBlock(json!({ "noteId": "n-42", "meta": { "author": "kay" } }))),
    );
    exec.register("echo", Arc::new(EchoBlock));

    let outcome = exec
        .run(&[
            StepSpec::new("open", "detail", json!({})),
            StepSpec::new(
                "use",
                "echo",
                json!({
                    "id": "$open.noteId",
                    "who": "$open.meta.author",
                    "all": "$open",
                    "nested": { "again": "$open.noteId" },
                }),
            ),
        ])
        .await;

    assert!(outcome.success);
    let output = &outcome.results[1].output;
    assert_eq!(output["id"], json!("n-42"));
    assert_eq!(output["who"], json!("kay"));
    assert_eq!(output["all"]["noteId"], json!("n-42"));
    assert_eq!(output["nested"]["again"], json!("n-42"));
}

#[tokio::test]
async fn unresolvable_reference_fails_only_that_step() {
    let mut exec = executor();
    exec.register("echo", Arc::new(EchoBlock));

    let outcome = exec
        .run(&[
            StepSpec::new("a", "echo", json!({ "x": "$missing.field" })),
            StepSpec::new("b", "echo", json!({ "x": 1 })),
        ])
        .await;

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].step, "a");
    assert!(outcome.errors[0].error.contains("$missing"));
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].step, "b");
}

#[tokio::test]
async fn unregistered_block_is_an_error_not_a_panic() {
    let exec = executor();

    let outcome = exec
        .run(&[StepSpec::new("a", "nonexistent", json!({}))])
        .await;

    assert!(!outcome.success);
    assert!(outcome.errors[0].error.contains("not registered"));
}

#[tokio::test]
async fn scalars_and_non_dollar_strings_pass_through() {
    let ctx = WorkflowContext::new();
    let input = json!({ "s": "plain", "n": 7, "b": true, "arr": [1, "two"] });
    assert_eq!(ctx.resolve(&input).unwrap(), input);
}
