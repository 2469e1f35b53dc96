use std::time::{Duration, Instant};

use anyhow::Result;
use noderun::{
    Entry, ExecutionError, Invocation, InvocationState, MapResolver, NodeError, NodeExecutor,
    NodeSpec, ResolverChain, Schema, ValidationError, Value,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::common::builder;

fn invocation(source: &str) -> Invocation {
    Invocation::new(Entry::expression(source), builder().timeout(Duration::from_secs(30)))
        .with_label("test")
}

async fn cancel_after(source: &str, delay: Duration) -> (Result<Value, ExecutionError>, Duration, InvocationState) {
    let invocation = invocation(source);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        invocation.run(json!({}).into(), &cancel),
    )
    .await
    .unwrap_or_else(|_| Err(ExecutionError::Internal("cancel did not preempt".to_owned())));
    (outcome, started.elapsed(), invocation.state())
}

#[tokio::test]
async fn integration_js_cancel_preempts_pending_promise() -> Result<()> {
    let (outcome, elapsed, state) =
        cancel_after("() => new Promise(() => {})", Duration::from_millis(100)).await;
    assert_eq!(outcome, Err(ExecutionError::Disposed));
    assert_eq!(state, InvocationState::Disposed);
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn integration_js_cancel_preempts_busy_loop() -> Result<()> {
    let (outcome, elapsed, state) =
        cancel_after("() => { while (true) {} }", Duration::from_millis(100)).await;
    assert_eq!(outcome, Err(ExecutionError::Disposed));
    assert_eq!(state, InvocationState::Disposed);
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn integration_js_invocation_completes() -> Result<()> {
    let invocation = invocation("({ data }) => data.n + 1");
    assert_eq!(invocation.state(), InvocationState::Created);
    let output = invocation
        .run(json!({"n": 41}).into(), &CancellationToken::new())
        .await?;
    assert_eq!(output, Value::from(42));
    assert_eq!(invocation.state(), InvocationState::Completed);
    Ok(())
}

#[tokio::test]
async fn integration_js_invocation_failure() -> Result<()> {
    let invocation = invocation("() => { throw new Error('nope'); }");
    let err = invocation
        .run(Value::Null, &CancellationToken::new())
        .await
        .expect_err("throwing entry");
    assert!(
        matches!(&err, ExecutionError::Thrown { message, .. } if message == "nope"),
        "{err:?}"
    );
    assert_eq!(invocation.state(), InvocationState::Failed);
    Ok(())
}

#[tokio::test]
async fn integration_js_invocation_result_callables_are_released() -> Result<()> {
    let invocation = invocation("() => ({ f: () => 1 })");
    let output = invocation.run(Value::Null, &CancellationToken::new()).await?;
    let Some(Value::Function(f)) = output.get("f") else {
        panic!("expected a callable, got {output:?}");
    };
    assert_eq!(f.call(vec![]).await, Err(ExecutionError::Disposed));
    Ok(())
}

fn doubling_node() -> Result<NodeSpec> {
    Ok(NodeSpec {
        id: "double".to_owned(),
        code: "({ data }) => ({ doubled: data.value * 2 })".to_owned(),
        input_schema: Schema::from_json(&json!({
            "type": "object",
            "properties": {
                "value": { "type": "number", "minimum": 0 }
            },
            "required": ["value"]
        }))?,
        output_schema: Some(Schema::from_json(&json!({
            "type": "object",
            "properties": { "doubled": { "type": "number" } }
        }))?),
    })
}

fn resolvers() -> ResolverChain {
    ResolverChain::new().with(MapResolver::new("Nodes").with("up", json!({"value": "20"})))
}

#[tokio::test]
async fn integration_js_node_resolves_references() -> Result<()> {
    let executor = NodeExecutor::new(builder());
    let output = executor
        .invoke(
            &doubling_node()?,
            json!({"value": {"$ref": "#/Nodes/up/value"}}).into(),
            &resolvers(),
            &CancellationToken::new(),
        )
        .await?;
    assert_eq!(output.to_json(), json!({"doubled": 40}));
    Ok(())
}

#[tokio::test]
async fn integration_js_node_rejects_invalid_input() -> Result<()> {
    let executor = NodeExecutor::new(builder());
    let err = executor
        .invoke(
            &doubling_node()?,
            json!({"value": -1}).into(),
            &resolvers(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("negative input");
    assert!(
        matches!(
            &err,
            NodeError::Input(ValidationError::NumberTooSmall { path, .. }) if path.as_str() == "value"
        ),
        "{err:?}"
    );
    Ok(())
}

#[tokio::test]
async fn integration_js_node_rejects_invalid_output() -> Result<()> {
    let mut node = doubling_node()?;
    node.code = "({ data }) => data.value".to_owned();
    let executor = NodeExecutor::new(builder());
    let err = executor
        .invoke(
            &node,
            json!({"value": 3}).into(),
            &resolvers(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("scalar output");
    assert!(
        matches!(
            &err,
            NodeError::Output(ValidationError::InputNotObject { actual: "number", .. })
        ),
        "{err:?}"
    );
    Ok(())
}
