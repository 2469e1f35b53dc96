use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use noderun::{Entry, ExecutionError, Value, value::Map};

use super::common::{builder, call_with_timeout, context};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn integration_js_doubles_number() -> Result<()> {
    let ctx = context("(n) => n * 2").await?;
    let value = call_with_timeout(&ctx, vec![Value::from(21)], CALL_TIMEOUT)
        .await
        .context("failed to call entry")?;
    assert_eq!(value, Value::Number(42.0));
    Ok(())
}

#[tokio::test]
async fn integration_js_async_entry() -> Result<()> {
    let ctx = context("async (a, b) => { await null; return `${a}-${b}`; }").await?;
    let value = call_with_timeout(&ctx, vec!["x".into(), 1.5.into()], CALL_TIMEOUT)
        .await
        .context("failed to call async entry")?;
    assert_eq!(value, Value::from("x-1.5"));
    Ok(())
}

#[tokio::test]
async fn integration_js_context_is_reusable() -> Result<()> {
    let ctx = context("(() => { let calls = 0; return () => ++calls; })()").await?;
    for expected in 1..=3 {
        let value = call_with_timeout(&ctx, vec![], CALL_TIMEOUT).await?;
        assert_eq!(value, Value::from(expected));
    }
    Ok(())
}

#[tokio::test]
async fn integration_js_arguments_are_copied() -> Result<()> {
    let ctx = context("(obj, buf) => { obj.touched = true; return [Object.keys(obj).length, new Uint8Array(buf).length]; }")
        .await?;
    let obj = Value::Object(Map::from([("a".to_owned(), Value::from(1))]));
    let value = call_with_timeout(
        &ctx,
        vec![obj.clone(), Value::Bytes(Bytes::from_static(b"abc"))],
        CALL_TIMEOUT,
    )
    .await?;
    assert_eq!(value, Value::from(vec![Value::from(2), Value::from(3)]));
    assert_eq!(obj.get("touched"), None);
    Ok(())
}

#[tokio::test]
async fn integration_js_global_entry() -> Result<()> {
    let ctx = builder()
        .build(Entry::global(
            "const factor = 3; function main(x) { return { scaled: x * factor }; }",
            "main",
        ))
        .await
        .context("failed to build global entry")?;
    let value = call_with_timeout(&ctx, vec![Value::from(5)], CALL_TIMEOUT).await?;
    assert_eq!(value.get("scaled"), Some(&Value::from(15)));
    Ok(())
}

#[tokio::test]
async fn integration_js_compile_errors() -> Result<()> {
    for source in ["(x) => {", "42"] {
        let err = builder()
            .build(Entry::expression(source))
            .await
            .expect_err("entry should not compile");
        assert!(
            matches!(err, ExecutionError::Compile { .. }),
            "unexpected error for {source:?}: {err:?}"
        );
    }

    let err = builder()
        .build(Entry::global("var notMain = 1;", "main"))
        .await
        .expect_err("missing global should not compile");
    assert!(matches!(err, ExecutionError::Compile { .. }), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn integration_js_thrown_errors_keep_shape() -> Result<()> {
    let ctx = context("(kind) => { if (kind === 'sync') throw new RangeError('bad input'); return Promise.reject(new TypeError('async failure')); }")
        .await?;

    let err = call_with_timeout(&ctx, vec!["sync".into()], CALL_TIMEOUT)
        .await
        .expect_err("sync throw");
    match err {
        ExecutionError::Thrown {
            name,
            message,
            stack,
        } => {
            assert_eq!(name, "RangeError");
            assert_eq!(message, "bad input");
            assert!(stack.is_some());
        }
        other => panic!("expected thrown error, got {other:?}"),
    }

    let err = call_with_timeout(&ctx, vec!["async".into()], CALL_TIMEOUT)
        .await
        .expect_err("async rejection");
    assert!(
        matches!(&err, ExecutionError::Thrown { name, message, .. } if name == "TypeError" && message == "async failure"),
        "{err:?}"
    );
    Ok(())
}

#[tokio::test]
async fn integration_js_non_error_throws_are_opaque() -> Result<()> {
    let ctx = context(
        "(kind) => { if (kind === 'object') throw { message: 'sneaky', name: 'Error' }; return Promise.reject('plain string'); }",
    )
    .await?;
    for kind in ["object", "string"] {
        let err = call_with_timeout(&ctx, vec![kind.into()], CALL_TIMEOUT)
            .await
            .expect_err("non-error throw");
        assert_eq!(err, ExecutionError::NonErrorThrown, "kind {kind}");
    }
    Ok(())
}

#[tokio::test]
async fn integration_js_busy_loop_times_out() -> Result<()> {
    let timeout = Duration::from_millis(200);
    let ctx = builder()
        .timeout(timeout)
        .build(Entry::expression(
            "(spin) => { if (spin) { while (true) {} } return 'ok'; }",
        ))
        .await?;

    let err = call_with_timeout(&ctx, vec![true.into()], CALL_TIMEOUT)
        .await
        .expect_err("busy loop");
    assert_eq!(err, ExecutionError::Timeout { limit: timeout });

    let value = call_with_timeout(&ctx, vec![false.into()], CALL_TIMEOUT).await?;
    assert_eq!(value, Value::from("ok"));
    Ok(())
}

#[tokio::test]
async fn integration_js_pending_promise_times_out() -> Result<()> {
    let timeout = Duration::from_millis(200);
    let ctx = builder()
        .timeout(timeout)
        .build(Entry::expression("() => new Promise(() => {})"))
        .await?;
    let err = call_with_timeout(&ctx, vec![], CALL_TIMEOUT)
        .await
        .expect_err("never resolves");
    assert_eq!(err, ExecutionError::Timeout { limit: timeout });
    assert!(!ctx.is_disposed());
    Ok(())
}

#[tokio::test]
async fn integration_js_memory_limit_is_fatal() -> Result<()> {
    let fatal = Arc::new(AtomicBool::new(false));
    let flag = fatal.clone();
    let ctx = builder()
        .memory_limit(8 * 1024 * 1024)
        .on_fatal(move |_| flag.store(true, Ordering::SeqCst))
        .build(Entry::expression(
            "() => { const chunks = []; while (true) { chunks.push(new Array(1 << 16).fill(chunks.length)); } }",
        ))
        .await?;

    let err = call_with_timeout(&ctx, vec![], CALL_TIMEOUT)
        .await
        .expect_err("allocation loop");
    assert!(matches!(err, ExecutionError::Fatal { .. }), "{err:?}");

    // The context is gone; the host process is not.
    let err = call_with_timeout(&ctx, vec![], CALL_TIMEOUT)
        .await
        .expect_err("context after fatal");
    assert!(matches!(err, ExecutionError::Fatal { .. }), "{err:?}");
    assert!(ctx.is_disposed());
    assert!(fatal.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn integration_js_memory_limit_survives_catch() -> Result<()> {
    let ctx = builder()
        .memory_limit(8 * 1024 * 1024)
        .build(Entry::expression(
            "() => { const chunks = []; try { while (true) { chunks.push(new Array(1 << 16).fill(0)); } } catch (e) { chunks.length = 0; } return 'recovered'; }",
        ))
        .await?;

    let err = call_with_timeout(&ctx, vec![], CALL_TIMEOUT)
        .await
        .expect_err("swallowed allocation failure");
    assert!(matches!(err, ExecutionError::Fatal { .. }), "{err:?}");
    assert!(ctx.is_disposed());
    Ok(())
}

#[tokio::test]
async fn integration_js_out_of_memory_message_is_not_fatal() -> Result<()> {
    let fatal = Arc::new(AtomicBool::new(false));
    let flag = fatal.clone();
    let ctx = builder()
        .on_fatal(move |_| flag.store(true, Ordering::SeqCst))
        .build(Entry::expression(
            "(x) => { if (x) throw new Error('upstream said: out of memory'); return 1; }",
        ))
        .await?;

    let err = call_with_timeout(&ctx, vec![true.into()], CALL_TIMEOUT)
        .await
        .expect_err("thrown error");
    assert!(
        matches!(
            &err,
            ExecutionError::Thrown { name, message, .. }
                if name == "Error" && message == "upstream said: out of memory"
        ),
        "{err:?}"
    );

    let value = call_with_timeout(&ctx, vec![false.into()], CALL_TIMEOUT).await?;
    assert_eq!(value, Value::from(1));
    assert!(!ctx.is_disposed());
    assert!(!fatal.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn integration_js_dispose_is_idempotent() -> Result<()> {
    let ctx = context("() => 1").await?;
    ctx.dispose();
    ctx.dispose();
    assert!(ctx.is_disposed());
    let err = call_with_timeout(&ctx, vec![], CALL_TIMEOUT)
        .await
        .expect_err("disposed context");
    assert_eq!(err, ExecutionError::Disposed);
    Ok(())
}

#[tokio::test]
async fn integration_js_only_shims_are_visible() -> Result<()> {
    let ctx = context(
        "() => [typeof fetch, typeof Headers, typeof TextEncoder, typeof TextDecoder, typeof require, typeof process, typeof std].join(',')",
    )
    .await?;
    let value = call_with_timeout(&ctx, vec![], CALL_TIMEOUT).await?;
    assert_eq!(
        value,
        Value::from("function,function,function,function,undefined,undefined,undefined")
    );
    Ok(())
}
