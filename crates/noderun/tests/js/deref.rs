use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use noderun::{
    ByteStream, ExecutionError, Path, Remote, ResolverChain, Schema, Value, deref, resolve,
};

use super::common::{call_with_timeout, context};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn integration_js_deref_nested_functions() -> Result<()> {
    let ctx = context(
        "() => ({ add: (a, b) => a + b, nested: { mul: (a) => ({ result: a * 10, again: (b) => b + 1 }) } })",
    )
    .await?;
    let value = call_with_timeout(&ctx, vec![], CALL_TIMEOUT).await?;

    let add = value
        .get("add")
        .and_then(Value::as_callable)
        .context("expected add to be callable")?;
    assert_eq!(
        add.call(vec![2.into(), 3.into()]).await?,
        Value::from(5)
    );

    let mul = value
        .get("nested")
        .and_then(|n| n.get("mul"))
        .and_then(Value::as_callable)
        .context("expected nested.mul to be callable")?;
    let product = mul.call(vec![4.into()]).await?;
    assert_eq!(product.get("result"), Some(&Value::from(40)));

    // Results of dereferenced calls are dereferenced too.
    let again = product
        .get("again")
        .and_then(Value::as_callable)
        .context("expected again to be callable")?;
    assert_eq!(again.call(vec![1.into()]).await?, Value::from(2));
    Ok(())
}

#[tokio::test]
async fn integration_js_deref_entry_callable() -> Result<()> {
    let ctx = context("(s) => s.toUpperCase()").await?;
    let entry = ctx.entry();
    assert_eq!(entry.call(vec!["abc".into()]).await?, Value::from("ABC"));
    Ok(())
}

#[tokio::test]
async fn integration_js_deref_cycles_become_null() -> Result<()> {
    let ctx = context(
        "() => { const a = { name: 'a' }; a.self = a; a.list = [a, 1]; const shared = { x: 1 }; a.left = shared; a.right = shared; return a; }",
    )
    .await?;
    let value = call_with_timeout(&ctx, vec![], CALL_TIMEOUT).await?;
    assert_eq!(
        value.to_json(),
        serde_json::json!({
            "name": "a",
            "self": null,
            "list": [null, 1],
            "left": {"x": 1},
            "right": {"x": 1},
        })
    );
    Ok(())
}

#[tokio::test]
async fn integration_js_deref_is_idempotent() -> Result<()> {
    let ctx = context("() => ({ n: 1, f() { return 2; }, bytes: new Uint8Array([1, 2, 3]) })").await?;
    let remote = ctx.call(vec![]).await?;
    let once = deref(remote).await?;
    let twice = deref(once.clone()).await?;
    assert_eq!(once, twice);
    assert_eq!(
        once.get("bytes"),
        Some(&Value::Bytes(Bytes::from_static(&[1, 2, 3])))
    );
    Ok(())
}

#[tokio::test]
async fn integration_js_deref_property_reads() -> Result<()> {
    let ctx = context("() => ({ a: { b: 2, list: ['x', 'y'] }, get computed() { return 'lazy'; } })").await?;
    let Remote::Aggregate(root) = ctx.call(vec![]).await? else {
        panic!("expected an aggregate result");
    };

    assert!(matches!(
        root.get("computed").await?,
        Remote::Copied(Value::String(s)) if s == "lazy"
    ));

    let Remote::Aggregate(a) = root.get("a").await? else {
        panic!("expected nested aggregate");
    };
    assert!(matches!(a.get("b").await?, Remote::Copied(Value::Number(n)) if (n - 2.0).abs() < f64::EPSILON));
    assert!(matches!(root.get("missing").await?, Remote::Copied(Value::Null)));

    let Remote::Aggregate(list) = a.get("list").await? else {
        panic!("expected array");
    };
    assert_eq!(list.kind(), noderun::RefKind::Array);
    assert!(matches!(list.get("1").await?, Remote::Copied(Value::String(s)) if s == "y"));
    Ok(())
}

#[tokio::test]
async fn integration_js_deref_callables_cross_back() -> Result<()> {
    let ctx = context("() => ({ twice: (f) => f(2) * 2, inc: (x) => x + 1 })").await?;
    let value = call_with_timeout(&ctx, vec![], CALL_TIMEOUT).await?;
    let twice = value
        .get("twice")
        .and_then(Value::as_callable)
        .context("twice")?;
    let inc = value.get("inc").cloned().context("inc")?;
    assert_eq!(twice.call(vec![inc]).await?, Value::from(6));
    Ok(())
}

#[tokio::test]
async fn integration_js_deref_rejects_foreign_values() -> Result<()> {
    let ctx = context("(x) => x").await?;
    let other = context("() => () => 1").await?;
    let foreign = call_with_timeout(&other, vec![], CALL_TIMEOUT).await?;

    let err = ctx.call(vec![foreign]).await.expect_err("foreign callable");
    assert!(matches!(err, ExecutionError::Transfer(_)), "{err:?}");

    let stream = ByteStream::new(Box::pin(futures::stream::empty::<
        std::result::Result<Bytes, noderun::BoxError>,
    >()));
    let err = ctx
        .call(vec![Value::Stream(stream)])
        .await
        .expect_err("stream argument");
    assert!(matches!(err, ExecutionError::Transfer(_)), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn integration_js_deref_fails_after_dispose() -> Result<()> {
    let ctx = context("() => ({ f: () => 1 })").await?;
    let value = call_with_timeout(&ctx, vec![], CALL_TIMEOUT).await?;
    let f = value
        .get("f")
        .and_then(Value::as_callable)
        .context("expected callable")?;
    assert_eq!(f.call(vec![]).await?, Value::from(1));

    ctx.dispose();
    assert!(f.reference().is_disposed());
    assert_eq!(
        f.call(vec![]).await.expect_err("disposed"),
        ExecutionError::Disposed
    );
    Ok(())
}

#[tokio::test]
async fn integration_js_deref_callables_are_distinct_items() -> Result<()> {
    let ctx = context("() => [() => 1, () => 2, null]").await?;
    let value = call_with_timeout(&ctx, vec![], CALL_TIMEOUT).await?;
    let schema = Schema::from_json(&serde_json::json!({"type": "array", "uniqueItems": true}))?;

    let resolved = resolve(&Path::root(), Some(value), &schema, &ResolverChain::new()).await?;
    let Some(Value::Array(items)) = resolved else {
        panic!("expected array, got {resolved:?}");
    };
    assert_eq!(items.len(), 3);

    let repeated = Value::Array(vec![items[0].clone(), items[0].clone()]);
    assert!(resolve(&Path::root(), Some(repeated), &schema, &ResolverChain::new())
        .await
        .is_err());
    Ok(())
}
