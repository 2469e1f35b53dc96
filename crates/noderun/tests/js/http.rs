use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use noderun::{
    Entry, ExecutionError, PublicOnlyPolicy, SandboxBuilder, Value, net::TokioDnsResolver,
};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path},
};

use super::common::{TrackingHost, builder, call_with_timeout, context};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn integration_js_fetch_json() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
        .mount(&server)
        .await;

    let ctx = context("(url) => fetch(url + '/data').then((r) => r.json())").await?;
    let value = call_with_timeout(&ctx, vec![server.uri().into()], CALL_TIMEOUT)
        .await
        .context("fetch failed")?;
    assert_eq!(value.to_json(), json!({"a": 1}));
    Ok(())
}

#[tokio::test]
async fn integration_js_fetch_post_with_headers() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(header("x-request-id", "abc"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"name": "noderun"})))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-reply", "yes")
                .set_body_string("created"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let ctx = context(
        r"async (url) => {
            const r = await fetch(url + '/submit', {
                method: 'post',
                headers: { 'X-Request-Id': 'abc' },
                body: { name: 'noderun' },
            });
            return { status: r.status, ok: r.ok, reply: r.headers.get('X-Reply'), text: await r.text() };
        }",
    )
    .await?;
    let value = call_with_timeout(&ctx, vec![server.uri().into()], CALL_TIMEOUT).await?;
    assert_eq!(
        value.to_json(),
        json!({"status": 201, "ok": true, "reply": "yes", "text": "created"})
    );
    Ok(())
}

#[tokio::test]
async fn integration_js_fetch_body_used_once() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let ctx = context(
        r"async (url) => {
            const r = await fetch(url);
            const first = await r.text();
            try {
                await r.text();
                return 'read twice';
            } catch (e) {
                return [first, r.bodyUsed, e.message];
            }
        }",
    )
    .await?;
    let value = call_with_timeout(&ctx, vec![server.uri().into()], CALL_TIMEOUT).await?;
    let Value::Array(items) = value else {
        panic!("expected array, got {value:?}");
    };
    assert_eq!(items[0], Value::from("hello"));
    assert_eq!(items[1], Value::from(true));
    let message = items[2].as_str().context("error message")?;
    assert!(message.contains("Body has already been"), "{message}");
    Ok(())
}

#[tokio::test]
async fn integration_js_fetch_body_is_lazy() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let host = TrackingHost::default();
    let ctx = SandboxBuilder::new()
        .timeout(Duration::from_secs(5))
        .host(host.clone())
        .build(Entry::expression(
            "async (url) => { const r = await fetch(url); return [r.status, r.ok, r.statusText]; }",
        ))
        .await?;
    let value = call_with_timeout(&ctx, vec![server.uri().into()], CALL_TIMEOUT).await?;
    assert_eq!(value.to_json(), json!([404, false, "Not Found"]));
    assert!(!host.body_polled());
    Ok(())
}

#[tokio::test]
async fn integration_js_fetch_unread_body_is_dropped() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("never read"))
        .mount(&server)
        .await;

    let host = TrackingHost::default();
    let ctx = SandboxBuilder::new()
        .timeout(Duration::from_secs(5))
        .host(host.clone())
        .build(Entry::expression("async (url) => (await fetch(url)).status"))
        .await?;
    let value = call_with_timeout(&ctx, vec![server.uri().into()], CALL_TIMEOUT).await?;
    assert_eq!(value, Value::from(200));

    let released = tokio::time::timeout(Duration::from_secs(5), async {
        while !host.body_dropped() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "unread body outlived the call");
    assert!(!host.body_polled());
    assert!(!ctx.is_disposed());
    Ok(())
}

#[tokio::test]
async fn integration_js_fetch_array_buffer() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0_u8, 1, 254, 255]))
        .mount(&server)
        .await;

    let ctx = context("async (url) => new Uint8Array(await (await fetch(url)).arrayBuffer())").await?;
    let value = call_with_timeout(&ctx, vec![server.uri().into()], CALL_TIMEOUT).await?;
    assert_eq!(value, Value::Bytes(Bytes::from_static(&[0, 1, 254, 255])));
    Ok(())
}

#[tokio::test]
async fn integration_js_fetch_denied_by_policy() -> Result<()> {
    let server = MockServer::start().await;
    let ctx = builder()
        .policy(PublicOnlyPolicy::<TokioDnsResolver>::default())
        .build(Entry::expression("(url) => fetch(url)"))
        .await?;
    let err = call_with_timeout(&ctx, vec![server.uri().into()], CALL_TIMEOUT)
        .await
        .expect_err("loopback should be denied");
    assert!(
        matches!(
            &err,
            ExecutionError::Thrown { name, message, .. }
                if name == "TypeError" && message.starts_with("network access denied")
        ),
        "{err:?}"
    );
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    Ok(())
}

#[tokio::test]
async fn integration_js_fetch_without_host() -> Result<()> {
    let ctx = SandboxBuilder::new()
        .build(Entry::expression("() => fetch('http://example.com')"))
        .await?;
    let err = call_with_timeout(&ctx, vec![], CALL_TIMEOUT)
        .await
        .expect_err("no host configured");
    assert!(
        matches!(&err, ExecutionError::Thrown { message, .. } if message.contains("fetch is not available")),
        "{err:?}"
    );
    Ok(())
}

#[tokio::test]
async fn integration_js_console_is_routed() -> Result<()> {
    let ctx = context(
        "(x) => { console.log('value', x, { nested: [1, 2] }); console.error(new Error('shown')); return x; }",
    )
    .await?;
    let value = call_with_timeout(&ctx, vec![7.into()], CALL_TIMEOUT).await?;
    assert_eq!(value, Value::from(7));
    Ok(())
}
