use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt as _;
use noderun::{
    BoxError, Entry, ExecutionContext, ExecutionError, Host, HttpBodyStream, HttpRequest,
    HttpResponse, ReqwestHost, SandboxBuilder, Value, deref,
};

/// Builder used by most tests: short timeout, real HTTP host.
pub fn builder() -> SandboxBuilder {
    SandboxBuilder::new()
        .timeout(Duration::from_secs(5))
        .host(ReqwestHost::default())
}

pub async fn context(source: &str) -> Result<ExecutionContext> {
    builder()
        .build(Entry::expression(source))
        .await
        .context("failed to build execution context")
}

/// Call the entry point and dereference the result, bounded by a host-side
/// timeout so a hung sandbox fails the test instead of blocking it.
pub async fn call_with_timeout(
    context: &ExecutionContext,
    args: Vec<Value>,
    timeout: Duration,
) -> std::result::Result<Value, ExecutionError> {
    tokio::time::timeout(timeout, async {
        deref(context.call(args).await?).await
    })
    .await
    .unwrap_or_else(|_| {
        Err(ExecutionError::Internal(format!(
            "test call did not finish within {}ms",
            timeout.as_millis()
        )))
    })
}

/// Host that records whether any response body was ever polled, and
/// whether the sandbox side let go of it.
#[derive(Clone, Default)]
pub struct TrackingHost {
    inner: ReqwestHost,
    polled: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl TrackingHost {
    pub fn body_polled(&self) -> bool {
        self.polled.load(Ordering::SeqCst)
    }

    pub fn body_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Host for TrackingHost {
    async fn http_request(&self, req: HttpRequest) -> std::result::Result<HttpResponse, BoxError> {
        let response = self.inner.http_request(req).await?;
        let polled = self.polled.clone();
        let dropped = SetOnDrop(self.dropped.clone());
        Ok(response.map(|body| {
            Box::pin(body.inspect(move |_| {
                let _held = &dropped;
                polled.store(true, Ordering::SeqCst);
            })) as HttpBodyStream
        }))
    }
}
