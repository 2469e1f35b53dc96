//! Host-side seam used by the sandbox's fetch bridge.

#[cfg(feature = "request")]
mod client;

use std::{pin::Pin, sync::Arc};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use http_body::Frame;

#[cfg(feature = "request")]
pub use client::ReqwestHost;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type BoxedStream<T> = Pin<Box<dyn futures::Stream<Item = T> + Send + Sync>>;

pub type HttpBodyStream = BoxedStream<core::result::Result<Frame<Bytes>, BoxError>>;
pub type HttpResponse = http::Response<HttpBodyStream>;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[async_trait::async_trait]
pub trait Host: Send + Sync + 'static {
    /// Perform an HTTP request on behalf of sandboxed code.
    ///
    /// The response body must be returned unread; the bridge pulls from it
    /// only when the script consumes the body. Implementations remove any
    /// caller-supplied `Host` header before dispatching.
    async fn http_request(&self, req: HttpRequest) -> core::result::Result<HttpResponse, BoxError>;
}

#[async_trait::async_trait]
impl<T: Host + ?Sized> Host for Arc<T> {
    async fn http_request(&self, req: HttpRequest) -> core::result::Result<HttpResponse, BoxError> {
        (**self).http_request(req).await
    }
}
