use std::sync::Arc;

use futures::TryStreamExt as _;
use http::header::HOST;

use super::{BoxError, Host, HttpBodyStream, HttpRequest, HttpResponse};

/// [`Host`] backed by a shared `reqwest` client.
#[derive(Clone, Debug, Default)]
pub struct ReqwestHost {
    client: Arc<reqwest::Client>,
}

impl ReqwestHost {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Build a client honouring an optional proxy and user agent.
    ///
    /// # Errors
    /// Returns an error if the proxy URL is invalid or the TLS backend
    /// cannot be initialised.
    pub fn with_options(proxy: Option<&str>, user_agent: Option<&str>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self::new(builder.build()?))
    }
}

#[async_trait::async_trait]
impl Host for ReqwestHost {
    async fn http_request(&self, req: HttpRequest) -> core::result::Result<HttpResponse, BoxError> {
        let mut headers = req.headers;
        headers.remove(HOST);

        let response = self
            .client
            .request(req.method, req.uri.to_string())
            .headers(headers)
            .body(req.body.unwrap_or_default())
            .send()
            .await
            .map_err(|e| -> BoxError { Box::new(e) })?;

        let mut builder = http::Response::builder()
            .status(response.status())
            .version(response.version());
        if let Some(headers) = builder.headers_mut() {
            *headers = response.headers().clone();
        }

        let body = response
            .bytes_stream()
            .map_ok(http_body::Frame::data)
            .map_err(|e| -> BoxError { Box::new(e) });

        builder
            .body(Box::pin(body) as HttpBodyStream)
            .map_err(|e| Box::new(std::io::Error::other(e)) as BoxError)
    }
}
