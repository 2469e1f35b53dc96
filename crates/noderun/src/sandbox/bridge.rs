//! Host side of the fetch shim.
//!
//! Requests arrive from the worker thread, run on the tokio runtime that
//! built the context, and answer back through the worker's command queue.
//! Response bodies stay here, unread, until the script asks for them.

use std::{collections::HashMap, sync::Arc, sync::mpsc::Sender};

use bytes::BytesMut;
use futures::StreamExt as _;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, response::Parts};
use parking_lot::Mutex;
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinSet};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{wire::Wire, worker::Command};
use crate::{
    host::{Host, HttpBodyStream, HttpRequest},
    net::{HttpMeta, NetworkPolicy},
};

#[derive(Debug)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<bytes::Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    Text,
    Bytes,
}

#[derive(Debug)]
pub enum HostRequest {
    Fetch {
        handle: u32,
        request: FetchRequest,
    },
    ReadBody {
        handle: u32,
        body: u32,
        mode: BodyMode,
    },
    /// The script can no longer reach this body; nothing is sent back.
    DropBody {
        body: u32,
    },
}

#[derive(Clone)]
pub struct Bridge {
    host: Option<Arc<dyn Host>>,
    policy: Arc<dyn NetworkPolicy>,
    max_body_bytes: usize,
    bodies: Arc<Mutex<HashMap<u32, HttpBodyStream>>>,
    commands: Sender<Command>,
}

impl Bridge {
    pub fn new(
        host: Option<Arc<dyn Host>>,
        policy: Arc<dyn NetworkPolicy>,
        max_body_bytes: usize,
        commands: Sender<Command>,
    ) -> Self {
        Self {
            host,
            policy,
            max_body_bytes,
            bodies: Arc::default(),
            commands,
        }
    }

    /// Serve requests until the context is torn down. In-flight requests
    /// are aborted and unread bodies dropped on exit.
    pub async fn serve(self, mut requests: UnboundedReceiver<HostRequest>, token: CancellationToken) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => {
                        let bridge = self.clone();
                        tasks.spawn(async move { bridge.handle(request).await });
                    }
                    None => break,
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
        tasks.abort_all();
        self.bodies.lock().clear();
    }

    async fn handle(&self, request: HostRequest) {
        let (handle, result) = match request {
            HostRequest::Fetch { handle, request } => (handle, self.fetch(handle, request).await),
            HostRequest::ReadBody { handle, body, mode } => {
                (handle, self.read_body(body, mode).await)
            }
            HostRequest::DropBody { body } => {
                if self.bodies.lock().remove(&body).is_some() {
                    tracing::trace!(body, "dropped unread response body");
                }
                return;
            }
        };
        if let Err(message) = &result {
            tracing::debug!(%message, "bridged request failed");
        }
        let _ = self.commands.send(Command::HostReply { handle, result });
    }

    async fn fetch(&self, handle: u32, request: FetchRequest) -> Result<Wire, String> {
        let Some(host) = &self.host else {
            return Err("fetch is not available in this context".to_owned());
        };

        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid method {:?}", request.method))?;
        let url = Url::parse(&request.url).map_err(|e| format!("invalid URL {:?}: {e}", request.url))?;
        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e| format!("invalid URL {:?}: {e}", request.url))?;

        self.policy
            .check_http(&HttpMeta {
                method: method.clone(),
                uri: uri.clone(),
            })
            .await
            .map_err(|e| format!("network access denied: {e}"))?;

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name {name:?}"))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| format!("invalid value for header {name}"))?;
            headers.append(name, value);
        }

        tracing::debug!(%method, %url, "bridged fetch");
        let response = host
            .http_request(HttpRequest {
                method,
                uri,
                headers,
                body: request.body,
            })
            .await
            .map_err(|e| format!("fetch failed: {e}"))?;

        let (parts, body) = response.into_parts();
        self.bodies.lock().insert(handle, body);
        Ok(descriptor(handle, &url, &parts))
    }

    async fn read_body(&self, body: u32, mode: BodyMode) -> Result<Wire, String> {
        let mut stream = self
            .bodies
            .lock()
            .remove(&body)
            .ok_or_else(|| "body has already been consumed".to_owned())?;

        let mut buf = BytesMut::new();
        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|e| format!("failed to read body: {e}"))?;
            if let Ok(data) = frame.into_data() {
                if buf.len() + data.len() > self.max_body_bytes {
                    return Err(format!(
                        "response body exceeds {} bytes",
                        self.max_body_bytes
                    ));
                }
                buf.extend_from_slice(&data);
            }
        }

        Ok(match mode {
            BodyMode::Text => Wire::String(String::from_utf8_lossy(&buf).into_owned()),
            BodyMode::Bytes => Wire::Bytes(buf.freeze()),
        })
    }
}

/// The eagerly copied part of a response; the body crosses as a handle.
fn descriptor(body: u32, url: &Url, parts: &Parts) -> Wire {
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            Wire::Array(vec![
                Wire::String(name.as_str().to_owned()),
                Wire::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            ])
        })
        .collect();

    Wire::Object(vec![
        ("status".to_owned(), Wire::Number(f64::from(parts.status.as_u16()))),
        (
            "statusText".to_owned(),
            Wire::String(parts.status.canonical_reason().unwrap_or_default().to_owned()),
        ),
        ("ok".to_owned(), Wire::Bool(parts.status.is_success())),
        ("url".to_owned(), Wire::String(url.to_string())),
        ("headers".to_owned(), Wire::Array(headers)),
        ("body".to_owned(), Wire::Number(f64::from(body))),
    ])
}
