//! Outbound network policy for bridged fetches.

mod dns;
mod private_ranges;

use std::sync::Arc;

use http::{Method, Uri};

pub use dns::{DnsResolver, TokioDnsResolver};
pub(crate) use private_ranges::is_private_ip;

#[derive(Debug, Clone)]
pub struct HttpMeta {
    pub method: Method,
    pub uri: Uri,
}

/// Decides whether a sandbox may reach a URL. A denial message is surfaced
/// to the script as a rejected `fetch`.
#[async_trait::async_trait]
pub trait NetworkPolicy: Send + Sync + 'static {
    async fn check_http(&self, meta: &HttpMeta) -> core::result::Result<(), String>;
}

#[async_trait::async_trait]
impl<T: NetworkPolicy + ?Sized> NetworkPolicy for Arc<T> {
    async fn check_http(&self, meta: &HttpMeta) -> core::result::Result<(), String> {
        (**self).check_http(meta).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait::async_trait]
impl NetworkPolicy for AllowAllPolicy {
    async fn check_http(&self, _meta: &HttpMeta) -> core::result::Result<(), String> {
        Ok(())
    }
}

/// Only `http`/`https` targets whose every resolved address is public.
#[derive(Debug, Clone, Default)]
pub struct PublicOnlyPolicy<R = TokioDnsResolver> {
    resolver: R,
}

impl<R: DnsResolver> PublicOnlyPolicy<R> {
    pub const fn with_resolver(resolver: R) -> Self {
        Self { resolver }
    }
}

#[async_trait::async_trait]
impl<R: DnsResolver> NetworkPolicy for PublicOnlyPolicy<R> {
    async fn check_http(&self, meta: &HttpMeta) -> core::result::Result<(), String> {
        let port = match meta.uri.scheme_str() {
            Some("http") => 80,
            Some("https") => 443,
            other => return Err(format!("scheme {other:?} is not allowed")),
        };
        let host = meta
            .uri
            .host()
            .ok_or_else(|| format!("missing host in {}", meta.uri))?;
        let port = meta.uri.port_u16().unwrap_or(port);
        let addrs = self
            .resolver
            .resolve(host, port)
            .await
            .map_err(|e| format!("failed to resolve {host}: {e}"))?;
        if addrs.is_empty() {
            return Err(format!("{host} did not resolve to any address"));
        }
        if let Some(ip) = addrs.into_iter().find(|ip| is_private_ip(*ip)) {
            tracing::debug!(%host, %ip, "blocked request to private address");
            return Err(format!("{host} resolves to non-public address {ip}"));
        }
        Ok(())
    }
}
