//! Transport seam between the proxy and real services.
//!
//! Implementations only move bytes. Admission, breaker accounting, timeout
//! enforcement, and status policy all stay in the proxy, so a fake
//! transport exercises the same decision paths the reqwest one does.

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};

use crate::error::DownstreamError;

/// Where a request is being forwarded: the logical service name the breaker
/// and error bodies use, plus the base URL the transport dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamTarget {
    pub service: String,
    pub base_url: String,
}

impl DownstreamTarget {
    pub fn new(service: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self { service: service.into(), base_url: base_url.into() }
    }
}

/// Request as it leaves the gateway, headers already rewritten.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Raw downstream answer. Status interpretation happens in the proxy.
#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Client used to reach downstream services.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn call(
        &self,
        target: &DownstreamTarget,
        request: ForwardRequest,
    ) -> Result<DownstreamResponse, DownstreamError>;
}

/// reqwest-backed transport. Cloning shares the connection pool.
#[derive(Debug, Clone, Default)]
pub struct HttpDownstream {
    client: reqwest::Client,
}

impl HttpDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-tuned client (pool limits, TLS settings, proxies).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn call(
        &self,
        target: &DownstreamTarget,
        request: ForwardRequest,
    ) -> Result<DownstreamResponse, DownstreamError> {
        let url = join_url(&target.base_url, &request.path);
        let mut outbound =
            self.client.request(request.method, &url).headers(request.headers);
        if !request.body.is_empty() {
            outbound = outbound.body(request.body);
        }

        let response = outbound.send().await.map_err(|e| DownstreamError::Connect {
            service: target.service.clone(),
            detail: e.to_string(),
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| DownstreamError::Connect {
                service: target.service.clone(),
                detail: e.to_string(),
            })?
            .to_vec();
        Ok(DownstreamResponse { status, headers, body })
    }
}
