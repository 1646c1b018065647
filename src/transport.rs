use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;

use crate::error::{GatewayError, Result};
use crate::response::GatewayResponse;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything needed to issue one upstream call.
#[derive(Clone, Debug)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// File uploads stream the request while the response is in flight.
    pub half_duplex: bool,
}

impl FetchOptions {
    pub fn new(method: Method, headers: HeaderMap, body: Option<Bytes>) -> Self {
        Self {
            method,
            headers,
            body,
            half_duplex: false,
        }
    }
}

/// One HTTP exchange with an upstream provider. Custom provider request
/// handlers and test stubs implement this too.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
        timeout: Option<Duration>,
    ) -> Result<GatewayResponse>;
}

/// Default transport over a shared `reqwest` client.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_UPSTREAM_TIMEOUT)
            .build()
            .map_err(GatewayError::Http)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
        timeout: Option<Duration>,
    ) -> Result<GatewayResponse> {
        let mut request = self
            .client
            .request(options.method.clone(), url)
            .headers(options.headers.clone());
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(GatewayResponse::new(status, headers, body))
    }
}
