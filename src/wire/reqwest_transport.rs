//! `HttpTransport` over a shared `reqwest` client

use crate::error::{Error, Result};
use crate::wire::{HttpRequest, HttpResponse};
use crate::HttpTransport;
use async_trait::async_trait;

/// `HttpTransport` backed by a shared `reqwest::Client`
///
/// Timeouts, proxies and TLS settings are whatever the supplied client was
/// built with; this layer adds none.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a default client
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport around an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request to {} failed: {}", request.url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("reading response from {} failed: {}", request.url, e)))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
