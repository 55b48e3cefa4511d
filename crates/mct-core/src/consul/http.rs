//! KV client over HTTP(S)

use super::{
    ConsulError, INDEX_HEADER, KvClient, KvListing, TOKEN_HEADER, decode_listing, listing_path,
    request_budget,
};
use crate::config::Endpoint;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// [`KvClient`] talking to a Consul agent over TCP.
#[derive(Debug, Clone)]
pub struct HttpKvClient {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpKvClient {
    /// Create a client for an HTTP endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ConsulError::Unsupported` for socket endpoints and
    /// `ConsulError::Request` if the underlying client cannot be built.
    pub fn new(endpoint: &Endpoint, token: Option<String>) -> Result<Self, ConsulError> {
        let base = endpoint
            .base_url()
            .ok_or_else(|| ConsulError::Unsupported(format!("{endpoint} is not an HTTP address")))?
            .to_string();
        let client = reqwest::Client::builder()
            .user_agent(concat!("multi-consul-template/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }
}

#[async_trait]
impl KvClient for HttpKvClient {
    async fn list(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> Result<KvListing, ConsulError> {
        let url = format!("{}{}", self.base, listing_path(prefix, index, wait));
        debug!(%url, "Listing KV prefix");

        let mut request = self.client.get(&url).timeout(request_budget(wait));
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        // HeaderMap lookups are case-insensitive
        let index_header = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        decode_listing(status, index_header.as_deref(), &body)
    }
}
