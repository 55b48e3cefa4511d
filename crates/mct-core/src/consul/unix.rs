//! KV client over a unix domain socket
//!
//! reqwest cannot dial unix sockets, so each listing opens a fresh
//! `UnixStream` and runs a single HTTP/1.1 exchange on it with hyper's
//! connection-level client. hyper handles the response framing
//! (`Content-Length`, chunked transfer encoding).

use super::{
    ConsulError, INDEX_HEADER, KvClient, KvListing, TOKEN_HEADER, decode_listing, listing_path,
    request_budget,
};
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{ACCEPT, HOST};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// [`KvClient`] talking to a Consul agent over a local socket.
#[derive(Debug, Clone)]
pub struct UnixKvClient {
    socket_path: PathBuf,
    token: Option<String>,
}

/// Status, cursor header and body of one exchange
struct SocketResponse {
    status: u16,
    index: Option<String>,
    body: Bytes,
}

impl UnixKvClient {
    pub fn new(socket_path: PathBuf, token: Option<String>) -> Self {
        Self { socket_path, token }
    }

    async fn round_trip(&self, path: &str) -> Result<SocketResponse, ConsulError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

        let socket = self.socket_path.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(socket = %socket.display(), "Consul socket connection ended: {}", e);
            }
        });

        let mut builder = Request::get(path)
            .header(HOST, "consul")
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token.as_str());
        }
        let request = builder.body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        let status = response.status().as_u16();
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.into_body().collect().await?.to_bytes();

        Ok(SocketResponse {
            status,
            index,
            body,
        })
    }
}

#[async_trait]
impl KvClient for UnixKvClient {
    async fn list(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> Result<KvListing, ConsulError> {
        let path = listing_path(prefix, index, wait);
        debug!(socket = %self.socket_path.display(), %path, "Listing KV prefix");

        let budget = request_budget(wait);
        let response = tokio::time::timeout(budget, self.round_trip(&path))
            .await
            .map_err(|_| ConsulError::Timeout(budget))??;

        decode_listing(response.status, response.index.as_deref(), &response.body)
    }
}
