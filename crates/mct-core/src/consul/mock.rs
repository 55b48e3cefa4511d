//! Scripted in-memory KV client for tests
//!
//! Responses are served in order. Once the script is exhausted the client
//! behaves like an idle agent: it sleeps for the requested wait and returns
//! the last successful listing again with an unchanged index.

use super::{ConsulError, KvClient, KvListing};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<Result<KvListing, String>>,
    last: KvListing,
    calls: Vec<(String, u64)>,
}

/// Mock [`KvClient`]; clones share the same script and call log.
#[derive(Debug, Clone, Default)]
pub struct MockKvClient {
    state: Arc<Mutex<MockState>>,
}

impl MockKvClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful listing.
    pub fn push_listing(&self, listing: KvListing) -> &Self {
        self.state.lock().unwrap().script.push_back(Ok(listing));
        self
    }

    /// Queue a transport failure.
    pub fn push_failure(&self, message: impl Into<String>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .script
            .push_back(Err(message.into()));
        self
    }

    /// `(prefix, index)` of every request made so far.
    pub fn calls(&self) -> Vec<(String, u64)> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl KvClient for MockKvClient {
    async fn list(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> Result<KvListing, ConsulError> {
        let next = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((prefix.to_string(), index));
            state.script.pop_front()
        };

        match next {
            Some(Ok(listing)) => {
                self.state.lock().unwrap().last = listing.clone();
                Ok(listing)
            }
            Some(Err(message)) => Err(ConsulError::Io(std::io::Error::other(message))),
            None => {
                tokio::time::sleep(wait).await;
                Ok(self.state.lock().unwrap().last.clone())
            }
        }
    }
}
