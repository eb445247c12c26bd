//! Exit-hop HTTP — performing the literal network request
//!
//! The innermost onion layer carries an `AnonymousRequest`; whichever hop
//! finds it performs the fetch and ships the outcome back as a `Response`
//! frame. The same trait backs the engine's direct-fetch fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

/// Maximum response body size read at the exit hop.
pub const MAX_BODY_BYTES: u64 = 2 * 1024 * 1024;

/// Options accompanying an anonymized request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOptions {
    /// HTTP method, e.g. "GET" or "POST".
    pub method: String,
    /// Header name/value pairs applied in order.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
    /// When set, the engine hard-fails instead of falling back to an
    /// unanonymized direct fetch.
    pub strict_anonymity: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            strict_anonymity: false,
        }
    }
}

/// The plaintext found inside the innermost onion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymousRequest {
    pub url: String,
    pub options: RequestOptions,
}

/// Outcome of the exit hop's fetch, delivered to the originator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Body decoded as UTF-8, lossy.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Failed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Performs HTTP requests. Implemented over ureq for real traffic and by
/// test doubles in the suites.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &RequestOptions)
        -> Result<FetchResponse, FetchError>;
}

/// Blocking ureq agent driven through `spawn_blocking`.
pub struct UreqFetcher {
    agent: ureq::Agent,
}

impl UreqFetcher {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(20))
            .build();
        Self { agent }
    }
}

impl Default for UreqFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for UreqFetcher {
    async fn fetch(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        let agent = self.agent.clone();
        let url = url.to_string();
        let options = options.clone();
        tokio::task::spawn_blocking(move || blocking_fetch(&agent, &url, &options))
            .await
            .map_err(|e| FetchError::Failed(e.to_string()))?
    }
}

fn blocking_fetch(
    agent: &ureq::Agent,
    url: &str,
    options: &RequestOptions,
) -> Result<FetchResponse, FetchError> {
    if url.is_empty() {
        return Err(FetchError::InvalidRequest("empty url".to_string()));
    }

    let mut request = agent.request(&options.method, url);
    for (name, value) in &options.headers {
        request = request.set(name, value);
    }

    let result = match &options.body {
        Some(body) => request.send_bytes(body),
        None => request.call(),
    };

    let response = match result {
        Ok(response) => response,
        // Non-2xx statuses still carry a response the originator should see.
        Err(ureq::Error::Status(_, response)) => response,
        Err(e) => return Err(FetchError::Failed(e.to_string())),
    };

    let status = response.status();
    let headers = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            response
                .header(&name)
                .map(|value| (name.clone(), value.to_string()))
        })
        .collect();

    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut body)
        .map_err(|e| FetchError::Failed(e.to_string()))?;

    Ok(FetchResponse {
        status,
        headers,
        body,
    })
}
