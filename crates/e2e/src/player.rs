//! Request player - sends the original request to the proxy under test

use std::time::{Duration, Instant};

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::{E2eError, E2eResult};
use crate::spec::TestCase;

const JSON_CONTENT_TYPE: &str = "application/json";
const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// What the proxy answered to the original request
#[derive(Debug, Clone, Serialize)]
pub struct OriginalResponse {
    pub status: u16,
    /// `name: value` lines
    pub headers: Vec<String>,
    pub body: String,
    pub elapsed_ms: u64,
}

/// Plays test cases against one proxy endpoint
pub struct RequestPlayer {
    client: Client,
    host: String,
    port: u16,
}

impl RequestPlayer {
    pub fn new(config: &ProxyConfig) -> E2eResult<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            host: config.host.clone(),
            port: config.port,
        })
    }

    pub fn url_for(&self, case: &TestCase) -> String {
        format!("http://{}:{}{}", self.host, self.port, case.request_path)
    }

    /// Send the original request: GET without a body, POST with one
    pub async fn play(&self, case: &TestCase) -> E2eResult<OriginalResponse> {
        let url = self.url_for(case);
        debug!("Url: {}", url);

        let request = if case.request_body.is_empty() {
            self.client.get(&url)
        } else {
            self.client
                .post(&url)
                .header(CONTENT_TYPE, content_type_for(&case.request_body))
                .header(CONTENT_LENGTH, case.request_body.len())
                .body(case.request_body.clone())
        };

        let transport = |source| E2eError::Transport {
            url: url.clone(),
            source,
        };

        let start = Instant::now();
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()).trim())
            })
            .collect();
        let body = response.text().await.map_err(transport)?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        debug!("{} answered {} in {} ms", url, status, elapsed_ms);

        Ok(OriginalResponse {
            status,
            headers,
            body,
            elapsed_ms,
        })
    }
}

fn content_type_for(body: &str) -> &'static str {
    match body.trim_start().chars().next() {
        Some('{') | Some('[') => JSON_CONTENT_TYPE,
        _ => XML_CONTENT_TYPE,
    }
}
