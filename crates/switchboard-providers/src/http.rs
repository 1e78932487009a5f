// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Keep-alive pooled HTTP client with per-attempt timeouts.

use anyhow::Context;
use std::collections::HashMap;
use std::time::Duration;

/// `spec.md` §5: `maxSockets = 6`, `keepAlive = true`, `timeout = 60 s`.
const MAX_SOCKETS_PER_HOST: usize = 6;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a single HTTP attempt, carrying just enough for
/// `CloudDispatcher` to classify the result without reparsing headers.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited_or_oversized(&self) -> bool {
        matches!(self.status, 401 | 413 | 429)
    }

    pub fn is_transient(&self) -> bool {
        self.status >= 500
    }

    /// `spec.md` §4.3 step 4: "body containing rate/quota/oversize
    /// markers" in addition to the status-code checks above.
    pub fn body_signals_rate_or_quota(&self) -> bool {
        let lower = self.body.to_lowercase();
        ["rate limit", "rate_limit", "quota", "too large", "oversize"]
            .iter()
            .any(|marker| lower.contains(marker))
    }
}

/// Thin wrapper over a shared `reqwest::Client` configured for keep-alive
/// pooling, with one timeout per attempt rather than per connection.
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_SOCKETS_PER_HOST)
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }

    /// POSTs a JSON body with the given headers and per-attempt timeout,
    /// buffering the full response body (non-streaming path; the streaming
    /// path is driven directly from `CloudDispatcher` against
    /// `self.client` so `StreamDecoder` can consume bytes incrementally).
    pub async fn post_json(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> anyhow::Result<HttpResponse> {
        let mut req = self.client.post(url).json(body).timeout(timeout);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.context("sending request")?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect();
        let body = resp.text().await.context("reading response body")?;
        Ok(HttpResponse { status, headers, body })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_without_error() {
        assert!(HttpClient::new().is_ok());
    }

    #[test]
    fn is_success_checks_2xx_range() {
        let resp = HttpResponse { status: 200, headers: HashMap::new(), body: String::new() };
        assert!(resp.is_success());
        let resp = HttpResponse { status: 404, headers: HashMap::new(), body: String::new() };
        assert!(!resp.is_success());
    }

    #[test]
    fn is_rate_limited_or_oversized_matches_spec_codes() {
        for code in [401, 413, 429] {
            let resp = HttpResponse { status: code, headers: HashMap::new(), body: String::new() };
            assert!(resp.is_rate_limited_or_oversized());
        }
        let resp = HttpResponse { status: 500, headers: HashMap::new(), body: String::new() };
        assert!(!resp.is_rate_limited_or_oversized());
    }

    #[test]
    fn is_transient_matches_5xx() {
        let resp = HttpResponse { status: 503, headers: HashMap::new(), body: String::new() };
        assert!(resp.is_transient());
    }

    #[test]
    fn body_signals_rate_or_quota_detects_markers() {
        let resp = HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: "error: quota_exceeded for this account".into(),
        };
        assert!(resp.body_signals_rate_or_quota());
    }

    #[test]
    fn body_signals_rate_or_quota_false_on_clean_body() {
        let resp = HttpResponse { status: 200, headers: HashMap::new(), body: "all good".into() };
        assert!(!resp.body_signals_rate_or_quota());
    }
}
