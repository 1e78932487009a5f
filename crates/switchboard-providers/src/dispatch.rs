// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Composes `KeyPool` + `RpmPacer` + `HttpClient` into the retry/failover
//! algorithm that drives every cloud request.

use crate::catalog::{Dialect, ProviderRecord, ProviderRegistry, PREFERRED_FALLBACK_CHAIN};
use crate::http::HttpClient;
use crate::keypool::KeyPool;
use crate::proxy;
use crate::rpm::RpmPacer;
use crate::types::{ChatHistory, ChatTurn, Chunk, Segment, Usage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// One generation request against a named provider/model.
pub struct GenerateRequest {
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub messages: ChatHistory,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("provider quota exceeded")]
    QuotaExceeded,
    #[error("provider {0} is cooling down")]
    ProviderCoolingDown(String),
    #[error("pool exhausted for provider {0}: {1}")]
    Exhausted(String, String),
    #[error("unknown provider {0}")]
    UnknownProvider(String),
}

/// Composes the provider registry, key pool, and RPM pacer into the
/// generate/retry/failover algorithm of `spec.md` §4.3.
pub struct CloudDispatcher {
    registry: Arc<ProviderRegistry>,
    key_pool: Arc<KeyPool>,
    rpm: Arc<RpmPacer>,
    http: Arc<HttpClient>,
    provider_cooldowns: Mutex<HashMap<String, Instant>>,
    bundled_session_token: Mutex<Option<String>>,
    /// Last request timestamp per apifreellm provider, enforcing the
    /// dialect's mandated minimum inter-request gap (`spec.md` §4.4).
    last_request_at: Mutex<HashMap<String, Instant>>,
}

impl CloudDispatcher {
    pub fn new(registry: Arc<ProviderRegistry>, http: Arc<HttpClient>) -> Self {
        Self {
            registry,
            key_pool: Arc::new(KeyPool::new()),
            rpm: Arc::new(RpmPacer::new()),
            http,
            provider_cooldowns: Mutex::new(HashMap::new()),
            bundled_session_token: Mutex::new(None),
            last_request_at: Mutex::new(HashMap::new()),
        }
    }

    /// Sleeps off whatever remains of the dialect's minimum inter-request
    /// gap since this provider's last request, then stamps the new request
    /// time. A no-op for dialects with no gap (`min_request_gap_secs == 0`).
    async fn enforce_request_gap(&self, provider: &str, min_gap_secs: u64) {
        if min_gap_secs == 0 {
            return;
        }
        let min_gap = Duration::from_secs(min_gap_secs);
        let wait = {
            let mut last = self.last_request_at.lock().unwrap();
            let now = Instant::now();
            let wait = last.get(provider).map(|prev| min_gap.saturating_sub(now.duration_since(*prev))).unwrap_or(Duration::ZERO);
            last.insert(provider.to_string(), now + wait);
            wait
        };
        if !wait.is_zero() {
            debug!(provider, wait_ms = wait.as_millis() as u64, "enforcing inter-request gap");
            tokio::time::sleep(wait).await;
        }
    }

    pub fn key_pool(&self) -> &Arc<KeyPool> {
        &self.key_pool
    }

    pub fn set_bundled_session_token(&self, token: Option<String>) {
        *self.bundled_session_token.lock().unwrap() = token;
    }

    fn provider_cooling_down(&self, provider: &str) -> bool {
        self.provider_cooldowns
            .lock()
            .unwrap()
            .get(provider)
            .is_some_and(|until| *until > Instant::now())
    }

    fn cool_down_provider(&self, provider: &str, duration: Duration) {
        let mut map = self.provider_cooldowns.lock().unwrap();
        let target = Instant::now() + duration;
        let entry = map.entry(provider.to_string()).or_insert(target);
        if target > *entry {
            *entry = target;
        }
    }

    /// Runs the dispatch algorithm, returning a stream of chunks from
    /// whichever attempt (bundled proxy or a pool key) first succeeds.
    pub async fn generate(
        self: &Arc<Self>,
        req: GenerateRequest,
    ) -> Result<ReceiverStream<anyhow::Result<Chunk>>, DispatchError> {
        let record = self
            .registry
            .provider(&req.provider)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownProvider(req.provider.clone()))?;

        // Step 1: bundled proxy routing.
        let has_images = req.messages.turns().iter().any(|t| {
            matches!(t, ChatTurn::User { images, .. } if !images.is_empty())
        });
        if record.bundled && !has_images {
            let token = self.bundled_session_token.lock().unwrap().clone();
            if let Some(token) = token {
                match self.try_proxy(&req, &token).await {
                    ProxyOutcome::Success(stream) => return Ok(stream),
                    ProxyOutcome::QuotaExceeded => return Err(DispatchError::QuotaExceeded),
                    ProxyOutcome::NetworkFailure => { /* fall through to direct keys */ }
                }
            }
        }

        // Step 2: provider-level cooldown gate.
        let pool_size = self.key_pool.pool_size(&req.provider);
        if self.provider_cooling_down(&req.provider) && pool_size == 0 {
            return Err(DispatchError::ProviderCoolingDown(req.provider.clone()));
        }

        // Step 3: proactive pacing.
        let wait_ms = self.rpm.pace(&req.provider, pool_size.max(1), record.default_rpm_per_key, Instant::now());
        if wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }

        // Step 4: attempt loop across the pool.
        let min_gap_secs = crate::stream::StreamDecoder::new(record.dialect).min_request_gap_secs;
        let attempts = pool_size.max(1);
        let mut last_error = String::from("no keys available");
        for _ in 0..attempts {
            let Some(key) = self.key_pool.acquire(&req.provider) else { break };
            self.enforce_request_gap(&req.provider, min_gap_secs).await;
            self.rpm.record(&req.provider, Instant::now());

            match self.try_direct(&req, &record, &key).await {
                Ok(stream) => return Ok(stream),
                Err(AttemptError::RateLimited(msg)) => {
                    debug!(provider = %req.provider, "cooling down key after rate-limit response");
                    self.key_pool.cool_down(&req.provider, &key, Duration::from_secs(60));
                    last_error = msg;
                }
                Err(AttemptError::Transient(msg)) => {
                    last_error = msg;
                }
            }
        }

        // Step 5: exhaustion.
        warn!(provider = %req.provider, error = %last_error, "pool exhausted, cooling down provider for failover");
        self.cool_down_provider(&req.provider, Duration::from_secs(60));
        Err(DispatchError::Exhausted(req.provider.clone(), last_error))
    }

    async fn try_proxy(&self, req: &GenerateRequest, token: &str) -> ProxyOutcome {
        let body = proxy::ProxyRequestBody {
            provider: req.provider.clone(),
            model: req.model.clone(),
            messages: history_to_openai_messages(&req.messages, &req.system_prompt),
            system_prompt: Some(req.system_prompt.clone()),
            max_tokens: Some(req.max_tokens),
            temperature: Some(req.temperature),
            stream: req.stream,
        };
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), proxy::proxy_auth_header(token));
        let Ok(body_json) = serde_json::to_value(&body) else {
            return ProxyOutcome::NetworkFailure;
        };
        match self
            .http
            .post_json(&proxy::bundled_endpoint(), &headers, &body_json, Duration::from_secs(60))
            .await
        {
            Ok(resp) if proxy::is_quota_exceeded(resp.status, &resp.body) => ProxyOutcome::QuotaExceeded,
            Ok(resp) if resp.is_success() => {
                let (tx, rx) = mpsc::channel(64);
                for chunk in crate::stream::StreamDecoder::decode_non_streaming(&resp.body) {
                    let _ = tx.send(Ok(chunk)).await;
                }
                ProxyOutcome::Success(ReceiverStream::new(rx))
            }
            _ => ProxyOutcome::NetworkFailure,
        }
    }

    async fn try_direct(
        &self,
        req: &GenerateRequest,
        record: &ProviderRecord,
        key: &str,
    ) -> Result<ReceiverStream<anyhow::Result<Chunk>>, AttemptError> {
        let body = build_body(record.dialect, req, key);
        let headers = build_headers(record.dialect, key);
        let resp = self
            .http
            .post_json(&record.endpoint_url(), &headers, &body, Duration::from_secs(60))
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        if resp.is_success() {
            self.rpm.learn(&req.provider, &resp.headers);
            let (tx, rx) = mpsc::channel(64);
            let mut decoder = crate::stream::StreamDecoder::new(record.dialect);
            for chunk in decoder.push(&resp.body) {
                let _ = tx.send(Ok(chunk)).await;
            }
            return Ok(ReceiverStream::new(rx));
        }
        if resp.is_rate_limited_or_oversized() || resp.body_signals_rate_or_quota() {
            return Err(AttemptError::RateLimited(format!("status {}", resp.status)));
        }
        Err(AttemptError::Transient(format!("status {}", resp.status)))
    }

    /// `spec.md` §4.3: the preferred cross-provider fallback chain,
    /// skipping the originating provider and any currently-cooling one.
    /// For `google` specifically, alternate Gemini models are tried first
    /// before falling through to other providers.
    pub fn fallback_chain_for(&self, originating: &str) -> Vec<String> {
        PREFERRED_FALLBACK_CHAIN
            .iter()
            .filter(|p| **p != originating && !self.provider_cooling_down(p))
            .map(|s| s.to_string())
            .collect()
    }

    pub fn alternate_gemini_models(&self) -> Vec<String> {
        self.registry
            .models_for_provider("google")
            .into_iter()
            .map(|m| m.id.clone())
            .collect()
    }
}

enum ProxyOutcome {
    Success(ReceiverStream<anyhow::Result<Chunk>>),
    QuotaExceeded,
    NetworkFailure,
}

enum AttemptError {
    RateLimited(String),
    Transient(String),
}

fn build_headers(dialect: Dialect, key: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    match dialect {
        Dialect::Anthropic => {
            headers.insert("x-api-key".to_string(), key.to_string());
            headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());
        }
        Dialect::OpenAi | Dialect::OllamaNdjson => {
            headers.insert("authorization".to_string(), format!("Bearer {key}"));
        }
        Dialect::ApiFreeLlm | Dialect::Proxy => {}
    }
    headers
}

fn history_to_openai_messages(history: &ChatHistory, system_prompt: &str) -> serde_json::Value {
    let mut messages = vec![serde_json::json!({ "role": "system", "content": system_prompt })];
    for turn in history.turns() {
        match turn {
            ChatTurn::System(_) => {}
            ChatTurn::User { text, .. } => {
                messages.push(serde_json::json!({ "role": "user", "content": text }));
            }
            ChatTurn::Model(segments) => {
                let text: String = segments
                    .iter()
                    .filter_map(|s| match s {
                        Segment::Text(t) => Some(t.clone()),
                        _ => None,
                    })
                    .collect();
                messages.push(serde_json::json!({ "role": "assistant", "content": text }));
            }
        }
    }
    serde_json::Value::Array(messages)
}

fn build_body(dialect: Dialect, req: &GenerateRequest, _key: &str) -> serde_json::Value {
    match dialect {
        Dialect::OpenAi | Dialect::Proxy => serde_json::json!({
            "model": req.model,
            "messages": history_to_openai_messages(&req.messages, &req.system_prompt),
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": req.stream,
        }),
        Dialect::Anthropic => serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "system": req.system_prompt,
            "messages": history_to_openai_messages(&req.messages, "")
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|m| m.get("role").and_then(|r| r.as_str()) != Some("system"))
                .collect::<Vec<_>>(),
            "stream": req.stream,
        }),
        Dialect::ApiFreeLlm => {
            let last_user = req
                .messages
                .turns()
                .iter()
                .rev()
                .find_map(|t| match t {
                    ChatTurn::User { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            serde_json::json!({ "message": last_user, "model": req.model })
        }
        Dialect::OllamaNdjson => serde_json::json!({
            "model": req.model,
            "messages": history_to_openai_messages(&req.messages, &req.system_prompt),
            "stream": req.stream,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProviderRecord;

    fn registry_with_groq() -> Arc<ProviderRegistry> {
        let mut reg = ProviderRegistry::default();
        reg.insert_provider(
            "groq",
            ProviderRecord {
                host: "https://api.groq.com".into(),
                path: "/openai/v1/chat/completions".into(),
                dialect: Dialect::OpenAi,
                default_rpm_per_key: 30,
                supports_vision: vec![],
                bundled: false,
                default_model: "llama".into(),
            },
        );
        Arc::new(reg)
    }

    fn sample_request() -> GenerateRequest {
        let mut history = ChatHistory::new();
        history.push(ChatTurn::System("sys".into()));
        history.push(ChatTurn::user("hello"));
        GenerateRequest {
            provider: "groq".into(),
            model: "llama".into(),
            system_prompt: "sys".into(),
            messages: history,
            max_tokens: 100,
            temperature: 0.7,
            stream: false,
        }
    }

    #[tokio::test]
    async fn unknown_provider_errors_immediately() {
        let dispatcher = Arc::new(CloudDispatcher::new(registry_with_groq(), Arc::new(HttpClient::new().unwrap())));
        let mut req = sample_request();
        req.provider = "does-not-exist".into();
        let result = dispatcher.generate(req).await;
        assert!(matches!(result, Err(DispatchError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn exhaustion_with_no_keys_returns_exhausted_after_cooldown_check() {
        let dispatcher = Arc::new(CloudDispatcher::new(registry_with_groq(), Arc::new(HttpClient::new().unwrap())));
        let req = sample_request();
        // No keys added: pool_size == 0, not cooling, falls to attempt loop
        // with `attempts = max(0,1) = 1` but acquire() returns None immediately.
        let result = dispatcher.generate(req).await;
        assert!(matches!(result, Err(DispatchError::Exhausted(_, _))));
    }

    #[test]
    fn build_body_openai_includes_messages_and_stream_flag() {
        let req = sample_request();
        let body = build_body(Dialect::OpenAi, &req, "key");
        assert_eq!(body["model"], "llama");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn build_body_anthropic_excludes_system_from_messages() {
        let req = sample_request();
        let body = build_body(Dialect::Anthropic, &req, "key");
        assert_eq!(body["system"], "sys");
        let messages = body["messages"].as_array().unwrap();
        assert!(messages.iter().all(|m| m["role"] != "system"));
    }

    #[test]
    fn build_body_apifreellm_uses_last_user_message() {
        let req = sample_request();
        let body = build_body(Dialect::ApiFreeLlm, &req, "key");
        assert_eq!(body["message"], "hello");
    }

    #[test]
    fn build_headers_anthropic_sets_api_key_and_version() {
        let headers = build_headers(Dialect::Anthropic, "secret");
        assert_eq!(headers.get("x-api-key"), Some(&"secret".to_string()));
        assert_eq!(headers.get("anthropic-version"), Some(&"2023-06-01".to_string()));
    }

    #[test]
    fn build_headers_openai_sets_bearer() {
        let headers = build_headers(Dialect::OpenAi, "secret");
        assert_eq!(headers.get("authorization"), Some(&"Bearer secret".to_string()));
    }

    #[test]
    fn fallback_chain_excludes_originating_provider() {
        let dispatcher = CloudDispatcher::new(registry_with_groq(), Arc::new(HttpClient::new().unwrap()));
        let chain = dispatcher.fallback_chain_for("groq");
        assert!(!chain.contains(&"groq".to_string()));
        assert!(chain.contains(&"cerebras".to_string()));
    }

    #[test]
    fn fallback_chain_excludes_cooling_providers() {
        let dispatcher = CloudDispatcher::new(registry_with_groq(), Arc::new(HttpClient::new().unwrap()));
        dispatcher.cool_down_provider("cerebras", Duration::from_secs(60));
        let chain = dispatcher.fallback_chain_for("groq");
        assert!(!chain.contains(&"cerebras".to_string()));
    }

    #[tokio::test]
    async fn enforce_request_gap_is_a_noop_for_zero_gap() {
        let dispatcher = CloudDispatcher::new(registry_with_groq(), Arc::new(HttpClient::new().unwrap()));
        let started = Instant::now();
        dispatcher.enforce_request_gap("groq", 0).await;
        dispatcher.enforce_request_gap("groq", 0).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn enforce_request_gap_waits_out_the_remainder_on_back_to_back_calls() {
        let dispatcher = CloudDispatcher::new(registry_with_groq(), Arc::new(HttpClient::new().unwrap()));
        dispatcher.enforce_request_gap("apifreellm", 1).await;
        let started = Instant::now();
        dispatcher.enforce_request_gap("apifreellm", 1).await;
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
