//! Completion transport and retry policy.
//!
//! The transport layer ([`CompletionBackend`]) only understands one call:
//! send a bounded request, get back a string or a typed error. Everything
//! about retrying (jittered backoff for rate limits, bounded retries for
//! timeouts, a single retry for transient failures, skip-on-error) lives in
//! [`RetryingClient`], written as an explicit loop so the retry budget can
//! be unit-tested in isolation.

use crate::decode::{self, CleanedPayload};
use crate::error::{CompletionError, GraphextError, Result};
use crate::limits::{MAX_RATE_LIMIT_ATTEMPTS, RateLimitPolicy};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// One message in a chat-completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role: `system`, `user`, or `assistant`.
    pub role: String,
    /// Message body.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A bounded request to the external completion API.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation to complete.
    pub messages: Vec<ChatMessage>,
    /// Target model.
    pub model: String,
    /// Tokens reserved for the response.
    pub max_tokens: Option<u32>,
    /// Deadline for this call.
    pub timeout: Duration,
}

/// A transport capable of one external completion call.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Execute a single completion call with no retries.
    async fn chat_complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, CompletionError>;
}

/// HTTP transport for an OpenAI-style chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpBackend {
    /// Create a backend for `endpoint`, authenticating with `api_key` when
    /// one is provided.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(GraphextError::Http)?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() > 500 {
        format!("{}...", &body[..500])
    } else {
        body.to_string()
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn chat_complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, CompletionError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": 0.4,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }

        let mut http_request = self.client.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            http_request =
                http_request.header(header::AUTHORIZATION, format!("Bearer {api_key}"));
        }

        let response = tokio::time::timeout(request.timeout, http_request.send())
            .await
            .map_err(|_| CompletionError::Timeout(request.timeout))?
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout(request.timeout)
                } else {
                    CompletionError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            // The vendor reuses 429 for hard quota exhaustion, which no
            // amount of waiting will fix.
            if body.contains("insufficient_quota") || body.contains("exceeded your current quota")
            {
                return Err(CompletionError::QuotaExceeded(truncate_body(&body)));
            }
            return Err(CompletionError::RateLimited(truncate_body(&body)));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::InvalidRequest(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_body(&body)
            )));
        }
        if !status.is_success() {
            return Err(CompletionError::Transient(format!(
                "HTTP {}",
                status.as_u16()
            )));
        }

        let envelope: serde_json::Value = tokio::time::timeout(request.timeout, response.json())
            .await
            .map_err(|_| CompletionError::Timeout(request.timeout))?
            .map_err(|e| CompletionError::Transient(format!("unreadable response body: {e}")))?;

        let choice = &envelope["choices"][0];
        if let Some(finish_reason) = choice["finish_reason"].as_str() {
            if finish_reason != "stop" {
                debug!(finish_reason, "Completion ended with non-stop finish reason");
            }
        }
        choice["message"]["content"]
            .as_str()
            .map(|content| content.trim().to_string())
            .ok_or_else(|| {
                CompletionError::Transient("response envelope missing message content".to_string())
            })
    }
}

/// How one [`RetryingClient::fetch`] call should behave.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// When set, exhausted retries resolve to [`FetchOutcome::Skipped`]
    /// instead of an error. Quota failures always propagate.
    pub skip_on_error: bool,
    /// Whether the payload is expected to decode as JSON; an undecodable
    /// success then consumes one retry.
    pub expect_json: bool,
    /// Retry budget shared by timeouts and undecodable payloads.
    pub max_retries: u32,
    /// A payload equal to this marker means "nothing found" and resolves to
    /// a skip rather than a success.
    pub skip_marker: Option<String>,
    /// Label used in log lines.
    pub log_label: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            skip_on_error: false,
            expect_json: false,
            max_retries: 2,
            skip_marker: None,
            log_label: "fetch".to_string(),
        }
    }
}

/// Result of a fetch that did not error out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Usable payload.
    Success(String),
    /// The chunk produced nothing usable and was deliberately skipped.
    Skipped,
}

/// Wraps a [`CompletionBackend`] with timeout, retry, and skip-on-error
/// semantics.
#[derive(Debug)]
pub struct RetryingClient<B> {
    backend: Arc<B>,
    policy: Arc<RateLimitPolicy>,
}

impl<B> Clone for RetryingClient<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<B: CompletionBackend> RetryingClient<B> {
    /// Create a client over `backend` using `policy` for backoff delays.
    pub fn new(backend: Arc<B>, policy: Arc<RateLimitPolicy>) -> Self {
        Self { backend, policy }
    }

    /// The rate-limit policy this client backs off with.
    pub fn policy(&self) -> &Arc<RateLimitPolicy> {
        &self.policy
    }

    /// Fetch one completion, applying the full retry state machine.
    ///
    /// Rate limits are backed off and retried on their own counter (capped
    /// at [`MAX_RATE_LIMIT_ATTEMPTS`], then propagated; a persistent 429
    /// usually means something upstream needs human eyes). Timeouts and
    /// undecodable payloads share `max_retries`. Transient failures get one
    /// retry. Quota exhaustion propagates immediately; an invalid request
    /// resolves to a skip because resending the same payload cannot help.
    pub async fn fetch(
        &self,
        request: &CompletionRequest,
        opts: &FetchOptions,
    ) -> Result<FetchOutcome> {
        let label = opts.log_label.as_str();
        let mut rate_limit_errors: u32 = 0;
        let mut retries_remaining = opts.max_retries;
        let mut transient_retried = false;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            debug!(label, attempt = attempts, model = %request.model, "Sending completion request");

            let payload = match self.backend.chat_complete(request).await {
                Ok(payload) => payload,
                Err(CompletionError::RateLimited(msg)) => {
                    if rate_limit_errors >= MAX_RATE_LIMIT_ATTEMPTS {
                        warn!(label, "Too many rate limit errors, abandoning request");
                        return Err(GraphextError::RateLimitExhausted {
                            attempts: rate_limit_errors,
                        });
                    }
                    let delay = self.policy.backoff_delay(&request.model, rate_limit_errors);
                    warn!(label, backoff_secs = delay.as_secs(), %msg, "Rate limited, backing off");
                    sleep(delay).await;
                    rate_limit_errors += 1;
                    continue;
                }
                Err(CompletionError::QuotaExceeded(msg)) => {
                    // Will not resolve itself; bubble up even under
                    // skip_on_error so the caller sees it promptly.
                    warn!(label, "Quota exhausted, abandoning request");
                    return Err(GraphextError::QuotaExceeded(msg));
                }
                Err(CompletionError::InvalidRequest(msg)) => {
                    warn!(label, %msg, "Request rejected, skipping this chunk");
                    return Ok(FetchOutcome::Skipped);
                }
                Err(CompletionError::Timeout(_)) => {
                    if retries_remaining > 0 {
                        warn!(label, "Request timed out, trying again");
                        retries_remaining -= 1;
                        continue;
                    }
                    warn!(label, "Request timed out, out of retries");
                    if opts.skip_on_error {
                        return Ok(FetchOutcome::Skipped);
                    }
                    return Err(GraphextError::Timeout { attempts });
                }
                Err(CompletionError::Transient(msg)) => {
                    if !transient_retried {
                        warn!(label, %msg, "Transient error, trying once more");
                        transient_retried = true;
                        continue;
                    }
                    if opts.skip_on_error {
                        warn!(label, %msg, "Transient error persisted, skipping");
                        return Ok(FetchOutcome::Skipped);
                    }
                    return Err(GraphextError::Transient(msg));
                }
            };

            let payload = payload.trim();
            if let Some(marker) = &opts.skip_marker {
                if payload == marker {
                    debug!(label, "Backend returned the designated skip marker");
                    return Ok(FetchOutcome::Skipped);
                }
            }

            if !opts.expect_json {
                return Ok(FetchOutcome::Success(payload.to_string()));
            }

            match decode::clean_payload(payload) {
                CleanedPayload::Valid(cleaned) => return Ok(FetchOutcome::Success(cleaned)),
                CleanedPayload::Unstructured(raw) => return Ok(FetchOutcome::Success(raw)),
                CleanedPayload::Invalid => {
                    if retries_remaining > 0 {
                        warn!(label, "Payload did not decode as JSON, trying again");
                        retries_remaining -= 1;
                        continue;
                    }
                    if opts.skip_on_error {
                        warn!(label, "Payload never decoded, skipping to contain damage");
                        return Ok(FetchOutcome::Skipped);
                    }
                    return Err(GraphextError::MalformedOutput { attempts });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that replays a script of responses, one per call.
    struct ScriptedBackend {
        script: Mutex<VecDeque<std::result::Result<String, CompletionError>>>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(script: Vec<std::result::Result<String, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn chat_complete(
            &self,
            _request: &CompletionRequest,
        ) -> std::result::Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Transient("script exhausted".into())))
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage::user("chunk text")],
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: Some(100),
            timeout: Duration::from_secs(5),
        }
    }

    fn client(backend: &Arc<ScriptedBackend>) -> RetryingClient<ScriptedBackend> {
        RetryingClient::new(Arc::clone(backend), Arc::new(RateLimitPolicy::default()))
    }

    fn timeout_err() -> std::result::Result<String, CompletionError> {
        Err(CompletionError::Timeout(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_succeeds_after_exactly_n_timeouts() {
        let backend =
            ScriptedBackend::new(vec![timeout_err(), timeout_err(), Ok("payload".into())]);
        let opts = FetchOptions {
            max_retries: 2,
            ..Default::default()
        };
        let outcome = client(&backend).fetch(&request(), &opts).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Success("payload".into()));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_skips_when_retries_insufficient() {
        let backend =
            ScriptedBackend::new(vec![timeout_err(), timeout_err(), Ok("payload".into())]);
        let opts = FetchOptions {
            max_retries: 1,
            skip_on_error: true,
            ..Default::default()
        };
        let outcome = client(&backend).fetch(&request(), &opts).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Skipped);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_errors_without_skip_on_error() {
        let backend = ScriptedBackend::new(vec![timeout_err(), timeout_err()]);
        let opts = FetchOptions {
            max_retries: 1,
            ..Default::default()
        };
        let err = client(&backend).fetch(&request(), &opts).await.unwrap_err();
        assert!(matches!(err, GraphextError::Timeout { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_quota_propagates_immediately() {
        let backend = ScriptedBackend::new(vec![
            Err(CompletionError::QuotaExceeded("billing".into())),
            Ok("never reached".into()),
        ]);
        let opts = FetchOptions {
            skip_on_error: true,
            ..Default::default()
        };
        let err = client(&backend).fetch(&request(), &opts).await.unwrap_err();
        assert!(matches!(err, GraphextError::QuotaExceeded(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_skips_without_retry() {
        let backend = ScriptedBackend::new(vec![
            Err(CompletionError::InvalidRequest("too large".into())),
            Ok("never reached".into()),
        ]);
        let outcome = client(&backend)
            .fetch(&request(), &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Skipped);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backs_off_then_succeeds() {
        let backend = ScriptedBackend::new(vec![
            Err(CompletionError::RateLimited("slow down".into())),
            Err(CompletionError::RateLimited("slow down".into())),
            Ok("payload".into()),
        ]);
        let outcome = client(&backend)
            .fetch(&request(), &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Success("payload".into()));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_cap_propagates() {
        let script = (0..=MAX_RATE_LIMIT_ATTEMPTS)
            .map(|_| Err(CompletionError::RateLimited("still throttled".into())))
            .collect();
        let backend = ScriptedBackend::new(script);
        let opts = FetchOptions {
            skip_on_error: true,
            ..Default::default()
        };
        let err = client(&backend).fetch(&request(), &opts).await.unwrap_err();
        assert!(matches!(err, GraphextError::RateLimitExhausted { .. }));
        assert_eq!(backend.calls(), MAX_RATE_LIMIT_ATTEMPTS + 1);
    }

    #[tokio::test]
    async fn test_transient_retried_exactly_once() {
        let backend = ScriptedBackend::new(vec![
            Err(CompletionError::Transient("connection reset".into())),
            Ok("payload".into()),
        ]);
        let outcome = client(&backend)
            .fetch(&request(), &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Success("payload".into()));

        let backend = ScriptedBackend::new(vec![
            Err(CompletionError::Transient("reset".into())),
            Err(CompletionError::Transient("reset".into())),
            Ok("never reached".into()),
        ]);
        let err = client(&backend)
            .fetch(&request(), &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphextError::Transient(_)));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_json_consumes_one_retry() {
        let backend = ScriptedBackend::new(vec![
            Ok("not json at all".into()),
            Ok(r#"{"entity": "value"}"#.into()),
        ]);
        let opts = FetchOptions {
            expect_json: true,
            max_retries: 1,
            ..Default::default()
        };
        let outcome = client(&backend).fetch(&request(), &opts).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Success(s) if s.contains("entity")));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_skip_marker_resolves_to_skip() {
        let backend = ScriptedBackend::new(vec![Ok("NO_ENTITIES_FOUND".into())]);
        let opts = FetchOptions {
            skip_marker: Some("NO_ENTITIES_FOUND".into()),
            expect_json: true,
            ..Default::default()
        };
        let outcome = client(&backend).fetch(&request(), &opts).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Skipped);
    }

    mod http_backend {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn backend_for(server: &MockServer) -> HttpBackend {
            HttpBackend::new(format!("{}/v1/chat/completions", server.uri()), None).unwrap()
        }

        #[tokio::test]
        async fn test_success_extracts_content() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/chat/completions"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "choices": [{
                        "finish_reason": "stop",
                        "message": {"role": "assistant", "content": "  extracted  "}
                    }]
                })))
                .mount(&server)
                .await;

            let payload = backend_for(&server)
                .await
                .chat_complete(&request())
                .await
                .unwrap();
            assert_eq!(payload, "extracted");
        }

        #[tokio::test]
        async fn test_429_classified_as_rate_limited() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
                .mount(&server)
                .await;

            let err = backend_for(&server)
                .await
                .chat_complete(&request())
                .await
                .unwrap_err();
            assert!(matches!(err, CompletionError::RateLimited(_)));
        }

        #[tokio::test]
        async fn test_quota_body_classified_as_quota() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(429)
                        .set_body_string(r#"{"error": {"code": "insufficient_quota"}}"#),
                )
                .mount(&server)
                .await;

            let err = backend_for(&server)
                .await
                .chat_complete(&request())
                .await
                .unwrap_err();
            assert!(matches!(err, CompletionError::QuotaExceeded(_)));
        }

        #[tokio::test]
        async fn test_400_classified_as_invalid_request() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(400).set_body_string("context length"))
                .mount(&server)
                .await;

            let err = backend_for(&server)
                .await
                .chat_complete(&request())
                .await
                .unwrap_err();
            assert!(matches!(err, CompletionError::InvalidRequest(_)));
        }

        #[tokio::test]
        async fn test_500_classified_as_transient() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;

            let err = backend_for(&server)
                .await
                .chat_complete(&request())
                .await
                .unwrap_err();
            assert!(matches!(err, CompletionError::Transient(_)));
        }

        #[tokio::test]
        async fn test_slow_response_times_out() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_delay(Duration::from_secs(5))
                        .set_body_string("{}"),
                )
                .mount(&server)
                .await;

            let mut req = request();
            req.timeout = Duration::from_millis(100);
            let err = backend_for(&server)
                .await
                .chat_complete(&req)
                .await
                .unwrap_err();
            assert!(matches!(err, CompletionError::Timeout(_)));
        }
    }
}
