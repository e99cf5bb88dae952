//! OpenAI-compatible HTTP speaker.
//!
//! Talks to any `/chat/completions` endpoint (OpenRouter, vLLM, LM Studio,
//! llama.cpp, hosted gateways) using the standard wire format.  The
//! non-streaming path posts JSON and reads `choices[0].message.content`; the
//! streaming path consumes SSE `data:` chunks until the `[DONE]` sentinel,
//! pushing each delta into the caller's sink.  Token usage is captured into
//! the shared slot whenever the endpoint reports it.
//!
//! Transient failures (connect errors, 5xx) retry on an exponential backoff
//! schedule; HTTP 429 consults the `Retry-After` header and then a hint
//! embedded in the body; any other 4xx is permanent for the turn.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::roundtable::agent::{Agent, AgentIdentity, ChunkSink};
use crate::roundtable::config::AgentConfig;
use crate::roundtable::error::AgentError;
use crate::roundtable::message::{Message, TokenUsage};
use crate::roundtable::prompt;
use crate::roundtable::retry::{parse_retry_after, parse_retry_hint, RetryConfig};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client keeps TLS sessions and DNS lookups warm across every
    /// API agent in the process.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialized shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// One decoded SSE line.
#[derive(Debug, PartialEq)]
enum SseEvent {
    /// Incremental assistant content.
    Delta(String),
    /// Usage record from a terminal chunk.
    Usage(TokenUsage),
    /// The `[DONE]` sentinel.
    Done,
    /// Anything else (comments, empty keep-alives, finish_reason chunks).
    Ignore,
}

/// Parse one complete SSE line from a chat-completions stream.
fn parse_sse_line(line: &str) -> SseEvent {
    let data = match line.strip_prefix("data:") {
        Some(rest) => rest.trim(),
        None => return SseEvent::Ignore,
    };
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return SseEvent::Ignore,
    };
    if let Some(usage) = value.get("usage") {
        if !usage.is_null() {
            let input = usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let output = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            if input + output > 0 {
                return SseEvent::Usage(TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                });
            }
        }
    }
    let delta = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str());
    match delta {
        Some(text) if !text.is_empty() => SseEvent::Delta(text.to_string()),
        _ => SseEvent::Ignore,
    }
}

/// HTTP API adapter for OpenAI-compatible chat-completion endpoints.
pub struct ApiAgent {
    identity: AgentIdentity,
    endpoint: String,
    api_key: Option<String>,
    retry: RetryConfig,
    usage: Mutex<Option<TokenUsage>>,
}

impl ApiAgent {
    /// Build from config; endpoint and model presence are verified during
    /// [`initialize`](Agent::initialize).
    pub fn new(cfg: &AgentConfig) -> Self {
        Self {
            identity: AgentIdentity::from_config(cfg),
            endpoint: cfg
                .api_endpoint
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            api_key: cfg.api_key.clone(),
            retry: RetryConfig::default(),
            usage: Mutex::new(None),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    /// Request body shared by both paths.
    fn request_body(&self, transcript: &[Message], stream: bool) -> serde_json::Value {
        let messages = prompt::assemble_wire(&self.identity, transcript);
        let mut body = serde_json::json!({
            "model": self.identity.model.as_deref().unwrap_or_default(),
            "messages": messages,
        });
        if self.identity.temperature > 0.0 {
            body["temperature"] = serde_json::json!(self.identity.temperature);
        }
        if self.identity.max_tokens > 0 {
            body["max_tokens"] = serde_json::json!(self.identity.max_tokens);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    /// Issue one POST, classifying transport and status failures.
    async fn post_once(
        &self,
        cancel: &CancellationToken,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, AgentError> {
        let mut request = shared_http_client()
            .post(self.chat_url())
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = request.send() => {
                result.map_err(|e| AgentError::Transient(format!("request failed: {}", e)))
            }
        }
    }

    /// Run the retry policy around `post_once`, returning the first
    /// successful response.
    ///
    /// Retries connect errors and 5xx on the backoff schedule; 429 waits for
    /// the server's own hint when one is given.  Other 4xx statuses are
    /// permanent and never retried.
    async fn post_with_retry(
        &self,
        cancel: &CancellationToken,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, AgentError> {
        let mut last_error = AgentError::Transient("no attempts made".to_string());

        for attempt in 0..self.retry.max_attempts {
            match self.post_once(cancel, body).await {
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => last_error = e,
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() == 429 {
                        let header_delay = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(parse_retry_after);
                        let text = response.text().await.unwrap_or_default();
                        let delay = header_delay
                            .or_else(|| parse_retry_hint(&text))
                            .unwrap_or_else(|| self.retry.delay_for(attempt));
                        last_error = AgentError::Transient(format!(
                            "HTTP 429 from {}: {}",
                            self.endpoint,
                            text.chars().take(200).collect::<String>()
                        ));
                        if attempt + 1 < self.retry.max_attempts {
                            log::debug!(
                                "agent '{}' rate limited upstream; waiting {:?}",
                                self.identity.id,
                                delay
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    let excerpt: String = text.chars().take(400).collect();
                    if status.is_server_error() {
                        last_error = AgentError::Transient(format!(
                            "HTTP {} from {}: {}",
                            status, self.endpoint, excerpt
                        ));
                    } else {
                        // Non-429 client errors do not improve on retry.
                        return Err(AgentError::Permanent(format!(
                            "HTTP {} from {}: {}",
                            status, self.endpoint, excerpt
                        )));
                    }
                }
            }

            if attempt + 1 < self.retry.max_attempts {
                let delay = self.retry.delay_for(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl Agent for ApiAgent {
    async fn initialize(&mut self) -> Result<(), AgentError> {
        if self.endpoint.is_empty() {
            return Err(AgentError::ConfigInvalid(format!(
                "agent '{}': api_endpoint is required",
                self.identity.id
            )));
        }
        if self.identity.model.is_none() {
            return Err(AgentError::ConfigInvalid(format!(
                "agent '{}': model is required",
                self.identity.id
            )));
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        if self.endpoint.is_empty() || self.identity.model.is_none() {
            return false;
        }
        // Local servers commonly run without keys; anything else needs one.
        self.api_key.is_some()
            || self.endpoint.contains("localhost")
            || self.endpoint.contains("127.0.0.1")
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let body = serde_json::json!({
            "model": self.identity.model.as_deref().unwrap_or_default(),
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });
        self.post_with_retry(cancel, &body)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                AgentError::Cancelled => AgentError::Cancelled,
                other => AgentError::Unhealthy(other.to_string()),
            })
    }

    async fn cli_version(&self, _cancel: &CancellationToken) -> Result<String, AgentError> {
        Ok(format!(
            "openai-compatible endpoint {} (model {})",
            self.endpoint,
            self.identity.model.as_deref().unwrap_or("unset")
        ))
    }

    async fn send_message(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
    ) -> Result<String, AgentError> {
        let body = self.request_body(transcript, false);
        let response = self.post_with_retry(cancel, &body).await?;
        let parsed: serde_json::Value = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = response.json() => result.map_err(|e| {
                AgentError::Permanent(format!("malformed response body: {}", e))
            })?,
        };

        if let Some(usage) = parsed.get("usage") {
            let input = usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let output = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            *self.usage.lock().await = Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
            });
        }

        parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                AgentError::Permanent("response carried no assistant content".to_string())
            })
    }

    async fn stream_message(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
        sink: ChunkSink<'_>,
    ) -> Result<String, AgentError> {
        let body = self.request_body(transcript, true);
        let response = self.post_with_retry(cancel, &body).await?;

        let mut stream = response.bytes_stream();
        let mut pending = String::new();
        let mut accumulated = String::new();
        let mut done = false;

        while !done {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    return Err(AgentError::Transient(format!("stream error: {}", e)));
                }
                None => break,
            };
            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                match parse_sse_line(line.trim_end()) {
                    SseEvent::Delta(text) => {
                        sink(&text);
                        accumulated.push_str(&text);
                    }
                    SseEvent::Usage(usage) => {
                        *self.usage.lock().await = Some(usage);
                    }
                    SseEvent::Done => {
                        done = true;
                        break;
                    }
                    SseEvent::Ignore => {}
                }
            }
        }

        Ok(accumulated)
    }

    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_config() -> AgentConfig {
        let mut cfg = AgentConfig::new("critic", "openai");
        cfg.model = Some("gpt-4o-mini".to_string());
        cfg.api_endpoint = Some("http://localhost:8000/v1/".to_string());
        cfg
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let agent = ApiAgent::new(&api_config());
        assert_eq!(agent.chat_url(), "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn body_includes_sampling_params_when_positive() {
        let agent = ApiAgent::new(&api_config());
        let body = agent.request_body(&[], false);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert!(body["temperature"].as_f64().unwrap() > 0.0);
        assert_eq!(body["max_tokens"], 2000);
        assert!(body.get("stream").is_none());

        let mut cfg = api_config();
        cfg.temperature = 0.0;
        cfg.max_tokens = 0;
        let agent = ApiAgent::new(&cfg);
        let body = agent.request_body(&[], true);
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn sse_parsing_handles_deltas_and_done() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#),
            SseEvent::Delta("hel".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseEvent::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseEvent::Ignore);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            SseEvent::Ignore
        );
    }

    #[test]
    fn sse_parsing_captures_usage() {
        let event = parse_sse_line(
            r#"data: {"choices":[],"usage":{"prompt_tokens":11,"completion_tokens":4}}"#,
        );
        match event {
            SseEvent::Usage(usage) => {
                assert_eq!(usage.input_tokens, 11);
                assert_eq!(usage.output_tokens, 4);
                assert_eq!(usage.total_tokens, 15);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn initialize_requires_endpoint_and_model() {
        let mut cfg = AgentConfig::new("bare", "openai");
        cfg.model = Some("gpt-4o".to_string());
        let mut agent = ApiAgent::new(&cfg);
        assert!(matches!(
            agent.initialize().await.unwrap_err(),
            AgentError::ConfigInvalid(_)
        ));

        let mut cfg = AgentConfig::new("bare", "openai");
        cfg.api_endpoint = Some("http://localhost:1234/v1".to_string());
        let mut agent = ApiAgent::new(&cfg);
        assert!(matches!(
            agent.initialize().await.unwrap_err(),
            AgentError::ConfigInvalid(_)
        ));
    }

    #[test]
    fn availability_tolerates_keyless_local_servers() {
        let agent = ApiAgent::new(&api_config());
        assert!(agent.is_available());

        let mut cfg = api_config();
        cfg.api_endpoint = Some("https://api.example.com/v1".to_string());
        let agent = ApiAgent::new(&cfg);
        assert!(!agent.is_available());

        cfg.api_key = Some("sk-test".to_string());
        let agent = ApiAgent::new(&cfg);
        assert!(agent.is_available());
    }
}
