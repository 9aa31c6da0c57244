//! LLM Gateway (C3): a retrying HTTP client over an Anthropic-like messages
//! API, plus the tolerant JSON extractor used to recover structured output
//! from free-form model text.

use crate::error::{AuditError, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

const MAX_RETRIES: u32 = 5;
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 60;
const RATE_LIMIT_BUFFER_SECS: u64 = 5;
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub stop_reason: String,
}

/// A content block from a tool-enabled turn: either plain text or a
/// requested tool invocation.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Clone)]
pub struct LlmToolResponse {
    pub blocks: Vec<ContentBlock>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub stop_reason: String,
}

impl LlmToolResponse {
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct LlmGateway {
    client: Client,
    base_url: String,
}

impl LlmGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.into(),
        }
    }

    pub async fn call(
        &self,
        api_key: &str,
        system: &str,
        user: &str,
        model: Option<&str>,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse> {
        let model = model.unwrap_or(DEFAULT_MODEL);
        let max_tokens = max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let response = self
            .with_retries(|| {
                self.client
                    .post(format!("{}/v1/messages", self.base_url))
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
            })
            .await?;

        let parsed: Value = response
            .json()
            .await
            .map_err(AuditError::from)?;

        let content = parsed["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|block| block["text"].as_str())
            .unwrap_or_default()
            .to_string();

        let input_tokens = parsed["usage"]["input_tokens"].as_i64().unwrap_or(0);
        let output_tokens = parsed["usage"]["output_tokens"].as_i64().unwrap_or(0);
        let stop_reason = parsed["stop_reason"].as_str().unwrap_or("end_turn").to_string();

        Ok(LlmResponse {
            content,
            input_tokens,
            output_tokens,
            stop_reason,
        })
    }

    /// Call the API with tool definitions and a running message history.
    /// SDK-level retries are disabled (there is no SDK here); the same
    /// retry policy as `call` applies per HTTP attempt.
    pub async fn call_with_tools(
        &self,
        api_key: &str,
        system: &str,
        messages: &[Value],
        tools: &[Value],
        model: Option<&str>,
        max_tokens: Option<u32>,
    ) -> Result<LlmToolResponse> {
        let model = model.unwrap_or(DEFAULT_MODEL);
        let max_tokens = max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
            "tools": tools,
        });

        let response = self
            .with_retries(|| {
                self.client
                    .post(format!("{}/v1/messages", self.base_url))
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
            })
            .await?;

        let parsed: Value = response.json().await.map_err(AuditError::from)?;

        let blocks = parsed["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| match block["type"].as_str() {
                        Some("text") => {
                            Some(ContentBlock::Text(block["text"].as_str().unwrap_or_default().to_string()))
                        }
                        Some("tool_use") => Some(ContentBlock::ToolUse {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            input: block["input"].clone(),
                        }),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let input_tokens = parsed["usage"]["input_tokens"].as_i64().unwrap_or(0);
        let output_tokens = parsed["usage"]["output_tokens"].as_i64().unwrap_or(0);
        let stop_reason = parsed["stop_reason"].as_str().unwrap_or("end_turn").to_string();

        Ok(LlmToolResponse {
            blocks,
            input_tokens,
            output_tokens,
            stop_reason,
        })
    }

    pub async fn count_tokens(
        &self,
        api_key: &str,
        system: &str,
        user: &str,
        model: Option<&str>,
    ) -> Result<i64> {
        let model = model.unwrap_or(DEFAULT_MODEL);
        let body = serde_json::json!({
            "model": model,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let response = self
            .with_retries(|| {
                self.client
                    .post(format!("{}/v1/messages/count_tokens", self.base_url))
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
            })
            .await?;

        let parsed: Value = response.json().await.map_err(AuditError::from)?;
        Ok(parsed["input_tokens"].as_i64().unwrap_or(0))
    }

    /// Shared retry policy for `call` and `count_tokens`: up to 5 attempts;
    /// 429 waits `Retry-After + 5s` (60s if absent); 5xx waits
    /// `min(10·2^attempt, 120)s`; anything else propagates immediately.
    async fn with_retries<F, Fut>(&self, mut request: F) -> Result<reqwest::Response>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = request().await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        let body = response.text().await.unwrap_or_default();
                        return Err(AuditError::llm_api(format!(
                            "llm request failed after {MAX_RETRIES} retries: {status} {body}"
                        )));
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let wait = response
                            .headers()
                            .get("retry-after")
                            .and_then(|h| h.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(|s| s + RATE_LIMIT_BUFFER_SECS)
                            .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS);
                        warn!("llm rate limited, waiting {wait}s (attempt {attempt})");
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    } else if status.is_server_error() {
                        let wait = (10u64.saturating_mul(1 << attempt.min(10))).min(120);
                        warn!("llm server error {status}, waiting {wait}s (attempt {attempt})");
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(AuditError::llm_api(format!("{status} {body}")));
                    }
                }
                Err(e) => return Err(AuditError::from(e)),
            }
        }
    }
}

/// Recover valid JSON from model output in four stages: direct parse; strip
/// markdown code fences and parse; outermost `{...}` substring; outermost
/// `[...]` substring. Schema validation is the caller's responsibility.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    if let Ok(v) = serde_json::from_str(raw) {
        return Ok(v);
    }

    let stripped = strip_code_fences(raw);
    if let Ok(v) = serde_json::from_str(&stripped) {
        return Ok(v);
    }

    if let Some(obj) = outermost_delimited(raw, '{', '}') {
        if let Ok(v) = serde_json::from_str(&obj) {
            return Ok(v);
        }
    }

    if let Some(arr) = outermost_delimited(raw, '[', ']') {
        if let Ok(v) = serde_json::from_str(&arr) {
            return Ok(v);
        }
    }

    let prefix: String = raw.chars().take(120).collect();
    Err(AuditError::LlmParse { prefix })
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

fn outermost_delimited(raw: &str, open: char, close: char) -> Option<String> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    if end <= start {
        return None;
    }
    Some(raw[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ranked {
        file: String,
        priority: u8,
    }

    #[test]
    fn parse_json_direct() {
        let out: Vec<Ranked> = parse_json(r#"[{"file":"a.rs","priority":9}]"#).unwrap();
        assert_eq!(out, vec![Ranked { file: "a.rs".into(), priority: 9 }]);
    }

    #[test]
    fn parse_json_strips_code_fences() {
        let raw = "```json\n[{\"file\":\"a.rs\",\"priority\":9}]\n```";
        let out: Vec<Ranked> = parse_json(raw).unwrap();
        assert_eq!(out[0].file, "a.rs");
    }

    #[test]
    fn parse_json_extracts_outermost_object() {
        #[derive(Debug, Deserialize)]
        struct Obj {
            ok: bool,
        }
        let raw = "Sure, here's the result: {\"ok\":true} — let me know if you need more.";
        let out: Obj = parse_json(raw).unwrap();
        assert!(out.ok);
    }

    #[test]
    fn parse_json_extracts_outermost_array_over_malformed_prefix() {
        let raw = "preamble garbage [{\"file\":\"b.rs\",\"priority\":3}] trailing junk";
        let out: Vec<Ranked> = parse_json(raw).unwrap();
        assert_eq!(out[0].file, "b.rs");
    }

    #[test]
    fn parse_json_failure_carries_first_120_chars() {
        let raw = "x".repeat(500);
        let err = parse_json::<Vec<Ranked>>(&raw).unwrap_err();
        match err {
            AuditError::LlmParse { prefix } => assert_eq!(prefix.len(), 120),
            other => panic!("expected LlmParse, got {other:?}"),
        }
    }

    fn success_body() -> serde_json::Value {
        serde_json::json!({
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 12, "output_tokens": 3},
            "stop_reason": "end_turn",
        })
    }

    #[tokio::test]
    async fn call_returns_parsed_response_on_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(success_body().to_string())
            .create_async()
            .await;

        let gateway = LlmGateway::new(server.url());
        let resp = gateway
            .call("sk-test", "system", "user", None, None)
            .await
            .unwrap();

        assert_eq!(resp.content, "hello");
        assert_eq!(resp.input_tokens, 12);
        assert_eq!(resp.output_tokens, 3);
        mock.assert_async().await;
    }

    #[tokio::test(start_paused = true)]
    async fn call_retries_429_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let rate_limited = server
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_header("retry-after", "1")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(success_body().to_string())
            .expect(1)
            .create_async()
            .await;

        let gateway = LlmGateway::new(server.url());
        let resp = gateway
            .call("sk-test", "system", "user", None, None)
            .await
            .unwrap();

        assert_eq!(resp.content, "hello");
        rate_limited.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test(start_paused = true)]
    async fn call_retries_server_error_with_backoff() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/v1/messages")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(success_body().to_string())
            .expect(1)
            .create_async()
            .await;

        let gateway = LlmGateway::new(server.url());
        let resp = gateway
            .call("sk-test", "system", "user", None, None)
            .await
            .unwrap();

        assert_eq!(resp.content, "hello");
        failing.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn call_surfaces_client_error_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let gateway = LlmGateway::new(server.url());
        let err = gateway
            .call("sk-test", "system", "user", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, AuditError::LlmApi(_)));
        mock.assert_async().await;
    }
}
