//! Remote chat provider: streams an OpenAI-compatible chat completion.

use keel_core::{
    CancellationToken, ChatMessage, LlmConfig, Role, StreamCallback, StreamChunk,
};
use keel_errors::{EnhancedError, ErrorType, errors};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::error::Error as _;
use std::io::BufRead;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no API key configured; set {0}")]
    MissingApiKey(String),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider request failed: {0}")]
    Network(String),
    #[error("provider stream failed: {0}")]
    Stream(String),
    #[error("provider stream cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn to_enhanced(&self) -> EnhancedError {
        match self {
            Self::MissingApiKey(env) => errors::missing_api_key(env),
            Self::Cancelled => {
                EnhancedError::new("Cancelled", self.to_string(), ErrorType::Cancelled)
            }
            Self::Status { status: 401 | 403, .. } => {
                EnhancedError::new("Provider Rejected Credentials", self.to_string(), ErrorType::Configuration)
                    .with_suggestion("Check the API key and llm.endpoint in .keel/settings.json")
            }
            _ => EnhancedError::new("Provider Unavailable", self.to_string(), ErrorType::Network)
                .with_suggestion("Retry the instruction; raise llm.timeout_seconds if the provider is slow"),
        }
    }
}

/// Streaming chat completion over the full history.
pub trait ChatProvider: Send + Sync {
    /// Sends `history`, forwards each text delta to `cb`, and returns the
    /// assembled text once the stream ends. `cancel` is checked between
    /// stream lines.
    fn stream_chat(
        &self,
        history: &[ChatMessage],
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

/// One parsed server-sent-events line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Delta(String),
    Done,
    /// Keep-alives, comments, role-only deltas and unparseable payloads.
    Skip,
}

pub fn parse_sse_line(line: &str) -> SseLine {
    let trimmed = line.trim();
    let Some(data) = trimmed.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return SseLine::Skip;
    };
    let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    else {
        return SseLine::Skip;
    };
    let content = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .or_else(|| choice.get("message").and_then(|m| m.get("content")))
        .and_then(|v| v.as_str());
    match content {
        Some(text) if !text.is_empty() => SseLine::Delta(text.to_string()),
        _ => SseLine::Skip,
    }
}

/// Wire message for one history entry. Tool results travel as user turns
/// so any chat-completions endpoint accepts them.
pub fn wire_message(message: &ChatMessage) -> Value {
    match message.role {
        Role::System => json!({"role": "system", "content": message.content}),
        Role::User => json!({"role": "user", "content": message.content}),
        Role::Assistant => json!({"role": "assistant", "content": message.content}),
        Role::ToolResult => json!({
            "role": "user",
            "content": format!("Tool result:\n{}", message.content),
        }),
    }
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(cfg: LlmConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
            .build()?;
        Ok(Self { cfg, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        if let Some(key) = self.cfg.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.clone());
        }
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingApiKey(self.cfg.api_key_env.clone()))
    }

    fn build_payload(&self, history: &[ChatMessage]) -> Value {
        json!({
            "model": self.cfg.model,
            "messages": history.iter().map(wire_message).collect::<Vec<_>>(),
            "temperature": self.cfg.temperature,
            "max_tokens": self.cfg.max_tokens,
            "stream": true,
        })
    }

    fn open_stream(
        &self,
        history: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<reqwest::blocking::Response, ProviderError> {
        let api_key = self.api_key()?;
        let payload = self.build_payload(history);
        let mut attempt: u8 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let err = match self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(&api_key)
                .json(&payload)
                .send()
            {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().unwrap_or_default();
                    let err = ProviderError::Status {
                        status: status.as_u16(),
                        body: body.chars().take(500).collect(),
                    };
                    if !should_retry_status(status) {
                        return Err(err);
                    }
                    err
                }
                Err(err) => ProviderError::Network(describe_transport_error(&err)),
            };
            if attempt >= self.cfg.max_retries {
                return Err(err);
            }
            if !cancel.sleep(retry_delay(self.cfg.retry_base_ms, attempt)) {
                return Err(ProviderError::Cancelled);
            }
            attempt += 1;
        }
    }
}

impl ChatProvider for OpenAiCompatibleClient {
    fn stream_chat(
        &self,
        history: &[ChatMessage],
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let resp = self.open_stream(history, cancel)?;
        let mut text = String::new();
        let reader = std::io::BufReader::new(resp);
        for line in reader.lines() {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let line = line.map_err(|e| ProviderError::Stream(e.to_string()))?;
            match parse_sse_line(&line) {
                SseLine::Delta(delta) => {
                    text.push_str(&delta);
                    cb(StreamChunk::ContentDelta(delta));
                }
                SseLine::Done => break,
                SseLine::Skip => {}
            }
        }
        cb(StreamChunk::Done);
        Ok(text)
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn retry_delay(base_ms: u64, attempt: u8) -> Duration {
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(u32::from(attempt)));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    let inner = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if err.is_timeout() {
        "request timed out; try increasing llm.timeout_seconds".to_string()
    } else if inner.contains("dns") || inner.contains("resolve") {
        "could not resolve the provider host; check llm.endpoint and your network".to_string()
    } else if err.is_connect() {
        format!("could not connect to the provider: {inner}")
    } else {
        err.to_string()
    }
}
