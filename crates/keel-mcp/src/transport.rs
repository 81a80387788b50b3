use anyhow::{Context, Result};
use keel_core::{CancellationToken, ToolServerConfig};
use keel_observe::Observer;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::ToolServer;

const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("request to {endpoint} failed: {message}")]
    Network { endpoint: String, message: String },
    #[error("unreadable response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("no tool server registered as '{0}'")]
    UnknownServer(String),
    #[error("tool call cancelled")]
    Cancelled,
}

impl TransportError {
    fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => should_retry_status(*status),
            Self::Network { .. } => true,
            _ => false,
        }
    }
}

/// Statuses worth retrying against the same endpoint.
pub fn should_retry_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Statuses that end the whole call: no retry, no fallback endpoint.
pub fn is_fatal_status(status: u16) -> bool {
    matches!(status, 400 | 401 | 403)
}

/// Waits between attempts against one endpoint. One attempt more than
/// there are delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: [1000, 2000, 4000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }
}

/// Suspension point between retry attempts.
pub trait Sleeper: Send + Sync {
    /// Waits for `delay`. Returns `false` if cancelled before it elapsed.
    fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool;
}

/// Sleeps on the current thread in short slices, checking for cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        cancel.sleep(delay)
    }
}

/// Tool server reached over HTTP at `<url>/tools/<name>`, falling back to
/// `<url>/api/tools/<name>`.
pub struct HttpToolServer {
    id: String,
    base_url: String,
    client: Client,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    observer: Arc<Observer>,
}

impl HttpToolServer {
    pub fn new(config: &ToolServerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .with_context(|| format!("failed to build HTTP client for tool server {}", config.id))?;
        Ok(Self {
            id: config.id.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::default(),
            sleeper: Arc::new(ThreadSleeper),
            observer: Arc::new(Observer::silent()),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn endpoints(&self, tool_name: &str) -> [String; 2] {
        [
            format!("{}/tools/{tool_name}", self.base_url),
            format!("{}/api/tools/{tool_name}", self.base_url),
        ]
    }

    fn post(&self, endpoint: &str, input: &Value) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(endpoint)
            .json(&json!({ "input": input }))
            .send()
            .map_err(|err| TransportError::Network {
                endpoint: endpoint.to_string(),
                message: describe_reqwest_error(&err),
            })?;
        let status = response.status();
        let body = response.text().map_err(|err| TransportError::Decode {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        // Servers that answer with plain text get it back verbatim.
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

impl ToolServer for HttpToolServer {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(
        &self,
        tool_name: &str,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, TransportError> {
        let mut last_error = None;
        for endpoint in self.endpoints(tool_name) {
            for attempt in 0..self.retry.max_attempts() {
                if cancel.is_cancelled() {
                    return Err(TransportError::Cancelled);
                }
                let err = match self.post(&endpoint, input) {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                };
                self.observer.verbose_log(&format!(
                    "tool server {} attempt {} failed: {err}",
                    self.id,
                    attempt + 1
                ));
                let retryable = err.is_retryable();
                if err.status().is_some_and(is_fatal_status) {
                    return Err(err);
                }
                last_error = Some(err);
                if !retryable {
                    // 404 and other non-retryable answers move on to the fallback path.
                    break;
                }
                let Some(delay) = self.retry.delays.get(attempt) else {
                    break;
                };
                if !self.sleeper.sleep(*delay, cancel) {
                    return Err(TransportError::Cancelled);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::Network {
            endpoint: self.base_url.clone(),
            message: "no attempt was made".to_string(),
        }))
    }
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
    let inner = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default();
    if err.is_timeout() {
        "request timed out; raise timeout_seconds for this tool server if it is slow".to_string()
    } else if err.is_connect() {
        format!("connection failed: {inner}")
    } else if inner.is_empty() {
        err.to_string()
    } else {
        format!("{err}: {inner}")
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}
