//! Tool-call bridge: turns a model-issued tool-call block into an
//! authorized, dispatched and retried call against a registered tool server.

mod protocol;
mod transport;

pub use protocol::{TOOL_CALL_INFO, ToolCallRequest, ToolCallScan, scan_tool_call};
pub use transport::{
    HttpToolServer, RetryPolicy, Sleeper, ThreadSleeper, TransportError, is_fatal_status,
    should_retry_status,
};

use anyhow::Result;
use keel_core::{
    AppConfig, CancellationToken, ChatMessage, ConfirmDecision, ConfirmRequest,
    ConfirmationSurface, PermissionAction, ToolServerConfig,
};
use keel_observe::{ObserveEvent, Observer};
use keel_policy::{MCP_TOOL, PermissionEngine, PermissionQuery};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Maximum characters of tool output kept in history.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 25_000;

/// A capability that runs named tools.
pub trait ToolServer: Send + Sync {
    fn id(&self) -> &str;

    fn invoke(
        &self,
        tool_name: &str,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, TransportError>;
}

/// Tool servers keyed by id.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    servers: BTreeMap<String, Arc<dyn ToolServer>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP servers for every enabled entry; disabled entries are skipped.
    pub fn from_configs(configs: &[ToolServerConfig], observer: &Arc<Observer>) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let server = HttpToolServer::new(config)?.with_observer(observer.clone());
            registry.register(Arc::new(server));
        }
        Ok(registry)
    }

    /// Servers from the layered `tool_servers` settings of `workspace`.
    pub fn load(workspace: &Path, observer: &Arc<Observer>) -> Result<Self> {
        Self::from_configs(&AppConfig::load_tool_servers(workspace)?, observer)
    }

    /// Registers `server`, replacing any server with the same id.
    pub fn register(&mut self, server: Arc<dyn ToolServer>) {
        self.servers.insert(server.id().to_string(), server);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ToolServer>> {
        self.servers.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The request lacks a server or tool name. Nothing was dispatched.
    #[error("malformed tool call: {0}")]
    Protocol(String),
    #[error("tool call cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    /// A permission rule denied the call.
    Denied,
    /// The user answered no (or dismissed) the confirmation prompt.
    Declined,
    Failed(TransportError),
}

impl ToolOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Denied => "permission_denied",
            Self::Declined => "declined",
            Self::Failed(_) => "error",
        }
    }
}

/// One finished bridge invocation, ready to become a `tool-result` message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub request: ToolCallRequest,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}

impl ToolCallResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success(_))
    }

    /// Text placed in history for the model to read.
    pub fn content(&self) -> String {
        let raw = match &self.outcome {
            ToolOutcome::Success(value) => format_tool_output(value, true),
            ToolOutcome::Denied => format!(
                "PermissionDenied: tool '{}' on server '{}' is denied by a permission rule",
                self.request.name, self.request.server
            ),
            ToolOutcome::Declined => format!(
                "Error: the user declined tool call '{}' on server '{}'",
                self.request.name, self.request.server
            ),
            ToolOutcome::Failed(err) => format_tool_output(&json!({ "error": err.to_string() }), false),
        };
        truncate_output(&raw, MAX_TOOL_OUTPUT_CHARS)
    }

    /// First line of the content, for progress display.
    pub fn summary(&self) -> String {
        let content = self.content();
        let first = content.lines().next().unwrap_or_default();
        truncate_output(first, 120)
    }

    pub fn to_message(&self) -> ChatMessage {
        let mut payload = json!({
            "server": self.request.server,
            "name": self.request.name,
            "status": self.outcome.label(),
            "duration_ms": self.duration_ms,
        });
        if let ToolOutcome::Success(value) = &self.outcome {
            payload["result"] = value.clone();
        }
        ChatMessage::tool_result(self.content(), payload)
    }
}

/// Validates, authorizes and dispatches tool calls.
pub struct ToolCallBridge {
    registry: ToolRegistry,
    permissions: Arc<PermissionEngine>,
    confirm: Arc<dyn ConfirmationSurface>,
    observer: Arc<Observer>,
}

impl ToolCallBridge {
    pub fn new(
        registry: ToolRegistry,
        permissions: Arc<PermissionEngine>,
        confirm: Arc<dyn ConfirmationSurface>,
    ) -> Self {
        Self {
            registry,
            permissions,
            confirm,
            observer: Arc::new(Observer::silent()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs one request. Permission refusals and transport failures come
    /// back as an `Ok` result so the model can react to them.
    pub fn invoke(
        &self,
        request: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, BridgeError> {
        if request.server.trim().is_empty() {
            return Err(BridgeError::Protocol("missing server".to_string()));
        }
        if request.name.trim().is_empty() {
            return Err(BridgeError::Protocol("missing tool name".to_string()));
        }
        let started = Instant::now();
        let finish = |outcome: ToolOutcome| {
            let result = ToolCallResult {
                request: request.clone(),
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            self.observer.record(&ObserveEvent::ToolCallFinished {
                server: request.server.clone(),
                tool_name: request.name.clone(),
                outcome: result.outcome.label().to_string(),
                duration_ms: result.duration_ms,
            });
            result
        };

        let query = PermissionQuery::tool(MCP_TOOL).with_command(request.name.clone());
        match self.permissions.check(&query) {
            PermissionAction::Allow => {}
            PermissionAction::Deny => return Ok(finish(ToolOutcome::Denied)),
            PermissionAction::Confirm => {
                let prompt = ConfirmRequest {
                    title: format!("Run tool '{}' on server '{}'?", request.name, request.server),
                    detail: serde_json::to_string_pretty(&request.input)
                        .unwrap_or_else(|_| "{}".to_string()),
                };
                match self.confirm.confirm(&prompt) {
                    ConfirmDecision::Approved => {}
                    ConfirmDecision::Rejected | ConfirmDecision::Cancelled => {
                        return Ok(finish(ToolOutcome::Declined));
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let Some(server) = self.registry.get(&request.server) else {
            return Ok(finish(ToolOutcome::Failed(TransportError::UnknownServer(
                request.server.clone(),
            ))));
        };
        self.observer.record(&ObserveEvent::ToolCallDispatched {
            server: request.server.clone(),
            tool_name: request.name.clone(),
        });
        match server.invoke(&request.name, &request.input_value(), cancel) {
            Ok(value) => Ok(finish(ToolOutcome::Success(value))),
            Err(TransportError::Cancelled) => Err(BridgeError::Cancelled),
            Err(err) => Ok(finish(ToolOutcome::Failed(err))),
        }
    }
}

/// Extracts readable text from common result shapes, else pretty JSON.
pub fn format_tool_output(output: &Value, success: bool) -> String {
    if !success {
        if let Some(err) = output.get("error").and_then(|v| v.as_str()) {
            return format!("Error: {err}");
        }
        return format!("Error: {output}");
    }
    if let Some(s) = output.as_str() {
        return s.to_string();
    }
    if let Some(content) = output.get("content").and_then(|v| v.as_str()) {
        return content.to_string();
    }
    if let Some(text) = output.get("output").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string())
}

pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    format!("{kept}\n\n[output truncated: {total} chars total, showing first {max_chars}]")
}
