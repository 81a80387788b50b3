mod config;

pub use config::{
    AgentConfig, AppConfig, LlmConfig, PermissionAction, PermissionRule, PermissionsConfig,
    RuleMatch, ToolServerConfig, home_dir, merge_json_value, read_settings_file,
    write_settings_file,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Environment variable that disables every permission prompt for the process.
pub const SKIP_PERMISSIONS_ENV: &str = "KEEL_SKIP_PERMISSIONS";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".keel")
}

// ── Conversation history ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolResult => "tool-result",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the conversation history.
///
/// `payload` carries structured data next to the rendered `content`; for
/// `tool-result` messages it holds the originating request and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            payload: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            payload: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            payload: None,
        }
    }

    pub fn tool_result(content: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            role: Role::ToolResult,
            content: content.into(),
            payload: Some(payload),
        }
    }
}

// ── Streaming ─────────────────────────────────────────────────────────

/// A single chunk emitted while a turn is in progress.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A content text delta from the provider.
    ContentDelta(String),
    /// A tool call was handed to the bridge.
    ToolCallStart { server: String, tool_name: String },
    /// The bridge returned for the current tool call.
    ToolCallEnd {
        server: String,
        tool_name: String,
        duration_ms: u64,
        success: bool,
        summary: String,
    },
    /// A patch block was detected and staged as the pending patch.
    PatchProposed { target_files: Vec<String> },
    /// The follow-up cycle cap was reached; the last output is final.
    CycleCapReached { cycles: u32 },
    /// The provider finished one streamed response.
    Done,
}

/// Callback type for receiving streaming chunks.
/// Uses `Arc<dyn Fn>` so it can be cloned across the cycles of a turn.
pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

pub fn noop_stream_callback() -> StreamCallback {
    Arc::new(|_| {})
}

// ── Cancellation ──────────────────────────────────────────────────────

/// Cooperative cancellation flag shared between a turn and its caller.
///
/// Checked at each suspension point: every stream line read, every retry
/// sleep slice, and before a tool call is dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps on the current thread in 50 ms slices. Returns `false` if
    /// cancelled before `delay` elapsed.
    pub fn sleep(&self, delay: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let mut remaining = delay;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return false;
            }
            let slice = remaining.min(SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !self.is_cancelled()
    }
}

// ── Token estimation ──────────────────────────────────────────────────

pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;
}

/// Length-based heuristic: one token per `chars_per_token` characters.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    pub chars_per_token: u64,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u64 {
        (text.chars().count() as u64) / self.chars_per_token.max(1)
    }
}

// ── Turn metrics ──────────────────────────────────────────────────────

/// Counters for the active session. Only ever incremented; `reset` is the
/// single way back to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnMetrics {
    pub turns: u64,
    pub follow_up_cycles: u64,
    pub tool_calls: u64,
    pub prompt_tokens_estimate: u64,
    pub completion_tokens_estimate: u64,
    pub total_duration_ms: u64,
    pub last_turn_duration_ms: u64,
}

impl TurnMetrics {
    pub fn record_prompt(&mut self, tokens: u64) {
        self.prompt_tokens_estimate = self.prompt_tokens_estimate.saturating_add(tokens);
    }

    pub fn record_completion(&mut self, tokens: u64) {
        self.completion_tokens_estimate = self.completion_tokens_estimate.saturating_add(tokens);
    }

    pub fn record_follow_up(&mut self) {
        self.follow_up_cycles = self.follow_up_cycles.saturating_add(1);
    }

    pub fn record_tool_call(&mut self) {
        self.tool_calls = self.tool_calls.saturating_add(1);
    }

    pub fn record_turn(&mut self, duration_ms: u64) {
        self.turns = self.turns.saturating_add(1);
        self.last_turn_duration_ms = duration_ms;
        self.total_duration_ms = self.total_duration_ms.saturating_add(duration_ms);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Turn state machine ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnState {
    Idle,
    Streaming,
    ToolBridging,
    Error,
}

pub fn is_valid_turn_transition(from: TurnState, to: TurnState) -> bool {
    if from == to {
        return true;
    }
    match from {
        TurnState::Idle => matches!(to, TurnState::Streaming | TurnState::Error),
        TurnState::Streaming => matches!(
            to,
            TurnState::ToolBridging | TurnState::Idle | TurnState::Error
        ),
        TurnState::ToolBridging => matches!(
            to,
            TurnState::Streaming | TurnState::Idle | TurnState::Error
        ),
        TurnState::Error => matches!(to, TurnState::Idle),
    }
}

// ── Interactive confirmation ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub title: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmDecision {
    Approved,
    Rejected,
    Cancelled,
}

/// Yes/no prompt surfaced to the user. Blocks until answered or cancelled.
pub trait ConfirmationSurface: Send + Sync {
    fn confirm(&self, request: &ConfirmRequest) -> ConfirmDecision;
}

/// Non-interactive surface: every confirmation is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoReject;

impl ConfirmationSurface for AutoReject {
    fn confirm(&self, _request: &ConfirmRequest) -> ConfirmDecision {
        ConfirmDecision::Rejected
    }
}

// ── Session snapshot ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub history: Vec<ChatMessage>,
    pub metrics: TurnMetrics,
    #[serde(default)]
    pub pending_patch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_as_kebab_case() {
        let msg = ChatMessage::tool_result("ok", serde_json::json!({"server": "fs"}));
        let encoded = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(encoded["role"], "tool-result");
        let plain = serde_json::to_value(ChatMessage::user("hi")).expect("serialize");
        assert!(plain.get("payload").is_none());
    }

    #[test]
    fn char_ratio_estimator_divides_by_four() {
        let estimator = CharRatioEstimator::default();
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abc"), 0);
        assert_eq!(estimator.estimate("abcdefgh"), 2);
        assert_eq!(estimator.estimate("ééééé"), 1);
    }

    #[test]
    fn metrics_accumulate_until_reset() {
        let mut metrics = TurnMetrics::default();
        metrics.record_turn(120);
        metrics.record_turn(30);
        metrics.record_prompt(10);
        metrics.record_completion(4);
        metrics.record_tool_call();
        assert_eq!(metrics.turns, 2);
        assert_eq!(metrics.total_duration_ms, 150);
        assert_eq!(metrics.last_turn_duration_ms, 30);
        metrics.reset();
        assert_eq!(metrics, TurnMetrics::default());
    }

    #[test]
    fn turn_transitions_follow_state_machine() {
        use TurnState::*;
        assert!(is_valid_turn_transition(Idle, Streaming));
        assert!(is_valid_turn_transition(Streaming, ToolBridging));
        assert!(is_valid_turn_transition(ToolBridging, Streaming));
        assert!(is_valid_turn_transition(Streaming, Idle));
        assert!(is_valid_turn_transition(ToolBridging, Error));
        assert!(is_valid_turn_transition(Error, Idle));
        assert!(!is_valid_turn_transition(Idle, ToolBridging));
        assert!(!is_valid_turn_transition(Error, Streaming));
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn sleep_returns_early_once_cancelled() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(1)));
        token.cancel();
        let started = std::time::Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
