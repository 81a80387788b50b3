//! Turn orchestrator: owns the conversation, streams provider output, routes
//! tool-call blocks through the bridge and stages proposed patches.

mod history;
mod pending;

pub use history::CompactionReport;

use anyhow::Result;
use chrono::Utc;
use keel_core::{
    AgentConfig, AppConfig, AutoReject, CancellationToken, CharRatioEstimator, ChatMessage,
    ConfirmationSurface, SessionSnapshot, StreamCallback, StreamChunk, TokenEstimator,
    TurnMetrics, TurnState, is_valid_turn_transition,
};
use keel_diff::{PatchEngine, PatchError, extract_patch_block};
use keel_errors::{EnhancedError, ErrorType, errors};
use keel_llm::{ChatProvider, OpenAiCompatibleClient, ProviderError};
use keel_mcp::{BridgeError, ToolCallBridge, ToolCallScan, ToolRegistry, scan_tool_call};
use keel_observe::{ObserveEvent, Observer};
use keel_policy::PermissionEngine;
use keel_store::SessionStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("chat provider failed: {0}")]
    Provider(ProviderError),
    #[error("turn cancelled")]
    Cancelled,
    #[error("invalid turn transition {from:?} -> {to:?}")]
    InvalidTransition { from: TurnState, to: TurnState },
    #[error("there is no pending patch")]
    NoPendingPatch,
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("permission denied: {subject}")]
    PermissionDenied { subject: String },
    #[error("{0} was not confirmed")]
    Rejected(String),
}

impl From<ProviderError> for TurnError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => Self::Cancelled,
            other => Self::Provider(other),
        }
    }
}

impl TurnError {
    pub fn to_enhanced(&self) -> EnhancedError {
        match self {
            Self::Provider(err) => err.to_enhanced(),
            Self::Patch(err) => err.to_enhanced(),
            Self::PermissionDenied { subject } => errors::permission_denied(subject),
            Self::Cancelled => {
                EnhancedError::new("Cancelled", self.to_string(), ErrorType::Cancelled)
            }
            Self::Rejected(what) => EnhancedError::new(
                "Not Confirmed",
                format!("{what} was declined at the confirmation prompt."),
                ErrorType::Permission,
            ),
            Self::NoPendingPatch => EnhancedError::new(
                "No Pending Patch",
                "The assistant has not proposed a patch since the last commit or discard.",
                ErrorType::Patch,
            )
            .with_suggestion("Ask for a change framed by *** Begin Patch / *** End Patch"),
            Self::InvalidTransition { .. } => {
                EnhancedError::new("Internal Error", self.to_string(), ErrorType::Unknown)
            }
        }
    }
}

/// What a settled turn produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Final assistant output of the turn.
    pub text: String,
    pub tool_calls: u32,
    pub follow_ups: u32,
    pub cycle_cap_reached: bool,
    /// Target files of a patch proposed during this turn.
    pub proposed_patch: Option<Vec<String>>,
}

/// State as of the last completed tool cycle; a cancelled turn rolls back
/// to it.
struct Checkpoint {
    history_len: usize,
    pending_patch: Option<String>,
}

pub struct Orchestrator {
    workspace: PathBuf,
    session_id: Uuid,
    cfg: AgentConfig,
    provider: Arc<dyn ChatProvider>,
    tools: ToolRegistry,
    permissions: Arc<PermissionEngine>,
    confirm: Arc<dyn ConfirmationSurface>,
    patches: PatchEngine,
    estimator: Box<dyn TokenEstimator>,
    observer: Arc<Observer>,
    store: Option<SessionStore>,
    history: Vec<ChatMessage>,
    metrics: TurnMetrics,
    pending_patch: Option<String>,
    state: TurnState,
}

impl Orchestrator {
    /// Fully wired orchestrator for `workspace` from layered settings.
    pub fn new(workspace: &Path) -> Result<Self> {
        let cfg = AppConfig::load(workspace)?;
        let observer = Arc::new(Observer::new(workspace)?);
        Self::from_config(workspace, cfg, observer)
    }

    pub fn from_config(workspace: &Path, cfg: AppConfig, observer: Arc<Observer>) -> Result<Self> {
        let provider = Arc::new(OpenAiCompatibleClient::new(cfg.llm.clone())?);
        let tools = ToolRegistry::load(workspace, &observer)?;
        let permissions =
            Arc::new(PermissionEngine::new(workspace).with_observer(observer.clone()));
        let patches = PatchEngine::new(workspace).with_observer(observer.clone());
        let store = if cfg.agent.persist_sessions {
            Some(SessionStore::new(workspace)?)
        } else {
            None
        };
        let mut orchestrator = Self::new_with_provider(workspace, cfg.agent, provider)
            .with_tool_registry(tools)
            .with_permissions(permissions)
            .with_patch_engine(patches)
            .with_observer(observer);
        orchestrator.store = store;
        Ok(orchestrator)
    }

    /// Orchestrator with default collaborators around `provider`: no tool
    /// servers, project permissions, git patches, non-interactive prompts.
    pub fn new_with_provider(
        workspace: &Path,
        cfg: AgentConfig,
        provider: Arc<dyn ChatProvider>,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            session_id: Uuid::now_v7(),
            cfg,
            provider,
            tools: ToolRegistry::new(),
            permissions: Arc::new(PermissionEngine::new(workspace)),
            confirm: Arc::new(AutoReject),
            patches: PatchEngine::new(workspace),
            estimator: Box::new(CharRatioEstimator::default()),
            observer: Arc::new(Observer::silent()),
            store: None,
            history: Vec::new(),
            metrics: TurnMetrics::default(),
            pending_patch: None,
            state: TurnState::Idle,
        }
    }

    pub fn with_tool_registry(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<PermissionEngine>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_confirmation(mut self, confirm: Arc<dyn ConfirmationSurface>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_patch_engine(mut self, patches: PatchEngine) -> Self {
        self.patches = patches;
        self
    }

    pub fn with_estimator(mut self, estimator: Box<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Snapshots are saved here after every settled turn when
    /// `persist_sessions` is on.
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn metrics(&self) -> &TurnMetrics {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn patch_engine(&self) -> &PatchEngine {
        &self.patches
    }

    /// Runs one user instruction to a settled response.
    ///
    /// Deltas go to `cb` as they arrive. A single well-formed tool-call block
    /// is bridged and answered with a follow-up turn, up to
    /// `max_tool_cycles` times. A patch block becomes the pending patch.
    pub fn respond(
        &mut self,
        user_text: &str,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        if self.state == TurnState::Error {
            self.transition(TurnState::Idle)?;
        }
        if self.state != TurnState::Idle {
            return Err(TurnError::InvalidTransition {
                from: self.state,
                to: TurnState::Streaming,
            });
        }

        let started = Instant::now();
        let turn = self.metrics.turns + 1;
        self.observer.record(&ObserveEvent::TurnStarted {
            turn,
            chars: user_text.chars().count(),
        });
        self.history.push(ChatMessage::user(user_text));
        self.metrics.record_prompt(self.estimator.estimate(user_text));
        let mut settled = Checkpoint {
            history_len: self.history.len(),
            pending_patch: self.pending_patch.clone(),
        };

        match self.run_cycles(&cb, cancel, &mut settled) {
            Ok(outcome) => {
                self.transition(TurnState::Idle)?;
                let duration_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_turn(duration_ms);
                self.observer.record(&ObserveEvent::TurnCompleted {
                    turn,
                    cycles: outcome.follow_ups,
                    duration_ms,
                });
                self.persist();
                Ok(outcome)
            }
            Err(TurnError::Cancelled) => {
                self.history.truncate(settled.history_len);
                self.pending_patch = settled.pending_patch;
                self.transition(TurnState::Idle)?;
                self.observer.verbose_log(&format!("turn {turn} cancelled"));
                Err(TurnError::Cancelled)
            }
            Err(err) => {
                self.transition(TurnState::Error)?;
                self.observer.warn_log(&format!("turn {turn} failed: {err}"));
                self.persist();
                Err(err)
            }
        }
    }

    fn run_cycles(
        &mut self,
        cb: &StreamCallback,
        cancel: &CancellationToken,
        settled: &mut Checkpoint,
    ) -> Result<TurnOutcome, TurnError> {
        let mut outcome = TurnOutcome {
            text: String::new(),
            tool_calls: 0,
            follow_ups: 0,
            cycle_cap_reached: false,
            proposed_patch: None,
        };
        loop {
            self.transition(TurnState::Streaming)?;
            let text = self.provider.stream_chat(&self.request_history(), cb.clone(), cancel)?;
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            self.metrics.record_completion(self.estimator.estimate(&text));
            self.history.push(ChatMessage::assistant(text.clone()));
            outcome.text = text.clone();

            if let Some(block) = extract_patch_block(&text) {
                outcome.proposed_patch = Some(self.stage_patch(block, cb));
            }

            let request = match scan_tool_call(&text) {
                ToolCallScan::Found(request) => request,
                ToolCallScan::Absent => return Ok(outcome),
                ToolCallScan::Malformed(reason) => {
                    self.observer.record(&ObserveEvent::ToolCallMalformed { reason });
                    return Ok(outcome);
                }
            };
            if !self.cfg.bridge_enabled {
                return Ok(outcome);
            }
            if outcome.follow_ups >= self.cfg.max_tool_cycles {
                outcome.cycle_cap_reached = true;
                cb(StreamChunk::CycleCapReached {
                    cycles: outcome.follow_ups,
                });
                return Ok(outcome);
            }

            self.transition(TurnState::ToolBridging)?;
            cb(StreamChunk::ToolCallStart {
                server: request.server.clone(),
                tool_name: request.name.clone(),
            });
            let bridge = ToolCallBridge::new(
                self.tools.clone(),
                self.permissions.clone(),
                self.confirm.clone(),
            )
            .with_observer(self.observer.clone());
            let result = match bridge.invoke(&request, cancel) {
                Ok(result) => result,
                Err(BridgeError::Cancelled) => return Err(TurnError::Cancelled),
                Err(BridgeError::Protocol(reason)) => {
                    self.observer.record(&ObserveEvent::ToolCallMalformed { reason });
                    return Ok(outcome);
                }
            };
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            cb(StreamChunk::ToolCallEnd {
                server: result.request.server.clone(),
                tool_name: result.request.name.clone(),
                duration_ms: result.duration_ms,
                success: result.is_success(),
                summary: result.summary(),
            });
            self.metrics.record_tool_call();
            self.history.push(result.to_message());
            outcome.tool_calls += 1;
            outcome.follow_ups += 1;
            self.metrics.record_follow_up();
            settled.history_len = self.history.len();
            settled.pending_patch = self.pending_patch.clone();
        }
    }

    fn request_history(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if let Some(prompt) = self.cfg.system_prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages
    }

    fn stage_patch(&mut self, block: String, cb: &StreamCallback) -> Vec<String> {
        let files = self.propose_patch(block);
        cb(StreamChunk::PatchProposed {
            target_files: files.clone(),
        });
        files
    }

    fn transition(&mut self, to: TurnState) -> Result<(), TurnError> {
        let from = self.state;
        if from == to {
            return Ok(());
        }
        if !is_valid_turn_transition(from, to) {
            return Err(TurnError::InvalidTransition { from, to });
        }
        self.state = to;
        self.observer.record(&ObserveEvent::StateChanged { from, to });
        Ok(())
    }

    /// Truncates history to the last `keep_last` messages behind a system
    /// summary. The latest exchange always survives.
    pub fn compact(&mut self, keep_last: usize) -> CompactionReport {
        let report = history::compact(&mut self.history, keep_last);
        if report.dropped > 0 {
            self.observer.record(&ObserveEvent::HistoryCompacted {
                dropped: report.dropped,
                kept: report.kept,
            });
            self.persist();
        }
        report
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            saved_at: Utc::now(),
            history: self.history.clone(),
            metrics: self.metrics.clone(),
            pending_patch: self.pending_patch.clone(),
        }
    }

    /// Resumes a saved session. Any in-memory conversation is replaced.
    pub fn restore(&mut self, snapshot: SessionSnapshot) {
        self.session_id = snapshot.session_id;
        self.history = snapshot.history;
        self.metrics = snapshot.metrics;
        self.pending_patch = snapshot.pending_patch;
        self.state = TurnState::Idle;
    }

    /// Restores the most recent snapshot from the attached store.
    pub fn resume_latest(&mut self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        match store.load_latest()? {
            Some(snapshot) => {
                self.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn persist(&self) {
        if !self.cfg.persist_sessions {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save_snapshot(&self.snapshot()) {
            self.observer
                .warn_log(&format!("failed to save session snapshot: {err:#}"));
        }
    }
}
