//! Test doubles shared by keel integration tests.

use anyhow::{Context, Result, anyhow};
use keel_core::{
    CancellationToken, ChatMessage, ConfirmDecision, ConfirmRequest, ConfirmationSurface,
    StreamCallback, StreamChunk,
};
use keel_llm::{ChatProvider, ProviderError};
use keel_mcp::{Sleeper, ToolServer, TransportError};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// One scripted provider answer.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(String),
}

/// Chat provider that replays canned answers in small deltas.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    repeat: Option<String>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    chunk_chars: usize,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_replies(replies.into_iter().map(|r| ScriptedReply::Text(r.into())))
    }

    pub fn from_replies(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            chunk_chars: 8,
        }
    }

    /// Answers every request with the same text, forever.
    pub fn repeating(text: impl Into<String>) -> Self {
        let mut provider = Self::from_replies(Vec::new());
        provider.repeat = Some(text.into());
        provider
    }

    /// Histories received, one per call.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

impl ChatProvider for ScriptedProvider {
    fn stream_chat(
        &self,
        history: &[ChatMessage],
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(history.to_vec());
        }
        let next = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .or_else(|| self.repeat.clone().map(ScriptedReply::Text));
        let text = match next {
            Some(ScriptedReply::Text(text)) => text,
            Some(ScriptedReply::Error(message)) => return Err(ProviderError::Network(message)),
            None => return Err(ProviderError::Stream("script exhausted".to_string())),
        };
        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(self.chunk_chars.max(1)) {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            cb(StreamChunk::ContentDelta(piece.iter().collect()));
        }
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        cb(StreamChunk::Done);
        Ok(text)
    }
}

/// Tool server answering from a script and recording every call.
pub struct ScriptedToolServer {
    id: String,
    responses: Mutex<VecDeque<Result<Value, TransportError>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedToolServer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, response: Result<Value, TransportError>) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response);
        }
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ToolServer for ScriptedToolServer {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(
        &self,
        tool_name: &str,
        input: &Value,
        _cancel: &CancellationToken,
    ) -> Result<Value, TransportError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((tool_name.to_string(), input.clone()));
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front())
            .unwrap_or_else(|| Ok(json!({"content": format!("{tool_name} ok")})))
    }
}

/// Sleeper that records requested delays without waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<u64>>,
}

impl RecordingSleeper {
    pub fn waits_ms(&self) -> Vec<u64> {
        self.waits.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(delay.as_millis() as u64);
        }
        !cancel.is_cancelled()
    }
}

/// Confirmation surface answering from a script; `Rejected` once exhausted.
#[derive(Default)]
pub struct ScriptedConfirmation {
    answers: Mutex<VecDeque<ConfirmDecision>>,
    asked: Mutex<Vec<ConfirmRequest>>,
}

impl ScriptedConfirmation {
    pub fn new(answers: impl IntoIterator<Item = ConfirmDecision>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<ConfirmRequest> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl ConfirmationSurface for ScriptedConfirmation {
    fn confirm(&self, request: &ConfirmRequest) -> ConfirmDecision {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(request.clone());
        }
        self.answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front())
            .unwrap_or(ConfirmDecision::Rejected)
    }
}

/// A fenced tool-call block as a model would emit it.
pub fn tool_call_block(server: &str, name: &str, input: Value) -> String {
    let payload = json!({"tool_call": {"server": server, "name": name, "input": input}});
    format!("```tool_call\n{payload}\n```")
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn git(workspace: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .context("git command failed")?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// A committed git repository holding `files`, or `None` without git.
pub fn git_workspace(files: &[(&str, &str)]) -> Result<Option<TempDir>> {
    if !git_available() {
        return Ok(None);
    }
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    git(root, &["init", "-q"])?;
    git(root, &["config", "user.email", "keel@example.test"])?;
    git(root, &["config", "user.name", "Keel"])?;
    for (name, content) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    fs::write(root.join(".gitignore"), ".keel/\n")?;
    git(root, &["add", "."])?;
    git(root, &["commit", "-q", "-m", "init"])?;
    Ok(Some(dir))
}

/// Unified diff turning `name` into `after`, computed by git and leaving
/// the working tree untouched.
pub fn diff_for(workspace: &Path, name: &str, after: &str) -> Result<String> {
    let path = workspace.join(name);
    let before = fs::read_to_string(&path)?;
    fs::write(&path, after)?;
    let diff = git(workspace, &["diff", "--", name]);
    fs::write(&path, before)?;
    diff
}
