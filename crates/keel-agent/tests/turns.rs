use keel_agent::{Orchestrator, TurnError};
use keel_core::{
    AgentConfig, CancellationToken, ConfirmDecision, Role, StreamCallback, StreamChunk, TurnState,
    noop_stream_callback, write_settings_file,
};
use keel_mcp::{ToolRegistry, ToolServer};
use keel_policy::PermissionEngine;
use keel_store::SessionStore;
use keel_testkit::{
    ScriptedConfirmation, ScriptedProvider, ScriptedReply, ScriptedToolServer, tool_call_block,
};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn recorder() -> (StreamCallback, Arc<Mutex<Vec<StreamChunk>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cb: StreamCallback = Arc::new(move |chunk| sink.lock().expect("chunks").push(chunk));
    (cb, seen)
}

fn project_permissions(workspace: &Path, permissions: Value) -> Arc<PermissionEngine> {
    let path = workspace.join(".keel").join("settings.json");
    write_settings_file(&path, &json!({ "permissions": permissions })).expect("write settings");
    Arc::new(PermissionEngine::with_layers(vec![path.clone()], path))
}

struct Harness {
    dir: TempDir,
    provider: Arc<ScriptedProvider>,
    server: Arc<ScriptedToolServer>,
    orchestrator: Orchestrator,
}

fn harness(provider: ScriptedProvider, cfg: AgentConfig) -> Harness {
    harness_with(provider, cfg, ScriptedToolServer::new("git"), json!({}))
}

fn harness_with(
    provider: ScriptedProvider,
    cfg: AgentConfig,
    server: ScriptedToolServer,
    permissions: Value,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(provider);
    let server = Arc::new(server);
    let mut tools = ToolRegistry::new();
    tools.register(server.clone() as Arc<dyn ToolServer>);
    let orchestrator = Orchestrator::new_with_provider(dir.path(), cfg, provider.clone())
        .with_tool_registry(tools)
        .with_permissions(project_permissions(dir.path(), permissions));
    Harness {
        dir,
        provider,
        server,
        orchestrator,
    }
}

fn no_persist() -> AgentConfig {
    AgentConfig {
        persist_sessions: false,
        ..AgentConfig::default()
    }
}

#[test]
fn plain_reply_streams_and_settles_idle() {
    let mut h = harness(ScriptedProvider::new(["hello there, how can I help?"]), no_persist());
    let (cb, seen) = recorder();
    let outcome = h
        .orchestrator
        .respond("hi", cb, &CancellationToken::new())
        .expect("turn");

    assert_eq!(outcome.text, "hello there, how can I help?");
    assert_eq!(outcome.tool_calls, 0);
    assert!(!outcome.cycle_cap_reached);
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.history().len(), 2);
    assert_eq!(h.orchestrator.metrics().turns, 1);

    let chunks = seen.lock().expect("chunks");
    let streamed: String = chunks
        .iter()
        .filter_map(|c| match c {
            StreamChunk::ContentDelta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, outcome.text);
    assert_eq!(chunks.last(), Some(&StreamChunk::Done));
}

#[test]
fn tool_call_result_feeds_a_follow_up_turn() {
    let call = format!(
        "Let me look.\n{}",
        tool_call_block("git", "status", json!({"short": true}))
    );
    let mut h = harness(ScriptedProvider::new([call, "The tree is clean.".to_string()]), no_persist());
    let (cb, seen) = recorder();
    let outcome = h
        .orchestrator
        .respond("is my tree clean?", cb, &CancellationToken::new())
        .expect("turn");

    assert_eq!(outcome.text, "The tree is clean.");
    assert_eq!(outcome.tool_calls, 1);
    assert_eq!(outcome.follow_ups, 1);
    assert_eq!(h.server.calls(), vec![("status".to_string(), json!({"short": true}))]);

    let roles: Vec<Role> = h.orchestrator.history().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]);
    assert_eq!(h.orchestrator.history()[2].content, "status ok");

    let follow_up = &h.provider.requests()[1];
    assert_eq!(follow_up.last().map(|m| m.role), Some(Role::ToolResult));

    let chunks = seen.lock().expect("chunks");
    assert!(chunks.contains(&StreamChunk::ToolCallStart {
        server: "git".to_string(),
        tool_name: "status".to_string(),
    }));
    assert!(chunks.iter().any(|c| matches!(
        c,
        StreamChunk::ToolCallEnd { success: true, summary, .. } if summary == "status ok"
    )));
    assert_eq!(h.orchestrator.metrics().tool_calls, 1);
    assert_eq!(h.orchestrator.metrics().follow_up_cycles, 1);
}

#[test]
fn perpetual_tool_calls_stop_at_the_cycle_cap() {
    let block = tool_call_block("git", "log", json!({}));
    let mut h = harness(ScriptedProvider::repeating(block), no_persist());
    let (cb, seen) = recorder();
    let outcome = h
        .orchestrator
        .respond("loop forever", cb, &CancellationToken::new())
        .expect("turn");

    assert!(outcome.cycle_cap_reached);
    assert_eq!(outcome.follow_ups, 3);
    assert_eq!(outcome.tool_calls, 3);
    assert_eq!(h.provider.calls(), 4);
    assert_eq!(h.server.calls().len(), 3);
    assert!(
        seen.lock()
            .expect("chunks")
            .contains(&StreamChunk::CycleCapReached { cycles: 3 })
    );
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
}

#[test]
fn zero_cycle_cap_never_bridges() {
    let cfg = AgentConfig {
        max_tool_cycles: 0,
        ..no_persist()
    };
    let mut h = harness(ScriptedProvider::repeating(tool_call_block("git", "log", json!({}))), cfg);
    let outcome = h
        .orchestrator
        .respond("go", noop_stream_callback(), &CancellationToken::new())
        .expect("turn");
    assert!(outcome.cycle_cap_reached);
    assert_eq!(h.provider.calls(), 1);
    assert!(h.server.calls().is_empty());
}

#[test]
fn malformed_or_duplicate_blocks_are_kept_as_prose() {
    let two = format!(
        "first\n{}\nsecond\n{}",
        tool_call_block("git", "status", json!({})),
        tool_call_block("git", "log", json!({}))
    );
    let broken = "```tool_call\n{\"tool_call\": {\"server\": \"git\",\n```".to_string();
    let extra = "```tool_call\n{\"tool_call\": {\"server\": \"git\", \"name\": \"log\"}, \"why\": 1}\n```"
        .to_string();

    for reply in [two, broken, extra] {
        let mut h = harness(ScriptedProvider::new([reply.clone()]), no_persist());
        let outcome = h
            .orchestrator
            .respond("go", noop_stream_callback(), &CancellationToken::new())
            .expect("turn");
        assert_eq!(outcome.text, reply);
        assert_eq!(outcome.tool_calls, 0);
        assert_eq!(h.provider.calls(), 1);
        assert!(h.server.calls().is_empty());
        assert_eq!(
            h.orchestrator.history().last().map(|m| m.content.clone()),
            Some(reply)
        );
    }
}

#[test]
fn missing_tool_name_counts_as_absent() {
    let reply = "```tool_call\n{\"tool_call\": {\"server\": \"git\"}}\n```".to_string();
    let mut h = harness(ScriptedProvider::new([reply]), no_persist());
    let outcome = h
        .orchestrator
        .respond("go", noop_stream_callback(), &CancellationToken::new())
        .expect("turn");
    assert_eq!(outcome.tool_calls, 0);
    assert!(h.server.calls().is_empty());
    assert_eq!(h.orchestrator.history().len(), 2);
}

#[test]
fn disabled_bridge_leaves_blocks_alone() {
    let cfg = AgentConfig {
        bridge_enabled: false,
        ..no_persist()
    };
    let mut h = harness(ScriptedProvider::new([tool_call_block("git", "status", json!({}))]), cfg);
    let outcome = h
        .orchestrator
        .respond("go", noop_stream_callback(), &CancellationToken::new())
        .expect("turn");
    assert_eq!(outcome.tool_calls, 0);
    assert!(h.server.calls().is_empty());
}

#[test]
fn denied_tool_call_becomes_a_tool_result() {
    let mut h = harness_with(
        ScriptedProvider::new([
            tool_call_block("git", "rm", json!({"path": "src"})),
            "Understood, I will not delete it.".to_string(),
        ]),
        no_persist(),
        ScriptedToolServer::new("git"),
        json!({"rules": [{"match": {"tool": "mcp", "commandPattern": "^rm$"}, "action": "deny"}]}),
    );
    let outcome = h
        .orchestrator
        .respond("delete src", noop_stream_callback(), &CancellationToken::new())
        .expect("turn");

    assert!(h.server.calls().is_empty());
    assert_eq!(outcome.text, "Understood, I will not delete it.");
    let result = &h.orchestrator.history()[2];
    assert_eq!(result.role, Role::ToolResult);
    assert!(result.content.starts_with("PermissionDenied"));
    assert_eq!(
        result.payload.as_ref().and_then(|p| p["status"].as_str()),
        Some("permission_denied")
    );
}

#[test]
fn declined_confirmation_is_reported_to_the_model() {
    let confirm = Arc::new(ScriptedConfirmation::new([ConfirmDecision::Rejected]));
    let h = harness_with(
        ScriptedProvider::new([
            tool_call_block("git", "push", json!({})),
            "Okay, not pushing.".to_string(),
        ]),
        no_persist(),
        ScriptedToolServer::new("git"),
        json!({"defaults": {"mcp": "confirm"}}),
    );
    let mut orchestrator = h.orchestrator.with_confirmation(confirm.clone());
    orchestrator
        .respond("push it", noop_stream_callback(), &CancellationToken::new())
        .expect("turn");

    assert_eq!(confirm.asked().len(), 1);
    assert!(confirm.asked()[0].title.contains("push"));
    assert!(h.server.calls().is_empty());
    assert!(orchestrator.history()[2].content.contains("declined"));
}

#[test]
fn unknown_server_fails_the_call_not_the_turn() {
    let mut h = harness(
        ScriptedProvider::new([
            tool_call_block("jira", "search", json!({})),
            "That server is not available.".to_string(),
        ]),
        no_persist(),
    );
    let (cb, seen) = recorder();
    let outcome = h
        .orchestrator
        .respond("find tickets", cb, &CancellationToken::new())
        .expect("turn");
    assert_eq!(outcome.tool_calls, 1);
    assert!(
        seen.lock()
            .expect("chunks")
            .iter()
            .any(|c| matches!(c, StreamChunk::ToolCallEnd { success: false, .. }))
    );
    assert!(h.orchestrator.history()[2].content.contains("jira"));
}

#[test]
fn cancelled_turn_keeps_only_the_user_message() {
    let mut h = harness(
        ScriptedProvider::new(["a long answer that will never finish", "second try"]),
        no_persist(),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let cb: StreamCallback = Arc::new(move |chunk| {
        if matches!(chunk, StreamChunk::ContentDelta(_)) {
            trigger.cancel();
        }
    });

    let err = h.orchestrator.respond("explain", cb, &cancel).expect_err("cancelled");
    assert!(matches!(err, TurnError::Cancelled));
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.history().len(), 1);
    assert_eq!(h.orchestrator.history()[0].content, "explain");
    assert_eq!(h.orchestrator.metrics().turns, 0);

    let outcome = h
        .orchestrator
        .respond("again", noop_stream_callback(), &CancellationToken::new())
        .expect("next turn");
    assert_eq!(outcome.text, "second try");
}

#[test]
fn cancelling_during_a_tool_call_discards_the_result() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut h = harness(
        ScriptedProvider::new([tool_call_block("git", "status", json!({})), "unused".to_string()]),
        no_persist(),
    );
    let cb: StreamCallback = Arc::new(move |chunk| {
        if matches!(chunk, StreamChunk::ToolCallStart { .. }) {
            trigger.cancel();
        }
    });
    let err = h.orchestrator.respond("status", cb, &cancel).expect_err("cancelled");
    assert!(matches!(err, TurnError::Cancelled));
    assert!(h.server.calls().is_empty());
    assert_eq!(h.orchestrator.history().len(), 1);
    assert_eq!(h.provider.calls(), 1);
}

#[test]
fn cancelling_a_follow_up_keeps_completed_tool_cycles() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut h = harness(
        ScriptedProvider::new([
            tool_call_block("git", "status", json!({})),
            "the tree is clean and nothing is staged".to_string(),
        ]),
        no_persist(),
    );
    let bridged = Arc::new(Mutex::new(false));
    let cb: StreamCallback = Arc::new(move |chunk| match chunk {
        StreamChunk::ToolCallEnd { .. } => *bridged.lock().expect("flag") = true,
        StreamChunk::ContentDelta(_) if *bridged.lock().expect("flag") => trigger.cancel(),
        _ => {}
    });

    let err = h.orchestrator.respond("status", cb, &cancel).expect_err("cancelled");
    assert!(matches!(err, TurnError::Cancelled));
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.server.calls().len(), 1);
    let roles: Vec<Role> = h.orchestrator.history().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::ToolResult]);
}

#[test]
fn provider_failure_enters_error_then_recovers() {
    let mut h = harness(
        ScriptedProvider::from_replies([
            ScriptedReply::Error("connection reset".to_string()),
            ScriptedReply::Text("back online".to_string()),
        ]),
        no_persist(),
    );
    let err = h
        .orchestrator
        .respond("hello?", noop_stream_callback(), &CancellationToken::new())
        .expect_err("provider error");
    assert!(matches!(err, TurnError::Provider(_)));
    assert_eq!(h.orchestrator.state(), TurnState::Error);

    let outcome = h
        .orchestrator
        .respond("hello again", noop_stream_callback(), &CancellationToken::new())
        .expect("recovered");
    assert_eq!(outcome.text, "back online");
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
}

#[test]
fn system_prompt_is_sent_but_not_stored() {
    let cfg = AgentConfig {
        system_prompt: Some("You are terse.".to_string()),
        ..no_persist()
    };
    let mut h = harness(ScriptedProvider::new(["ok"]), cfg);
    h.orchestrator
        .respond("hi", noop_stream_callback(), &CancellationToken::new())
        .expect("turn");
    let sent = &h.provider.requests()[0];
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(sent[0].content, "You are terse.");
    assert!(h.orchestrator.history().iter().all(|m| m.role != Role::System));
}

#[test]
fn latest_patch_proposal_wins() {
    let first = "Here:\n*** Begin Patch\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-one\n+two\n*** End Patch\n";
    let second = "Better:\n*** Begin Patch\n--- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-x\n+y\n*** End Patch\n";
    let mut h = harness(ScriptedProvider::new([first, second]), no_persist());
    let (cb, seen) = recorder();

    let outcome = h
        .orchestrator
        .respond("change a", cb.clone(), &CancellationToken::new())
        .expect("turn");
    assert_eq!(outcome.proposed_patch, Some(vec!["a.txt".to_string()]));
    assert!(h.orchestrator.pending_patch().is_some_and(|p| p.contains("a/a.txt")));

    h.orchestrator
        .respond("no, change b", cb, &CancellationToken::new())
        .expect("turn");
    let pending = h.orchestrator.pending_patch().expect("pending");
    assert!(pending.contains("b/b.txt"));
    assert!(!pending.contains("a/a.txt"));
    assert!(seen.lock().expect("chunks").contains(&StreamChunk::PatchProposed {
        target_files: vec!["b.txt".to_string()],
    }));

    assert!(h.orchestrator.discard_pending_patch());
    assert!(h.orchestrator.pending_patch().is_none());
    assert!(!h.orchestrator.discard_pending_patch());
}

#[test]
fn snapshots_persist_and_restore_after_compaction() {
    let provider = ScriptedProvider::new(["one", "two", "three"]);
    let Harness {
        dir, orchestrator, ..
    } = harness(provider, AgentConfig::default());
    let store = SessionStore::new(dir.path()).expect("store");
    let mut orchestrator = orchestrator.with_store(store.clone());
    let cancel = CancellationToken::new();

    for text in ["first", "second", "third"] {
        orchestrator
            .respond(text, noop_stream_callback(), &cancel)
            .expect("turn");
    }
    let saved = store.load_latest().expect("load").expect("snapshot");
    assert_eq!(saved.session_id, orchestrator.session_id());
    assert_eq!(saved.history.len(), 6);
    assert_eq!(saved.metrics.turns, 3);

    let report = orchestrator.compact(2);
    assert_eq!(report.dropped, 4);
    assert_eq!(orchestrator.history().len(), 3);
    assert_eq!(orchestrator.history()[0].role, Role::System);
    let saved = store.load_latest().expect("load").expect("snapshot");
    assert_eq!(saved.history, orchestrator.history());

    let mut resumed = Orchestrator::new_with_provider(
        dir.path(),
        AgentConfig::default(),
        Arc::new(ScriptedProvider::new(["four"])),
    )
    .with_store(store);
    assert!(resumed.resume_latest().expect("resume"));
    assert_eq!(resumed.session_id(), orchestrator.session_id());
    assert_eq!(resumed.history(), orchestrator.history());
    assert_eq!(resumed.metrics().turns, 3);
}
