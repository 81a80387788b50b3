use keel_core::{ChatMessage, Role};
use serde::Serialize;

/// Dropped user messages quoted in a compaction summary.
const MAX_QUOTED_USER_LINES: usize = 8;
const MAX_QUOTED_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub dropped: usize,
    pub kept: usize,
}

/// Index of the message that opens the most recent exchange.
fn latest_exchange_start(history: &[ChatMessage]) -> usize {
    history
        .iter()
        .rposition(|m| m.role == Role::User)
        .unwrap_or(0)
}

/// Keeps the last `keep_last` messages, widened so the latest exchange is
/// never cut, and prepends a system summary of what went.
pub(crate) fn compact(history: &mut Vec<ChatMessage>, keep_last: usize) -> CompactionReport {
    let protected = history.len() - latest_exchange_start(history);
    let keep = keep_last.max(protected).min(history.len());
    let mut cut = history.len() - keep;
    // Tool results stay behind the assistant message that requested them.
    while cut > 0 && history[cut].role == Role::ToolResult {
        cut -= 1;
    }
    if cut == 0 {
        return CompactionReport {
            dropped: 0,
            kept: history.len(),
        };
    }
    let dropped: Vec<ChatMessage> = history.drain(..cut).collect();
    let kept = history.len();
    history.insert(0, ChatMessage::system(summarize(&dropped)));
    CompactionReport {
        dropped: dropped.len(),
        kept,
    }
}

fn summarize(dropped: &[ChatMessage]) -> String {
    let count = |role: Role| dropped.iter().filter(|m| m.role == role).count();
    let parts: Vec<String> = [Role::User, Role::Assistant, Role::ToolResult, Role::System]
        .into_iter()
        .map(|role| (role, count(role)))
        .filter(|(_, n)| *n > 0)
        .map(|(role, n)| format!("{n} {role}"))
        .collect();
    let mut out = format!(
        "[compacted {} earlier messages: {}]",
        dropped.len(),
        parts.join(", ")
    );
    let users: Vec<&ChatMessage> = dropped.iter().filter(|m| m.role == Role::User).collect();
    for message in users.iter().take(MAX_QUOTED_USER_LINES) {
        let first = message.content.lines().next().unwrap_or_default().trim();
        let mut quoted: String = first.chars().take(MAX_QUOTED_CHARS).collect();
        if first.chars().count() > MAX_QUOTED_CHARS {
            quoted.push_str("...");
        }
        out.push_str("\n- ");
        out.push_str(&quoted);
    }
    if users.len() > MAX_QUOTED_USER_LINES {
        out.push_str(&format!(
            "\n- ({} more)",
            users.len() - MAX_QUOTED_USER_LINES
        ));
    }
    out
}
