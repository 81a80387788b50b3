use anyhow::Result;
use keel_agent::Orchestrator;
use keel_core::{CancellationToken, StreamCallback, StreamChunk};
use keel_errors::{EnhancedError, ErrorType};
use serde_json::json;
use std::io::{Write, stdin, stdout};
use std::sync::Arc;

use crate::ChatArgs;
use crate::context::CliContext;
use crate::output::print_json;

const DEFAULT_KEEP_LAST: usize = 10;

#[derive(Debug, PartialEq, Eq)]
enum SlashCommand {
    Help,
    Exit,
    Pending,
    Check,
    Commit,
    Discard,
    Revert,
    Compact(usize),
    Metrics,
    Unknown(String),
}

impl SlashCommand {
    fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        Some(match name {
            "help" => Self::Help,
            "exit" | "quit" => Self::Exit,
            "pending" => Self::Pending,
            "check" => Self::Check,
            "commit" => Self::Commit,
            "discard" => Self::Discard,
            "revert" => Self::Revert,
            "compact" => Self::Compact(
                parts
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(DEFAULT_KEEP_LAST),
            ),
            "metrics" | "cost" => Self::Metrics,
            other => Self::Unknown(other.to_string()),
        })
    }
}

pub(crate) fn run_chat(ctx: &CliContext, args: ChatArgs) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;
    if args.resume {
        if orchestrator.resume_latest()? {
            if !ctx.json {
                println!(
                    "resumed session {} ({} messages)",
                    orchestrator.session_id(),
                    orchestrator.history().len()
                );
            }
        } else if !ctx.json {
            println!("no saved session; starting a new one");
        }
    }
    if !ctx.json {
        println!("keel chat (type /help for commands, /exit to quit)");
    }

    let cb = renderer(ctx.json);
    loop {
        if !ctx.json {
            print!("> ");
            stdout().flush()?;
        }
        let mut line = String::new();
        if stdin().read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if let Some(cmd) = SlashCommand::parse(prompt) {
            if cmd == SlashCommand::Exit {
                break;
            }
            handle_slash(ctx, &mut orchestrator, cmd)?;
            continue;
        }

        match orchestrator.respond(prompt, cb.clone(), &CancellationToken::new()) {
            Ok(outcome) => {
                if ctx.json {
                    print_json(&json!({
                        "text": outcome.text,
                        "tool_calls": outcome.tool_calls,
                        "follow_ups": outcome.follow_ups,
                        "cycle_cap_reached": outcome.cycle_cap_reached,
                        "proposed_patch": outcome.proposed_patch,
                    }))?;
                }
            }
            Err(err) => report(ctx, err.to_enhanced()),
        }
    }
    Ok(())
}

fn renderer(json_mode: bool) -> StreamCallback {
    Arc::new(move |chunk| {
        if json_mode {
            return;
        }
        match chunk {
            StreamChunk::ContentDelta(text) => {
                print!("{text}");
                let _ = stdout().flush();
            }
            StreamChunk::ToolCallStart { server, tool_name } => {
                eprintln!("\n[tool] {server}/{tool_name} ...");
            }
            StreamChunk::ToolCallEnd {
                server,
                tool_name,
                duration_ms,
                success,
                summary,
            } => {
                let status = if success { "ok" } else { "failed" };
                eprintln!("[tool] {server}/{tool_name} {status} in {duration_ms}ms: {summary}");
            }
            StreamChunk::PatchProposed { target_files } => {
                eprintln!(
                    "\n[patch] proposed for {}; /check to dry-run, /commit to apply",
                    target_files.join(", ")
                );
            }
            StreamChunk::CycleCapReached { cycles } => {
                eprintln!("\n[tool] stopped after {cycles} tool round trips");
            }
            StreamChunk::Done => println!(),
        }
    })
}

fn handle_slash(
    ctx: &CliContext,
    orchestrator: &mut Orchestrator,
    cmd: SlashCommand,
) -> Result<()> {
    match cmd {
        SlashCommand::Help => {
            let commands = [
                "/pending", "/check", "/commit", "/discard", "/revert", "/compact [n]", "/metrics",
                "/exit",
            ];
            if ctx.json {
                print_json(&json!({"commands": commands}))?;
            } else {
                println!("{}", commands.join("  "));
            }
        }
        SlashCommand::Exit => {}
        SlashCommand::Pending => match orchestrator.pending_patch() {
            Some(diff) if ctx.json => print_json(&json!({"pending_patch": diff}))?,
            Some(diff) => print!("{diff}"),
            None if ctx.json => print_json(&json!({"pending_patch": null}))?,
            None => println!("no pending patch"),
        },
        SlashCommand::Check => match orchestrator.dry_run_pending_patch() {
            Ok(report) if ctx.json => print_json(&report)?,
            Ok(report) if report.ok => println!("pending patch applies cleanly"),
            Ok(report) => {
                println!("pending patch does not apply:");
                for conflict in report.conflicts {
                    println!("  {conflict}");
                }
            }
            Err(err) => report(ctx, err.to_enhanced()),
        },
        SlashCommand::Commit => match orchestrator.commit_pending_patch() {
            Ok(entry) if ctx.json => print_json(&entry)?,
            Ok(entry) => println!("applied {} ({})", entry.id, entry.target_files.join(", ")),
            Err(err) => report(ctx, err.to_enhanced()),
        },
        SlashCommand::Discard => {
            let discarded = orchestrator.discard_pending_patch();
            if ctx.json {
                print_json(&json!({"discarded": discarded}))?;
            } else if discarded {
                println!("pending patch discarded");
            } else {
                println!("no pending patch");
            }
        }
        SlashCommand::Revert => match orchestrator.revert_last_patch() {
            Ok(entry) if ctx.json => print_json(&json!({"reverted": entry}))?,
            Ok(Some(_)) => println!("last patch reverted"),
            Ok(None) => println!("nothing to revert"),
            Err(err) => report(ctx, err.to_enhanced()),
        },
        SlashCommand::Compact(keep_last) => {
            let summary = orchestrator.compact(keep_last);
            if ctx.json {
                print_json(&summary)?;
            } else {
                println!("dropped {} messages, kept {}", summary.dropped, summary.kept);
            }
        }
        SlashCommand::Metrics => {
            let metrics = orchestrator.metrics();
            if ctx.json {
                print_json(metrics)?;
            } else {
                println!(
                    "turns={} tool_calls={} follow_ups={} prompt_tokens~{} completion_tokens~{} total_ms={}",
                    metrics.turns,
                    metrics.tool_calls,
                    metrics.follow_up_cycles,
                    metrics.prompt_tokens_estimate,
                    metrics.completion_tokens_estimate,
                    metrics.total_duration_ms
                );
            }
        }
        SlashCommand::Unknown(name) => {
            let err = EnhancedError::new(
                "Unknown Command",
                format!("/{name} is not a chat command."),
                ErrorType::Unknown,
            )
            .with_suggestion("Type /help for the list of commands");
            report(ctx, err);
        }
    }
    Ok(())
}

fn report(ctx: &CliContext, err: EnhancedError) {
    if ctx.json {
        eprintln!("{}", err.to_json());
    } else {
        eprint!("{}", err.format(ctx.observer.is_verbose()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slash_commands() {
        assert_eq!(SlashCommand::parse("hello"), None);
        assert_eq!(SlashCommand::parse("/commit"), Some(SlashCommand::Commit));
        assert_eq!(SlashCommand::parse("/quit"), Some(SlashCommand::Exit));
        assert_eq!(SlashCommand::parse("/compact 4"), Some(SlashCommand::Compact(4)));
        assert_eq!(
            SlashCommand::parse("/compact"),
            Some(SlashCommand::Compact(DEFAULT_KEEP_LAST))
        );
        assert_eq!(
            SlashCommand::parse("/frobnicate now"),
            Some(SlashCommand::Unknown("frobnicate".to_string()))
        );
    }
}
