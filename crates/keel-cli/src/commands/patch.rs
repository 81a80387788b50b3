use anyhow::{Context, Result};
use keel_diff::{JournalAction, PatchEngine};
use serde_json::json;
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::context::CliContext;
use crate::output::print_json;
use crate::{PatchCmd, PatchInput, enhanced};

pub(crate) fn run_patch(ctx: &CliContext, cmd: PatchCmd) -> Result<()> {
    match cmd {
        PatchCmd::Check(input) => check(ctx, &read_diff(&input)?),
        PatchCmd::Apply(input) => apply(ctx, read_diff(&input)?),
        PatchCmd::RevertLast => revert_last(ctx),
        PatchCmd::Journal => journal(ctx),
    }
}

fn read_diff(input: &PatchInput) -> Result<String> {
    match input.file.as_deref() {
        Some(path) if path != Path::new("-") => {
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
        }
        _ => {
            let mut diff = String::new();
            std::io::stdin()
                .read_to_string(&mut diff)
                .context("failed to read diff from stdin")?;
            Ok(diff)
        }
    }
}

fn engine(ctx: &CliContext) -> PatchEngine {
    PatchEngine::new(ctx.workspace()).with_observer(ctx.observer.clone())
}

fn check(ctx: &CliContext, diff: &str) -> Result<()> {
    let report = engine(ctx)
        .dry_run_apply(diff)
        .map_err(|err| enhanced(err.to_enhanced()))?;
    if ctx.json {
        return print_json(&report);
    }
    if report.ok {
        println!("patch applies cleanly to {}", report.target_files.join(", "));
    } else {
        println!("patch does not apply:");
        for conflict in &report.conflicts {
            println!("  {conflict}");
        }
    }
    Ok(())
}

/// Goes through the same permission and dry-run gate as a proposal made
/// during chat.
fn apply(ctx: &CliContext, diff: String) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;
    orchestrator.propose_patch(diff);
    let entry = orchestrator
        .commit_pending_patch()
        .map_err(|err| enhanced(err.to_enhanced()))?;
    if ctx.json {
        return print_json(&entry);
    }
    println!("applied {} ({})", entry.id, entry.target_files.join(", "));
    Ok(())
}

fn revert_last(ctx: &CliContext) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;
    let reverted = orchestrator
        .revert_last_patch()
        .map_err(|err| enhanced(err.to_enhanced()))?;
    if ctx.json {
        return print_json(&json!({"reverted": reverted}));
    }
    match reverted {
        Some(entry) => println!(
            "reverted {}",
            entry.reverts.map_or_else(|| entry.id.to_string(), |id| id.to_string())
        ),
        None => println!("nothing to revert"),
    }
    Ok(())
}

fn journal(ctx: &CliContext) -> Result<()> {
    let views = engine(ctx)
        .journal()
        .map_err(|err| enhanced(err.to_enhanced()))?;
    if ctx.json {
        return print_json(&views);
    }
    if views.is_empty() {
        println!("journal is empty");
    }
    for view in views {
        let action = match view.entry.action {
            JournalAction::Apply if view.reverted => "apply (reverted)",
            JournalAction::Apply => "apply",
            JournalAction::Revert => "revert",
        };
        println!(
            "{} {} {} {}",
            view.entry.timestamp.to_rfc3339(),
            view.entry.id,
            action,
            view.entry.target_files.join(", ")
        );
    }
    Ok(())
}
