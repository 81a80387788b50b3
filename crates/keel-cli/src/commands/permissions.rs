use anyhow::Result;
use keel_core::{PermissionRule, RuleMatch};
use keel_policy::{PermissionEngine, PermissionQuery};
use serde_json::json;

use crate::context::CliContext;
use crate::output::print_json;
use crate::{PermissionsAddArgs, PermissionsCheckArgs, PermissionsCmd};

pub(crate) fn run_permissions(ctx: &CliContext, cmd: PermissionsCmd) -> Result<()> {
    let engine = ctx.permissions();
    match cmd {
        PermissionsCmd::List => list(ctx, &engine),
        PermissionsCmd::Add(args) => add(ctx, &engine, args),
        PermissionsCmd::Remove { index } => {
            let removed = engine.remove_rule(index)?;
            if ctx.json {
                print_json(&json!({"index": index, "removed": removed}))?;
            } else if removed {
                println!("removed project rule {index}");
            } else {
                println!("no project rule at index {index}; nothing changed");
            }
            Ok(())
        }
        PermissionsCmd::Default { tool, action } => {
            engine.set_default(&tool, action)?;
            if ctx.json {
                print_json(&json!({"tool": tool, "default": action}))?;
            } else {
                println!("default for {tool} is now {action}");
            }
            Ok(())
        }
        PermissionsCmd::Check(args) => check(ctx, &engine, args),
    }
}

fn list(ctx: &CliContext, engine: &PermissionEngine) -> Result<()> {
    let rules = engine.rules()?;
    let defaults = engine.defaults()?;
    let project = engine.project_path();

    // Project rules are numbered in file order; that is the index `remove` takes.
    let mut project_index = 0usize;
    let rows: Vec<serde_json::Value> = rules
        .iter()
        .map(|effective| {
            let index = (effective.layer == project).then(|| {
                project_index += 1;
                project_index - 1
            });
            json!({
                "project_index": index,
                "layer": effective.layer.display().to_string(),
                "match": effective.rule.matcher,
                "action": effective.rule.action,
            })
        })
        .collect();

    if ctx.json {
        return print_json(&json!({"rules": rows, "defaults": defaults}));
    }
    if rows.is_empty() {
        println!("no rules");
    }
    for (row, effective) in rows.iter().zip(&rules) {
        let label = match row["project_index"].as_u64() {
            Some(index) => format!("[{index}]"),
            None => "[-]".to_string(),
        };
        println!(
            "{label} {} {} ({})",
            effective.rule.action,
            describe(&effective.rule.matcher),
            effective.layer.display()
        );
    }
    for (tool, action) in &defaults {
        println!("default {tool} -> {action}");
    }
    Ok(())
}

fn add(ctx: &CliContext, engine: &PermissionEngine, args: PermissionsAddArgs) -> Result<()> {
    let rule = PermissionRule {
        matcher: RuleMatch {
            tool: args.tool,
            path_glob: args.path_glob,
            command_pattern: args.command_pattern,
        },
        action: args.action,
    };
    engine.add_rule(rule.clone())?;
    if ctx.json {
        print_json(&rule)?;
    } else {
        println!("added {} {}", rule.action, describe(&rule.matcher));
    }
    Ok(())
}

fn check(ctx: &CliContext, engine: &PermissionEngine, args: PermissionsCheckArgs) -> Result<()> {
    let mut query = PermissionQuery::tool(args.tool);
    if let Some(path) = args.path {
        query = query.with_path(path);
    }
    if let Some(command) = args.command {
        query = query.with_command(command);
    }
    let decision = engine.evaluate(&query)?;
    if ctx.json {
        print_json(&json!({"query": query, "decision": decision}))?;
    } else {
        println!("{} ({:?})", decision.action, decision.source);
    }
    Ok(())
}

fn describe(matcher: &RuleMatch) -> String {
    let mut parts = Vec::new();
    if let Some(tool) = &matcher.tool {
        parts.push(format!("tool={tool}"));
    }
    if let Some(glob) = &matcher.path_glob {
        parts.push(format!("path={glob}"));
    }
    if let Some(pattern) = &matcher.command_pattern {
        parts.push(format!("command=/{pattern}/"));
    }
    if parts.is_empty() {
        "*".to_string()
    } else {
        parts.join(" ")
    }
}
