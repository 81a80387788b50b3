use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use keel_core::PermissionAction;
use keel_errors::{EnhancedError, ErrorHandler};
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::chat::run_chat;
use commands::patch::run_patch;
use commands::permissions::run_permissions;
use context::CliContext;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Local-first coding agent", long_about = None)]
struct Cli {
    /// Emit machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Workspace root; defaults to the current directory.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Allow every permission-gated action without prompting.
    #[arg(long = "dangerously-skip-permissions", global = true)]
    dangerously_skip_permissions: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive conversation with the agent.
    Chat(ChatArgs),
    /// Inspect and edit permission rules of the project layer.
    Permissions {
        #[command(subcommand)]
        command: PermissionsCmd,
    },
    /// Check, apply and revert unified diffs.
    Patch {
        #[command(subcommand)]
        command: PatchCmd,
    },
}

#[derive(Args, Default)]
struct ChatArgs {
    /// Continue the most recently saved session.
    #[arg(long)]
    resume: bool,
}

#[derive(Subcommand)]
enum PermissionsCmd {
    /// Effective rules in evaluation order, then per-tool defaults.
    List,
    /// Append a rule to the project layer.
    Add(PermissionsAddArgs),
    /// Remove the project rule at INDEX.
    Remove { index: usize },
    /// Set the fallback action for a tool.
    Default {
        tool: String,
        action: PermissionAction,
    },
    /// Show the verdict for a hypothetical request.
    Check(PermissionsCheckArgs),
}

#[derive(Args)]
struct PermissionsAddArgs {
    #[arg(long)]
    tool: Option<String>,
    #[arg(long = "path-glob")]
    path_glob: Option<String>,
    #[arg(long = "command-pattern")]
    command_pattern: Option<String>,
    #[arg(long)]
    action: PermissionAction,
}

#[derive(Args)]
struct PermissionsCheckArgs {
    tool: String,
    #[arg(long)]
    path: Option<String>,
    #[arg(long)]
    command: Option<String>,
}

#[derive(Subcommand)]
enum PatchCmd {
    /// Dry-run a diff against the working tree.
    Check(PatchInput),
    /// Apply a diff after the permission checks.
    Apply(PatchInput),
    /// Revert the most recent applied patch.
    RevertLast,
    /// List journal entries.
    Journal,
}

#[derive(Args)]
struct PatchInput {
    /// Diff file; `-` or omitted reads stdin.
    file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    if let Err(err) = run(cli) {
        eprint!("{}", ErrorHandler::new().verbose(verbose).handle(&err));
        std::process::exit(1);
    }
}

fn run(mut cli: Cli) -> Result<()> {
    let workspace = match cli.workspace.take() {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let ctx = CliContext::new(
        workspace,
        cli.json,
        cli.verbose,
        cli.dangerously_skip_permissions,
    )?;
    let command = cli
        .command
        .take()
        .unwrap_or(Commands::Chat(ChatArgs::default()));
    match command {
        Commands::Chat(args) => run_chat(&ctx, args),
        Commands::Permissions { command } => run_permissions(&ctx, command),
        Commands::Patch { command } => run_patch(&ctx, command),
    }
}

/// Turns a typed error into one the top-level handler renders with its
/// remediation text.
pub(crate) fn enhanced(err: EnhancedError) -> anyhow::Error {
    err.into_error()
}
