use anyhow::Result;
use keel_agent::Orchestrator;
use keel_core::{AppConfig, ConfirmDecision, ConfirmRequest, ConfirmationSurface};
use keel_observe::Observer;
use keel_policy::PermissionEngine;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Flags shared by every subcommand.
pub(crate) struct CliContext {
    pub workspace: PathBuf,
    pub json: bool,
    pub skip_permissions: bool,
    pub observer: Arc<Observer>,
}

impl CliContext {
    pub fn new(
        workspace: PathBuf,
        json: bool,
        verbose: bool,
        skip_permissions: bool,
    ) -> Result<Self> {
        let mut observer = Observer::new(&workspace)?;
        observer.set_verbose(verbose);
        Ok(Self {
            workspace,
            json,
            skip_permissions,
            observer: Arc::new(observer),
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn permissions(&self) -> PermissionEngine {
        let mut engine =
            PermissionEngine::new(&self.workspace).with_observer(self.observer.clone());
        engine.set_skip_prompts(self.skip_permissions);
        engine
    }

    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let cfg = AppConfig::load(&self.workspace)?;
        Ok(
            Orchestrator::from_config(&self.workspace, cfg, self.observer.clone())?
                .with_permissions(Arc::new(self.permissions()))
                .with_confirmation(Arc::new(StdinConfirmation)),
        )
    }
}

/// `[y/N]` prompt on the controlling terminal. Anything but yes rejects;
/// end of input or a non-interactive stdin cancels.
pub(crate) struct StdinConfirmation;

impl ConfirmationSurface for StdinConfirmation {
    fn confirm(&self, request: &ConfirmRequest) -> ConfirmDecision {
        if !std::io::stdin().is_terminal() {
            return ConfirmDecision::Cancelled;
        }
        if !request.detail.is_empty() {
            eprintln!("{}", request.detail);
        }
        eprint!("{} [y/N]: ", request.title);
        if std::io::stderr().flush().is_err() {
            return ConfirmDecision::Cancelled;
        }
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => ConfirmDecision::Cancelled,
            Ok(_) => parse_answer(&answer),
        }
    }
}

fn parse_answer(answer: &str) -> ConfirmDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ConfirmDecision::Approved,
        _ => ConfirmDecision::Rejected,
    }
}
