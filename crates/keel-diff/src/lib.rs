//! Patch engine: sanitizes model-proposed unified diffs, applies and reverts
//! them through version control, and journals every successful operation.

mod journal;
mod sanitize;
mod vcs;

pub use journal::{JournalAction, JournalEntry, JournalView, PatchJournal};
pub use sanitize::{BEGIN_PATCH, END_PATCH, extract_patch_block, sanitize, target_files};
pub use vcs::{ApplyMode, GitCli, VcsCollaborator, VcsOutput};

use keel_core::runtime_dir;
use keel_errors::{EnhancedError, ErrorType, errors};
use keel_observe::{ObserveEvent, Observer};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{workspace} is not under version control")]
    VcsRequired { workspace: String },
    #[error("patch path '{path}' is absolute or leaves the workspace")]
    PathTraversal { path: String },
    #[error("patch does not apply: {}", .conflicts.join("; "))]
    PatchConflict { conflicts: Vec<String> },
    #[error("patch contains no changes")]
    EmptyPatch,
    #[error("patch journal: {0}")]
    Journal(String),
    #[error("version control: {0}")]
    Vcs(String),
}

impl PatchError {
    pub fn to_enhanced(&self) -> EnhancedError {
        match self {
            Self::VcsRequired { workspace } => errors::vcs_required(workspace),
            Self::PathTraversal { path } => errors::path_traversal(path),
            Self::PatchConflict { conflicts } => errors::patch_conflict(conflicts),
            Self::EmptyPatch => EnhancedError::new(
                "Empty Patch",
                "The proposed patch has no diff content.",
                ErrorType::Patch,
            )
            .with_suggestion("Ask the model to resend the patch between the markers"),
            Self::Journal(message) => {
                EnhancedError::new("Patch Journal Unreadable", message.clone(), ErrorType::Patch)
                    .with_suggestion("Inspect .keel/patches/journal.jsonl for damaged lines")
            }
            Self::Vcs(message) => {
                EnhancedError::new("Version Control Failed", message.clone(), ErrorType::Patch)
                    .with_suggestion("Check that `git` is installed and on PATH")
            }
        }
    }
}

/// Outcome of a dry run. `conflicts` holds the collaborator's diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub ok: bool,
    pub conflicts: Vec<String>,
    pub target_files: Vec<String>,
}

pub struct PatchEngine {
    workspace: PathBuf,
    vcs: Arc<dyn VcsCollaborator>,
    journal: PatchJournal,
    observer: Arc<Observer>,
}

impl PatchEngine {
    /// Engine backed by `git`, journaling under `<workspace>/.keel/patches`.
    pub fn new(workspace: &Path) -> Self {
        Self::with_vcs(workspace, Arc::new(GitCli))
    }

    pub fn with_vcs(workspace: &Path, vcs: Arc<dyn VcsCollaborator>) -> Self {
        let journal = PatchJournal::new(runtime_dir(workspace).join("patches").join("journal.jsonl"));
        Self {
            workspace: workspace.to_path_buf(),
            vcs,
            journal,
            observer: Arc::new(Observer::silent()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn journal_path(&self) -> &Path {
        self.journal.path()
    }

    pub fn sanitize(&self, diff: &str) -> Result<String, PatchError> {
        sanitize(diff)
    }

    pub fn dry_run_apply(&self, diff: &str) -> Result<DryRunReport, PatchError> {
        let clean = self.prepare(diff)?;
        let output = self.run(&clean, ApplyMode::Check)?;
        Ok(DryRunReport {
            ok: output.success,
            conflicts: if output.success {
                Vec::new()
            } else {
                output.diagnostics()
            },
            target_files: target_files(&clean),
        })
    }

    /// Applies the diff and journals it. Nothing is journaled on failure.
    pub fn apply(&self, diff: &str) -> Result<JournalEntry, PatchError> {
        let clean = self.prepare(diff)?;
        let output = self.run(&clean, ApplyMode::Apply)?;
        if !output.success {
            return Err(PatchError::PatchConflict {
                conflicts: output.diagnostics(),
            });
        }
        let entry = JournalEntry::new(JournalAction::Apply, &clean, target_files(&clean));
        self.journal.append(&entry)?;
        self.observer.record(&ObserveEvent::PatchCommitted {
            entry_id: entry.id.to_string(),
            target_files: entry.target_files.clone(),
        });
        Ok(entry)
    }

    /// Applies the diff in reverse and journals a revert entry.
    pub fn revert(&self, diff: &str) -> Result<JournalEntry, PatchError> {
        let clean = self.prepare(diff)?;
        self.reverse(&clean, None)
    }

    /// Reverts the most recent apply not yet paired with a revert.
    ///
    /// Returns `Ok(false)` when there is nothing to revert or the workspace
    /// is not under version control.
    pub fn revert_last(&self) -> Result<bool, PatchError> {
        Ok(self.revert_last_entry()?.is_some())
    }

    /// Like [`revert_last`](Self::revert_last) but hands back the revert entry.
    pub fn revert_last_entry(&self) -> Result<Option<JournalEntry>, PatchError> {
        if !self.vcs.is_repository(&self.workspace) {
            return Ok(None);
        }
        let Some(subject) = self.journal.last_unreverted_apply()? else {
            return Ok(None);
        };
        self.reverse(&subject.diff, Some(&subject)).map(Some)
    }

    pub fn journal(&self) -> Result<Vec<JournalView>, PatchError> {
        self.journal.views()
    }

    fn reverse(&self, clean: &str, subject: Option<&JournalEntry>) -> Result<JournalEntry, PatchError> {
        let output = self.run(clean, ApplyMode::Reverse)?;
        if !output.success {
            return Err(PatchError::PatchConflict {
                conflicts: output.diagnostics(),
            });
        }
        let mut entry = JournalEntry::new(JournalAction::Revert, clean, target_files(clean));
        entry.reverts = subject.map(|s| s.id);
        self.journal.append(&entry)?;
        self.observer.record(&ObserveEvent::PatchReverted {
            entry_id: subject.map_or(entry.id, |s| s.id).to_string(),
        });
        Ok(entry)
    }

    /// Sanitizes first so unsafe input never reaches the collaborator.
    fn prepare(&self, diff: &str) -> Result<String, PatchError> {
        let clean = sanitize(diff)?;
        if clean.trim().is_empty() {
            return Err(PatchError::EmptyPatch);
        }
        if !self.vcs.is_repository(&self.workspace) {
            return Err(PatchError::VcsRequired {
                workspace: self.workspace.display().to_string(),
            });
        }
        Ok(clean)
    }

    fn run(&self, diff: &str, mode: ApplyMode) -> Result<VcsOutput, PatchError> {
        self.observer
            .verbose_log(&format!("git apply {mode:?} ({} bytes)", diff.len()));
        self.vcs
            .apply(&self.workspace, diff, mode)
            .map_err(|e| PatchError::Vcs(format!("{e:#}")))
    }
}
