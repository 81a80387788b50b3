use crate::{Orchestrator, TurnError};
use keel_core::{ConfirmDecision, ConfirmRequest, PermissionAction};
use keel_diff::{DryRunReport, JournalEntry, PatchError, target_files};
use keel_observe::ObserveEvent;
use keel_policy::{PATCH_TOOL, PermissionQuery};

impl Orchestrator {
    /// The last proposed, uncommitted diff.
    pub fn pending_patch(&self) -> Option<&str> {
        self.pending_patch.as_deref()
    }

    /// Stages `diff` as the pending patch, replacing any earlier proposal.
    /// Returns the files it targets.
    pub fn propose_patch(&mut self, diff: impl Into<String>) -> Vec<String> {
        let diff = diff.into();
        let files = target_files(&diff);
        self.pending_patch = Some(diff);
        self.observer.record(&ObserveEvent::PatchProposed {
            target_files: files.clone(),
        });
        files
    }

    /// Drops the pending patch; returns whether there was one.
    pub fn discard_pending_patch(&mut self) -> bool {
        self.pending_patch.take().is_some()
    }

    pub fn dry_run_pending_patch(&self) -> Result<DryRunReport, TurnError> {
        let diff = self.pending_patch.as_deref().ok_or(TurnError::NoPendingPatch)?;
        Ok(self.patches.dry_run_apply(diff)?)
    }

    /// Authorizes, checks and applies the pending patch, then clears it.
    /// On any failure the patch stays pending.
    pub fn commit_pending_patch(&mut self) -> Result<JournalEntry, TurnError> {
        let diff = self.pending_patch.clone().ok_or(TurnError::NoPendingPatch)?;
        let clean = self.patches.sanitize(&diff)?;
        let files = target_files(&clean);

        // A diff that names no file is still checked, without a path.
        let queries: Vec<(PermissionQuery, String)> = if files.is_empty() {
            vec![(PermissionQuery::tool(PATCH_TOOL), PATCH_TOOL.to_string())]
        } else {
            files
                .iter()
                .map(|file| {
                    let path = self.workspace.join(file).display().to_string();
                    (PermissionQuery::tool(PATCH_TOOL).with_path(path.clone()), path)
                })
                .collect()
        };
        let mut needs_confirm = false;
        for (query, subject) in queries {
            match self.permissions.check(&query) {
                PermissionAction::Allow => {}
                PermissionAction::Deny => return Err(TurnError::PermissionDenied { subject }),
                PermissionAction::Confirm => needs_confirm = true,
            }
        }
        if needs_confirm {
            self.ask(
                format!("Apply patch to {} file(s)?", files.len()),
                files.join("\n"),
                "patch commit",
            )?;
        }

        let report = self.patches.dry_run_apply(&clean)?;
        if !report.ok {
            return Err(PatchError::PatchConflict {
                conflicts: report.conflicts,
            }
            .into());
        }
        let entry = self.patches.apply(&clean)?;
        self.pending_patch = None;
        self.persist();
        Ok(entry)
    }

    /// Reverts the most recent un-reverted apply. `Ok(None)` when there is
    /// nothing to revert.
    pub fn revert_last_patch(&mut self) -> Result<Option<JournalEntry>, TurnError> {
        match self
            .permissions
            .check(&PermissionQuery::tool(PATCH_TOOL).with_command("revert"))
        {
            PermissionAction::Allow => {}
            PermissionAction::Deny => {
                return Err(TurnError::PermissionDenied {
                    subject: "revert".to_string(),
                });
            }
            PermissionAction::Confirm => {
                self.ask(
                    "Revert the last applied patch?".to_string(),
                    String::new(),
                    "patch revert",
                )?;
            }
        }
        Ok(self.patches.revert_last_entry()?)
    }

    fn ask(&self, title: String, detail: String, what: &str) -> Result<(), TurnError> {
        match self.confirm.confirm(&ConfirmRequest { title, detail }) {
            ConfirmDecision::Approved => Ok(()),
            ConfirmDecision::Rejected | ConfirmDecision::Cancelled => {
                Err(TurnError::Rejected(what.to_string()))
            }
        }
    }
}
