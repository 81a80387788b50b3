use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// How a diff should be handed to the version-control tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Check applicability only; nothing is written.
    Check,
    Apply,
    /// Apply the diff in reverse.
    Reverse,
}

/// Result of one version-control invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsOutput {
    pub success: bool,
    pub stderr: String,
}

impl VcsOutput {
    /// Diagnostic lines worth showing to the user, in order.
    pub fn diagnostics(&self) -> Vec<String> {
        self.stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

/// The operations the patch engine needs from version control.
pub trait VcsCollaborator: Send + Sync {
    /// Whether `workspace` sits inside a working tree.
    fn is_repository(&self, workspace: &Path) -> bool;

    fn apply(&self, workspace: &Path, diff: &str, mode: ApplyMode) -> Result<VcsOutput>;
}

/// `git` on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl VcsCollaborator for GitCli {
    fn is_repository(&self, workspace: &Path) -> bool {
        Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
            .unwrap_or(false)
    }

    fn apply(&self, workspace: &Path, diff: &str, mode: ApplyMode) -> Result<VcsOutput> {
        let mut cmd = Command::new("git");
        cmd.args(["apply", "--ignore-whitespace", "--whitespace=nowarn"]);
        match mode {
            ApplyMode::Check => {
                cmd.arg("--check");
            }
            ApplyMode::Apply => {}
            ApplyMode::Reverse => {
                cmd.arg("-R");
            }
        }
        let mut child = cmd
            .arg("-")
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to execute git apply")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(diff.as_bytes())
                .context("failed to stream diff to git apply")?;
        }
        let output = child
            .wait_with_output()
            .context("failed to wait for git apply")?;
        Ok(VcsOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
