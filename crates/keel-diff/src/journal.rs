use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalAction {
    Apply,
    Revert,
}

/// One line of `journal.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub action: JournalAction,
    pub diff: String,
    pub sha256: String,
    pub timestamp: DateTime<Utc>,
    /// The apply entry this revert undoes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts: Option<Uuid>,
    #[serde(default)]
    pub target_files: Vec<String>,
}

impl JournalEntry {
    pub fn new(action: JournalAction, diff: &str, target_files: Vec<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            action,
            diff: diff.to_string(),
            sha256: sha256_hex(diff.as_bytes()),
            timestamp: Utc::now(),
            reverts: None,
            target_files,
        }
    }
}

/// A journal entry with its derived reverted flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalView {
    #[serde(flatten)]
    pub entry: JournalEntry,
    pub reverted: bool,
}

/// Append-only JSONL log of apply and revert operations.
#[derive(Debug, Clone)]
pub struct PatchJournal {
    path: PathBuf,
}

impl PatchJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Result<Vec<JournalEntry>, PatchError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| PatchError::Journal(format!("read {}: {e}", self.path.display())))?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| {
                    PatchError::Journal(format!(
                        "{} line {}: {e}",
                        self.path.display(),
                        idx + 1
                    ))
                })
            })
            .collect()
    }

    pub fn append(&self, entry: &JournalEntry) -> Result<(), PatchError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PatchError::Journal(format!("create {}: {e}", parent.display())))?;
        }
        let line = serde_json::to_string(entry)
            .map_err(|e| PatchError::Journal(format!("encode entry: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PatchError::Journal(format!("open {}: {e}", self.path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| PatchError::Journal(format!("append {}: {e}", self.path.display())))
    }

    pub fn views(&self) -> Result<Vec<JournalView>, PatchError> {
        let entries = self.entries()?;
        let flags = reverted_flags(&entries);
        Ok(entries
            .into_iter()
            .zip(flags)
            .map(|(entry, reverted)| JournalView { entry, reverted })
            .collect())
    }

    /// Most recent apply entry that no later revert has paired with.
    pub fn last_unreverted_apply(&self) -> Result<Option<JournalEntry>, PatchError> {
        let entries = self.entries()?;
        let flags = reverted_flags(&entries);
        Ok(entries
            .into_iter()
            .zip(flags)
            .rev()
            .find(|(entry, reverted)| entry.action == JournalAction::Apply && !reverted)
            .map(|(entry, _)| entry))
    }
}

/// Pairs each revert with an earlier apply in one forward pass.
///
/// A revert naming an apply id pairs with exactly that entry. A revert
/// without one pairs with the most recent still-open apply carrying the
/// same digest. Reverts that find nothing to pair with are ignored, so a
/// stray revert never hides an unrelated apply.
fn reverted_flags(entries: &[JournalEntry]) -> Vec<bool> {
    let mut flags = vec![false; entries.len()];
    for (idx, entry) in entries.iter().enumerate() {
        if entry.action != JournalAction::Revert {
            continue;
        }
        let target = match entry.reverts {
            Some(id) => entries[..idx]
                .iter()
                .position(|e| e.id == id && e.action == JournalAction::Apply),
            None => entries[..idx].iter().enumerate().rev().find_map(|(i, e)| {
                (e.action == JournalAction::Apply && !flags[i] && e.sha256 == entry.sha256)
                    .then_some(i)
            }),
        };
        if let Some(i) = target {
            flags[i] = true;
        }
    }
    flags
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
