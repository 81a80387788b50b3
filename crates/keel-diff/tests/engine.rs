use keel_diff::{BEGIN_PATCH, END_PATCH, JournalAction, PatchEngine, PatchError};
use std::fs;
use std::path::Path;
use std::process::Command;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(workspace: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn repo_with(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    git(root, &["init", "-q"]);
    git(root, &["config", "user.email", "keel@example.test"]);
    git(root, &["config", "user.name", "Keel"]);
    for (name, content) in files {
        fs::write(root.join(name), content).expect("seed");
    }
    git(root, &["add", "."]);
    git(root, &["commit", "-q", "-m", "init"]);
    dir
}

/// Diff that turns `before` into `after` for `name`, leaving the tree as it was.
fn diff_for(root: &Path, name: &str, after: &str) -> String {
    let before = fs::read_to_string(root.join(name)).expect("read");
    fs::write(root.join(name), after).expect("edit");
    let diff = git(root, &["diff", "--", name]);
    fs::write(root.join(name), before).expect("restore");
    diff
}

fn framed(diff: &str) -> String {
    format!("{BEGIN_PATCH}\n{diff}{END_PATCH}\n")
}

#[test]
fn apply_then_revert_last_restores_the_tree() {
    if !git_available() {
        return;
    }
    let dir = repo_with(&[("demo.txt", "before\n")]);
    let root = dir.path();
    let diff = diff_for(root, "demo.txt", "after\n");
    let engine = PatchEngine::new(root);

    let report = engine.dry_run_apply(&framed(&diff)).expect("dry run");
    assert!(report.ok, "{:?}", report.conflicts);
    assert_eq!(fs::read_to_string(root.join("demo.txt")).expect("read"), "before\n");

    let applied = engine.apply(&framed(&diff)).expect("apply");
    assert_eq!(fs::read_to_string(root.join("demo.txt")).expect("read"), "after\n");
    assert_eq!(applied.target_files, vec!["demo.txt".to_string()]);

    assert!(engine.revert_last().expect("revert"));
    assert_eq!(fs::read_to_string(root.join("demo.txt")).expect("read"), "before\n");

    let journal = engine.journal().expect("journal");
    let actions: Vec<JournalAction> = journal.iter().map(|v| v.entry.action).collect();
    assert_eq!(actions, vec![JournalAction::Apply, JournalAction::Revert]);
    assert_eq!(journal[0].entry.diff, journal[1].entry.diff);
    assert!(!engine.revert_last().expect("nothing open"));
}

#[test]
fn revert_last_skips_leading_revert_entries() {
    if !git_available() {
        return;
    }
    let dir = repo_with(&[("a.txt", "one\n"), ("b.txt", "y\n")]);
    let root = dir.path();
    let engine = PatchEngine::new(root);

    // d1 turns b.txt from x into y; reverting it takes the tree back to x.
    fs::write(root.join("b.txt"), "x\n").expect("edit");
    git(root, &["commit", "-q", "-am", "b at x"]);
    let d1 = diff_for(root, "b.txt", "y\n");
    fs::write(root.join("b.txt"), "y\n").expect("edit");
    git(root, &["commit", "-q", "-am", "b at y"]);
    engine.revert(&d1).expect("revert d1");
    assert_eq!(fs::read_to_string(root.join("b.txt")).expect("read"), "x\n");

    let d2 = diff_for(root, "a.txt", "two\n");
    engine.apply(&d2).expect("apply d2");

    assert!(engine.revert_last().expect("revert last"));
    assert_eq!(fs::read_to_string(root.join("a.txt")).expect("read"), "one\n");
    assert_eq!(fs::read_to_string(root.join("b.txt")).expect("read"), "x\n");
}

#[test]
fn conflicting_apply_reports_diagnostics_without_writing() {
    if !git_available() {
        return;
    }
    let dir = repo_with(&[("demo.txt", "before\n")]);
    let root = dir.path();
    let diff = diff_for(root, "demo.txt", "after\n");
    fs::write(root.join("demo.txt"), "drifted\n").expect("drift");

    let engine = PatchEngine::new(root);
    let report = engine.dry_run_apply(&diff).expect("dry run");
    assert!(!report.ok);
    assert!(!report.conflicts.is_empty());

    match engine.apply(&diff) {
        Err(PatchError::PatchConflict { conflicts }) => {
            assert!(conflicts.iter().any(|line| line.contains("demo.txt")));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(fs::read_to_string(root.join("demo.txt")).expect("read"), "drifted\n");
    assert!(engine.journal().expect("journal").is_empty());
}

#[test]
fn plain_directory_requires_version_control() {
    if !git_available() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("demo.txt"), "before\n").expect("seed");
    let engine = PatchEngine::new(dir.path());
    let diff = "--- a/demo.txt\n+++ b/demo.txt\n@@ -1 +1 @@\n-before\n+after\n";
    // A temp dir nested in someone's checkout would still be a repository.
    if Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir.path())
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
    {
        return;
    }
    assert!(matches!(engine.apply(diff), Err(PatchError::VcsRequired { .. })));
    assert!(!engine.revert_last().expect("revert_last"));
    assert_eq!(fs::read_to_string(dir.path().join("demo.txt")).expect("read"), "before\n");
}
