//! Normalization of model-produced unified diffs before they reach git.

use crate::PatchError;

pub const BEGIN_PATCH: &str = "*** Begin Patch";
pub const END_PATCH: &str = "*** End Patch";

/// Cleans a framed or bare unified diff.
///
/// Line endings become `\n`, control characters other than tab/CR/LF are
/// dropped, the `*** Begin Patch`/`*** End Patch` framing is removed, shell
/// substitution syntax outside hunk bodies is neutralized, and every header
/// path is checked for absolute or parent-directory components. The result
/// is a fixed point: sanitizing it again yields the same text.
pub fn sanitize(diff: &str) -> Result<String, PatchError> {
    let normalized = diff.replace("\r\n", "\n").replace('\r', "\n");
    let cleaned: String = normalized
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect();

    let mut out = String::with_capacity(cleaned.len());
    for line in strip_framing(&cleaned) {
        let line = if is_hunk_body(line) {
            line.to_string()
        } else {
            neutralize_shell(line)
        };
        for path in header_paths(&line) {
            check_header_path(&path)?;
        }
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Returns the last complete `*** Begin Patch` … `*** End Patch` block in
/// `text`, with the marker lines re-emitted unindented.
pub fn extract_patch_block(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut found = None;
    let mut begin: Option<usize> = None;
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed == BEGIN_PATCH {
            begin = Some(idx);
        } else if trimmed == END_PATCH
            && let Some(start) = begin.take()
        {
            found = Some((start, idx));
        }
    }
    let (start, end) = found?;
    let mut block = String::from(BEGIN_PATCH);
    block.push('\n');
    for line in &lines[start + 1..end] {
        block.push_str(line);
        block.push('\n');
    }
    block.push_str(END_PATCH);
    block.push('\n');
    Some(block)
}

/// Files named by the diff's headers (`---`/`+++`, `diff --git`, and
/// rename or copy lines), in first-seen order.
pub fn target_files(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in diff.lines() {
        for path in header_paths(line) {
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }
    files
}

fn strip_framing(text: &str) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let begin = lines.iter().position(|l| is_marker(l, BEGIN_PATCH));
    let body: &[&str] = match begin {
        Some(start) => {
            let rest = &lines[start + 1..];
            match rest.iter().rposition(|l| is_marker(l, END_PATCH)) {
                Some(end) => &rest[..end],
                None => rest,
            }
        }
        None => &lines[..],
    };
    body.iter()
        .copied()
        .filter(|l| !is_marker(l, BEGIN_PATCH) && !is_marker(l, END_PATCH))
        .collect()
}

/// A framing line. Hunk lines that merely contain the marker text are content.
fn is_marker(line: &str, marker: &str) -> bool {
    !is_hunk_body(line) && line.trim() == marker
}

fn is_hunk_body(line: &str) -> bool {
    if line.starts_with("--- ") || line.starts_with("+++ ") {
        return false;
    }
    line.is_empty()
        || line.starts_with(' ')
        || line.starts_with('+')
        || line.starts_with('-')
        || line.starts_with('\\')
}

fn neutralize_shell(line: &str) -> String {
    line.replace("$(", "$\\(").replace('`', "'")
}

fn header_paths(line: &str) -> Vec<String> {
    if let Some(raw) = line
        .strip_prefix("--- ")
        .or_else(|| line.strip_prefix("+++ "))
    {
        return parse_header_path(raw).into_iter().collect();
    }
    if let Some(rest) = line.strip_prefix("diff --git ") {
        return rest
            .split_whitespace()
            .filter_map(parse_header_path)
            .collect();
    }
    for prefix in ["rename from ", "rename to ", "copy from ", "copy to "] {
        if let Some(raw) = line.strip_prefix(prefix) {
            return vec![raw.trim().to_string()];
        }
    }
    Vec::new()
}

fn parse_header_path(raw: &str) -> Option<String> {
    // Headers may carry a tab-separated timestamp after the path.
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw.is_empty() || raw == "/dev/null" {
        return None;
    }
    let normalized = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(normalized.to_string())
}

fn check_header_path(path: &str) -> Result<(), PatchError> {
    let bytes = path.as_bytes();
    let absolute = path.starts_with('/')
        || path.starts_with('\\')
        || path.starts_with('~')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':');
    let traverses = path.split(['/', '\\']).any(|segment| segment == "..");
    if absolute || traverses || path.is_empty() {
        return Err(PatchError::PathTraversal {
            path: path.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SIMPLE: &str = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-old\n+new\n";

    #[test]
    fn strips_framing_markers() {
        let framed = format!("Here you go:\n{BEGIN_PATCH}\n{SIMPLE}{END_PATCH}\nthanks");
        assert_eq!(sanitize(&framed).expect("sanitize"), SIMPLE);
    }

    #[test]
    fn normalizes_line_endings_and_control_characters() {
        let dirty = "--- a/x.txt\r\n+++ b/x.txt\r\n@@ -1 +1 @@\r\n-a\u{7}\r\n+b\tc\u{0}\r";
        assert_eq!(
            sanitize(dirty).expect("sanitize"),
            "--- a/x.txt\n+++ b/x.txt\n@@ -1 +1 @@\n-a\n+b\tc\n"
        );
    }

    #[test]
    fn neutralizes_substitution_outside_hunk_bodies_only() {
        let diff = "diff --git a/run.sh b/run.sh\nindex $(whoami)..`id`\n--- a/run.sh\n+++ b/run.sh\n@@ -1 +1 @@\n-echo $(date)\n+echo `date`\n";
        let out = sanitize(diff).expect("sanitize");
        assert!(out.contains("index $\\(whoami)..'id'"));
        assert!(out.contains("-echo $(date)\n+echo `date`\n"));
    }

    #[test]
    fn rejects_parent_directory_headers() {
        let diff = "--- a/../../etc/passwd\n+++ b/../../etc/passwd\n@@ -1 +1 @@\n-x\n+y\n";
        assert!(matches!(
            sanitize(diff),
            Err(PatchError::PathTraversal { path }) if path == "../../etc/passwd"
        ));
    }

    #[test]
    fn rejects_absolute_headers() {
        for diff in [
            "--- /etc/passwd\n+++ /etc/passwd\n",
            "--- a//etc/passwd\n+++ b//etc/passwd\n",
            "diff --git a/C:/win.ini b/C:/win.ini\n",
            "rename to /tmp/evil\n",
        ] {
            assert!(
                matches!(sanitize(diff), Err(PatchError::PathTraversal { .. })),
                "accepted {diff:?}"
            );
        }
    }

    #[test]
    fn marker_text_inside_a_hunk_is_content() {
        let diff = "--- a/notes.md\n+++ b/notes.md\n@@ -1,2 +1,2 @@\n *** End Patch\n-old\n+*** Begin Patch\n";
        let framed = format!("{BEGIN_PATCH}\n{diff}{END_PATCH}\n");
        let out = sanitize(&framed).expect("sanitize");
        assert_eq!(out, diff);
        assert_eq!(sanitize(&out).expect("second pass"), out);
    }

    #[test]
    fn target_files_include_rename_and_copy_headers() {
        let diff = "diff --git a/secret.txt b/moved.txt\nsimilarity index 100%\nrename from secret.txt\nrename to moved.txt\n";
        assert_eq!(
            target_files(diff),
            vec!["secret.txt".to_string(), "moved.txt".to_string()]
        );
    }

    #[test]
    fn dev_null_headers_are_allowed() {
        let diff = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hello\n";
        assert_eq!(sanitize(diff).expect("sanitize"), diff);
        assert_eq!(target_files(diff), vec!["new.txt".to_string()]);
    }

    #[test]
    fn extracts_last_complete_patch_block() {
        let text = format!(
            "first\n{BEGIN_PATCH}\nold\n{END_PATCH}\nthen\n  {BEGIN_PATCH}\n{SIMPLE}  {END_PATCH}\ntrailing {BEGIN_PATCH}"
        );
        let block = extract_patch_block(&text).expect("block");
        assert_eq!(block, format!("{BEGIN_PATCH}\n{SIMPLE}{END_PATCH}\n"));
        assert!(extract_patch_block("no markers here").is_none());
        assert!(extract_patch_block(&format!("{BEGIN_PATCH}\nunterminated")).is_none());
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent(input in any::<String>()) {
            if let Ok(once) = sanitize(&input) {
                prop_assert_eq!(sanitize(&once).expect("second pass"), once);
            }
        }

        #[test]
        fn sanitize_is_idempotent_on_diff_like_text(
            lines in prop::collection::vec(
                prop_oneof![
                    Just("*** Begin Patch".to_string()),
                    Just("*** End Patch".to_string()),
                    Just("--- a/src/main.rs".to_string()),
                    Just("+++ b/src/main.rs".to_string()),
                    Just("@@ -1,2 +1,2 @@".to_string()),
                    "[ +-][a-z$()`\\t\\r ]{0,12}",
                    "[a-z$()`\\x01\\x1b]{0,12}",
                ],
                0..12,
            )
        ) {
            let input = lines.join("\r\n");
            let once = sanitize(&input).expect("diff-like text has safe paths");
            prop_assert_eq!(sanitize(&once).expect("second pass"), once);
        }
    }
}
