//! Unified diff parsing and policy-safe application.
//!
//! Parsing accepts the conventional `--- a/` / `+++ b/` headers, `@@` hunk
//! headers, `/dev/null` creation/deletion, and `rename from`/`rename to`
//! pairs. Application is transactional: every context and removal line is
//! verified before any byte hits disk, and an undo journal reverts partial
//! writes, so a failed apply leaves the sandbox byte-identical.

use crate::policy::{Policy, RejectReason};
use crate::util::resolve_write_path;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

static HUNK_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@@\s+-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s+@@").unwrap());

const GIT_APPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// A single line in a diff hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff.
#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    Modify,
    Create,
    Delete,
    Rename,
}

/// One file's worth of changes. Paths are sandbox-relative with the `a/` /
/// `b/` prefixes already stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChange {
    pub old_path: String,
    pub new_path: String,
    pub mode: ChangeMode,
    pub hunks: Vec<Hunk>,
}

impl FileChange {
    /// The path this change targets on disk (the surviving side).
    pub fn rel_path(&self) -> &str {
        match self.mode {
            ChangeMode::Delete => &self.old_path,
            _ => &self.new_path,
        }
    }
}

/// A parsed unified diff covering one or more files.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub files: Vec<FileChange>,
}

impl Patch {
    /// Sandbox-relative paths every file change writes or removes.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for change in &self.files {
            paths.push(change.rel_path().to_string());
            if change.mode == ChangeMode::Rename && change.old_path != change.new_path {
                paths.push(change.old_path.clone());
            }
        }
        paths
    }
}

/// A single-file full-rewrite block, the proposer's fallback framing when a
/// usable diff cannot be produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRewrite {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch_parse_error: {0}")]
    Parse(String),
    #[error("{}: {detail}", reason.as_str())]
    Rejected {
        reason: RejectReason,
        detail: String,
    },
    #[error("patch_apply_failed: {0}")]
    Apply(String),
    #[error("io_error: {0}")]
    Io(#[from] std::io::Error),
}

impl PatchError {
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            PatchError::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

fn strip_prefix(path: &str) -> String {
    let path = path.trim();
    if path == "/dev/null" {
        return path.to_string();
    }
    let path = path.split('\t').next().unwrap_or(path);
    if let Some(rest) = path.strip_prefix("a/").or_else(|| path.strip_prefix("b/")) {
        rest.to_string()
    } else {
        path.to_string()
    }
}

fn hunk_counts(hunk: &Hunk) -> (usize, usize) {
    let mut old = 0usize;
    let mut new = 0usize;
    for line in &hunk.lines {
        match line {
            DiffLine::Context(_) => {
                old += 1;
                new += 1;
            }
            DiffLine::Remove(_) => old += 1,
            DiffLine::Add(_) => new += 1,
        }
    }
    (old, new)
}

/// Parse unified-diff text into an ordered sequence of file changes.
pub fn parse_unified_diff(diff_text: &str) -> Result<Patch, PatchError> {
    let lines: Vec<&str> = diff_text.lines().collect();
    let mut idx = 0;
    let mut files: Vec<FileChange> = Vec::new();
    let mut pending_rename: Option<(String, String)> = None;

    while idx < lines.len() {
        let line = lines[idx];

        if line.starts_with("diff --git")
            || line.starts_with("index ")
            || line.starts_with("new file mode")
            || line.starts_with("deleted file mode")
            || line.starts_with("old mode")
            || line.starts_with("new mode")
            || line.starts_with("similarity index")
        {
            idx += 1;
            continue;
        }

        if let Some(from) = line.strip_prefix("rename from ") {
            let from = strip_prefix(from);
            idx += 1;
            let to = lines
                .get(idx)
                .and_then(|l| l.strip_prefix("rename to "))
                .ok_or_else(|| {
                    PatchError::Parse("'rename from' without matching 'rename to'".to_string())
                })?;
            pending_rename = Some((from, strip_prefix(to)));
            idx += 1;
            continue;
        }

        if line.starts_with("--- ") {
            let old_raw = strip_prefix(&line[4..]);
            idx += 1;
            let new_line = lines
                .get(idx)
                .filter(|l| l.starts_with("+++ "))
                .ok_or_else(|| PatchError::Parse("expected +++ line after ---".to_string()))?;
            let new_raw = strip_prefix(&new_line[4..]);
            idx += 1;

            let mode = if old_raw == "/dev/null" {
                ChangeMode::Create
            } else if new_raw == "/dev/null" {
                ChangeMode::Delete
            } else if old_raw != new_raw {
                ChangeMode::Rename
            } else {
                ChangeMode::Modify
            };
            if old_raw == "/dev/null" && new_raw == "/dev/null" {
                return Err(PatchError::Parse(
                    "patch header maps /dev/null to /dev/null".to_string(),
                ));
            }
            files.push(FileChange {
                old_path: old_raw,
                new_path: new_raw,
                mode,
                hunks: Vec::new(),
            });
            pending_rename = None;
            continue;
        }

        if line.starts_with("@@ ") {
            // A rename recorded without ---/+++ headers still carries hunks.
            if files.is_empty() && pending_rename.is_none() {
                return Err(PatchError::Parse("hunk without file header".to_string()));
            }
            if let Some((from, to)) = pending_rename.take() {
                files.push(FileChange {
                    old_path: from,
                    new_path: to,
                    mode: ChangeMode::Rename,
                    hunks: Vec::new(),
                });
            }
            let captures = HUNK_HEADER_RE
                .captures(line)
                .ok_or_else(|| PatchError::Parse(format!("malformed hunk header: {}", line)))?;
            let parse_num = |idx: usize, default: usize| -> usize {
                captures
                    .get(idx)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(default)
            };
            let mut hunk = Hunk {
                old_start: parse_num(1, 0),
                old_len: parse_num(2, 1),
                new_start: parse_num(3, 0),
                new_len: parse_num(4, 1),
                lines: Vec::new(),
            };
            idx += 1;
            while idx < lines.len() {
                let body = lines[idx];
                if body.starts_with("@@ ")
                    || body.starts_with("--- ")
                    || body.starts_with("diff --git")
                    || body.starts_with("rename from ")
                {
                    break;
                }
                if body.starts_with('\\') {
                    idx += 1;
                    continue;
                }
                if let Some(rest) = body.strip_prefix('+') {
                    hunk.lines.push(DiffLine::Add(rest.to_string()));
                } else if let Some(rest) = body.strip_prefix('-') {
                    hunk.lines.push(DiffLine::Remove(rest.to_string()));
                } else if let Some(rest) = body.strip_prefix(' ') {
                    hunk.lines.push(DiffLine::Context(rest.to_string()));
                } else if body.is_empty() {
                    hunk.lines.push(DiffLine::Context(String::new()));
                } else {
                    return Err(PatchError::Parse(format!("malformed hunk line: {}", body)));
                }
                idx += 1;
            }

            let (old_count, new_count) = hunk_counts(&hunk);
            if old_count != hunk.old_len || new_count != hunk.new_len {
                return Err(PatchError::Parse(format!(
                    "hunk size mismatch at @@ -{},{} +{},{} @@ (found {} old, {} new)",
                    hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len, old_count, new_count
                )));
            }
            files
                .last_mut()
                .expect("file header checked above")
                .hunks
                .push(hunk);
            continue;
        }

        idx += 1;
    }

    if let Some((from, to)) = pending_rename {
        files.push(FileChange {
            old_path: from,
            new_path: to,
            mode: ChangeMode::Rename,
            hunks: Vec::new(),
        });
    }

    if files.is_empty() {
        return Err(PatchError::Parse(
            "patch did not contain any files".to_string(),
        ));
    }

    for change in &files {
        let mut prev_end: Option<usize> = None;
        for hunk in &change.hunks {
            if let Some(end) = prev_end {
                if hunk.old_start < end {
                    return Err(PatchError::Parse(format!(
                        "overlapping hunks in {}",
                        change.rel_path()
                    )));
                }
            }
            prev_end = Some(hunk.old_start + hunk.old_len);
        }
    }

    Ok(Patch { files })
}

/// Render a parsed patch back to unified-diff text. Parsing the result
/// yields the same structure (round-trip law, modulo `a/`/`b/` prefixes and
/// line-ending normalization).
pub fn render_patch(patch: &Patch) -> String {
    let mut out: Vec<String> = Vec::new();
    for change in &patch.files {
        match change.mode {
            ChangeMode::Create => {
                out.push("--- /dev/null".to_string());
                out.push(format!("+++ b/{}", change.new_path));
            }
            ChangeMode::Delete => {
                out.push(format!("--- a/{}", change.old_path));
                out.push("+++ /dev/null".to_string());
            }
            ChangeMode::Rename | ChangeMode::Modify => {
                out.push(format!("--- a/{}", change.old_path));
                out.push(format!("+++ b/{}", change.new_path));
            }
        }
        for hunk in &change.hunks {
            out.push(format!(
                "@@ -{},{} +{},{} @@",
                hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len
            ));
            for line in &hunk.lines {
                match line {
                    DiffLine::Context(s) => out.push(format!(" {}", s)),
                    DiffLine::Add(s) => out.push(format!("+{}", s)),
                    DiffLine::Remove(s) => out.push(format!("-{}", s)),
                }
            }
        }
    }
    if out.is_empty() {
        String::new()
    } else {
        format!("{}\n", out.join("\n"))
    }
}

/// (file count, serialized byte size) of a diff.
pub fn patch_stats(diff_text: &str) -> Result<(usize, usize), PatchError> {
    let parsed = parse_unified_diff(diff_text)?;
    Ok((parsed.files.len(), diff_text.len()))
}

/// Whether a diff makes a real change: at least one added or removed line,
/// and not a pure shuffle where additions equal removals.
pub fn diff_has_effective_edits(diff_text: &str) -> bool {
    let mut added: Vec<&str> = Vec::new();
    let mut removed: Vec<&str> = Vec::new();
    for line in diff_text.lines() {
        if line.starts_with("diff --git")
            || line.starts_with("--- ")
            || line.starts_with("+++ ")
            || line.starts_with("@@ ")
            || line.starts_with('\\')
        {
            continue;
        }
        if let Some(rest) = line.strip_prefix('+') {
            added.push(rest);
        } else if let Some(rest) = line.strip_prefix('-') {
            removed.push(rest);
        }
    }
    if added.is_empty() && removed.is_empty() {
        return false;
    }
    added != removed
}

enum WriteOp {
    Write { rel: String, content: String },
    Remove { rel: String },
}

fn plan_file_change(
    change: &FileChange,
    sandbox_root: &Path,
    ops: &mut Vec<WriteOp>,
) -> Result<(), PatchError> {
    let rel = change.rel_path().to_string();

    let (original_lines, had_trailing_newline) = if change.mode == ChangeMode::Create {
        (Vec::new(), true)
    } else {
        let source = sandbox_root.join(&change.old_path);
        if !source.is_file() {
            return Err(PatchError::Apply(format!(
                "target file does not exist: {}",
                change.old_path
            )));
        }
        let raw = std::fs::read(&source)?;
        let text = String::from_utf8_lossy(&raw).to_string();
        let trailing = text.ends_with('\n');
        let lines: Vec<String> = text.lines().map(|s| s.to_string()).collect();
        (lines, trailing)
    };

    if change.mode == ChangeMode::Delete {
        ops.push(WriteOp::Remove { rel });
        return Ok(());
    }

    let mut lines = original_lines;
    let mut offset: isize = 0;
    for hunk in &change.hunks {
        let mut idx = hunk.old_start as isize - 1 + offset;
        if hunk.old_len == 0 {
            idx += 1;
        }
        let idx = (idx.max(0) as usize).min(lines.len());

        let mut cursor = idx;
        let mut replacement: Vec<String> = Vec::new();
        for line in &hunk.lines {
            match line {
                DiffLine::Context(expected) => {
                    if cursor >= lines.len() || lines[cursor] != *expected {
                        return Err(PatchError::Apply(format!(
                            "context mismatch applying patch to {}",
                            rel
                        )));
                    }
                    replacement.push(lines[cursor].clone());
                    cursor += 1;
                }
                DiffLine::Remove(expected) => {
                    if cursor >= lines.len() || lines[cursor] != *expected {
                        return Err(PatchError::Apply(format!(
                            "removal mismatch applying patch to {}",
                            rel
                        )));
                    }
                    cursor += 1;
                }
                DiffLine::Add(payload) => {
                    replacement.push(payload.clone());
                }
            }
        }

        let consumed = cursor - idx;
        lines.splice(idx..cursor, replacement.iter().cloned());
        offset += replacement.len() as isize - consumed as isize;
    }

    let mut content = lines.join("\n");
    if !lines.is_empty() && (had_trailing_newline || change.mode == ChangeMode::Create) {
        content.push('\n');
    }

    if change.mode == ChangeMode::Rename && change.old_path != change.new_path {
        ops.push(WriteOp::Remove {
            rel: change.old_path.clone(),
        });
    }
    ops.push(WriteOp::Write { rel, content });
    Ok(())
}

fn screen_against_policy(
    patch: &Patch,
    diff_text: &str,
    policy: &Policy,
) -> Result<(), PatchError> {
    // Quantitative limits count files; a rename is one file change even
    // though it touches two paths.
    let file_paths: Vec<String> = patch
        .files
        .iter()
        .map(|c| c.rel_path().to_string())
        .collect();
    let decision = policy.evaluate_patch(&file_paths, diff_text.len());
    if !decision.allowed {
        return Err(PatchError::Rejected {
            reason: decision.reason.unwrap_or(RejectReason::PathNotAllowed),
            detail: decision.detail.unwrap_or_default(),
        });
    }
    for change in &patch.files {
        if change.mode == ChangeMode::Rename && !policy.is_path_allowed(&change.old_path) {
            return Err(PatchError::Rejected {
                reason: RejectReason::PathNotAllowed,
                detail: format!("path is not allowed by policy: {}", change.old_path),
            });
        }
    }
    Ok(())
}

fn try_git_apply(diff_text: &str, sandbox_root: &Path) -> bool {
    let mut tmp = match tempfile::NamedTempFile::new() {
        Ok(tmp) => tmp,
        Err(_) => return false,
    };
    if tmp.write_all(diff_text.as_bytes()).is_err() {
        return false;
    }
    let mut cmd = std::process::Command::new("git");
    cmd.arg("-C")
        .arg(sandbox_root)
        .args(["apply", "--index", "--whitespace=nowarn"])
        .arg(tmp.path());
    match crate::util::run_command_with_timeout(&mut cmd, GIT_APPLY_TIMEOUT, None) {
        Ok(result) => !result.timed_out && result.status.map(|s| s.success()).unwrap_or(false),
        Err(_) => false,
    }
}

/// Validate and apply a unified diff inside the sandbox.
///
/// When `git_index` is set (the sandbox is a git worktree) `git apply` is
/// tried first; the in-process applier is the fallback and the only path for
/// copy sandboxes. Every write path is re-validated against the policy and
/// resolved through `resolve_write_path` immediately before writing.
pub fn apply_patch(
    diff_text: &str,
    sandbox_root: &Path,
    policy: &Policy,
    git_index: bool,
) -> Result<Vec<String>, PatchError> {
    let patch = parse_unified_diff(diff_text)?;
    screen_against_policy(&patch, diff_text, policy)?;

    let changed: Vec<String> = patch
        .files
        .iter()
        .map(|c| c.rel_path().to_string())
        .collect();

    if git_index && try_git_apply(diff_text, sandbox_root) {
        return Ok(changed);
    }

    // Plan phase: all context verification happens before any write.
    let mut ops: Vec<WriteOp> = Vec::new();
    for change in &patch.files {
        plan_file_change(change, sandbox_root, &mut ops)?;
    }

    execute_ops(ops, sandbox_root, policy)?;
    Ok(changed)
}

/// Atomically overwrite one file with full replacement content (the
/// proposer's single-file rewrite fallback). Subject to the same policy and
/// path-safety checks as a patch write.
pub fn apply_rewrite(
    rewrite: &FileRewrite,
    sandbox_root: &Path,
    policy: &Policy,
) -> Result<Vec<String>, PatchError> {
    if !policy.is_path_allowed(&rewrite.path) {
        return Err(PatchError::Rejected {
            reason: RejectReason::PathNotAllowed,
            detail: format!("path is not allowed by policy: {}", rewrite.path),
        });
    }
    let resolved = resolve_write_path(sandbox_root, Path::new(&rewrite.path))
        .map_err(PatchError::Apply)?;
    if let Some(parent) = resolved.absolute.parent() {
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(rewrite.content.as_bytes())?;
        tmp.persist(&resolved.absolute)
            .map_err(|e| PatchError::Apply(format!("atomic rename failed: {}", e)))?;
    }
    Ok(vec![rewrite.path.clone()])
}

fn execute_ops(
    ops: Vec<WriteOp>,
    sandbox_root: &Path,
    policy: &Policy,
) -> Result<(), PatchError> {
    // Undo journal: (relative path, original bytes if the file existed).
    let mut journal: Vec<(String, Option<Vec<u8>>)> = Vec::new();

    let result = (|| -> Result<(), PatchError> {
        for op in &ops {
            let rel = match op {
                WriteOp::Write { rel, .. } | WriteOp::Remove { rel } => rel,
            };
            if !policy.is_path_allowed(rel) {
                return Err(PatchError::Rejected {
                    reason: RejectReason::PathNotAllowed,
                    detail: format!("path is not allowed by policy: {}", rel),
                });
            }
            let resolved =
                resolve_write_path(sandbox_root, Path::new(rel)).map_err(PatchError::Apply)?;
            let original = if resolved.absolute.is_file() {
                Some(std::fs::read(&resolved.absolute)?)
            } else {
                None
            };
            journal.push((rel.clone(), original));

            match op {
                WriteOp::Write { content, .. } => {
                    if let Some(parent) = resolved.absolute.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&resolved.absolute, content)?;
                }
                WriteOp::Remove { .. } => {
                    if resolved.absolute.is_file() {
                        std::fs::remove_file(&resolved.absolute)?;
                    }
                }
            }
        }
        Ok(())
    })();

    if result.is_err() {
        for (rel, original) in journal.into_iter().rev() {
            let target = sandbox_root.join(&rel);
            match original {
                Some(bytes) => {
                    let _ = std::fs::write(&target, bytes);
                }
                None => {
                    let _ = std::fs::remove_file(&target);
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    fn open_policy() -> Policy {
        Policy::default()
    }

    fn restricted_policy(allow: &[&str], deny: &[&str]) -> Policy {
        Policy {
            write_allowlist: allow.iter().map(|s| s.to_string()).collect(),
            deny_write: deny.iter().map(|s| s.to_string()).collect(),
            ..Policy::default()
        }
    }

    const SIMPLE_DIFF: &str = "--- a/src/app.py\n+++ b/src/app.py\n@@ -1,1 +1,1 @@\n-a = 1\n+a = 2\n";

    #[test]
    fn parse_simple_diff() {
        let patch = parse_unified_diff(SIMPLE_DIFF).unwrap();
        assert_eq!(patch.files.len(), 1);
        assert_eq!(patch.files[0].rel_path(), "src/app.py");
        assert_eq!(patch.files[0].mode, ChangeMode::Modify);
        assert_eq!(patch.files[0].hunks.len(), 1);
    }

    #[test]
    fn parse_rejects_hunk_size_mismatch() {
        let diff = "--- a/x\n+++ b/x\n@@ -1,2 +1,1 @@\n-a\n+b\n";
        let err = parse_unified_diff(diff).unwrap_err();
        assert!(matches!(err, PatchError::Parse(_)));
        assert!(err.to_string().contains("hunk size mismatch"));
    }

    #[test]
    fn parse_rejects_overlapping_hunks() {
        let diff = concat!(
            "--- a/x\n+++ b/x\n",
            "@@ -1,3 +1,3 @@\n l1\n-l2\n+L2\n l3\n",
            "@@ -2,2 +2,2 @@\n-l2\n+Z2\n l3\n",
        );
        let err = parse_unified_diff(diff).unwrap_err();
        assert!(err.to_string().contains("overlapping"));
    }

    #[test]
    fn parse_rejects_missing_plus_header() {
        let err = parse_unified_diff("--- a/x\n@@ -1,1 +1,1 @@\n-a\n+b\n").unwrap_err();
        assert!(matches!(err, PatchError::Parse(_)));
    }

    #[test]
    fn parse_detects_create_delete_rename() {
        let create = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,1 @@\n+hello\n";
        assert_eq!(
            parse_unified_diff(create).unwrap().files[0].mode,
            ChangeMode::Create
        );

        let delete = "--- a/old.txt\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-bye\n";
        assert_eq!(
            parse_unified_diff(delete).unwrap().files[0].mode,
            ChangeMode::Delete
        );

        let rename = "diff --git a/one.txt b/two.txt\nrename from one.txt\nrename to two.txt\n";
        let patch = parse_unified_diff(rename).unwrap();
        assert_eq!(patch.files[0].mode, ChangeMode::Rename);
        assert_eq!(patch.files[0].old_path, "one.txt");
        assert_eq!(patch.files[0].new_path, "two.txt");
    }

    #[test]
    fn render_parse_round_trip() {
        let patch = parse_unified_diff(SIMPLE_DIFF).unwrap();
        let rendered = render_patch(&patch);
        let reparsed = parse_unified_diff(&rendered).unwrap();
        assert_eq!(patch, reparsed);
        assert_eq!(render_patch(&reparsed), rendered);
    }

    #[test]
    fn apply_modifies_file_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/app.py"), "a = 1\n").unwrap();

        let changed = apply_patch(SIMPLE_DIFF, tmp.path(), &open_policy(), false).unwrap();
        assert_eq!(changed, vec!["src/app.py".to_string()]);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("src/app.py")).unwrap(),
            "a = 2\n"
        );
    }

    #[test]
    fn apply_creates_and_deletes_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("old.txt"), "bye\n").unwrap();

        let create = "--- /dev/null\n+++ b/fresh/new.txt\n@@ -0,0 +1,1 @@\n+hello\n";
        apply_patch(create, tmp.path(), &open_policy(), false).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("fresh/new.txt")).unwrap(),
            "hello\n"
        );

        let delete = "--- a/old.txt\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-bye\n";
        apply_patch(delete, tmp.path(), &open_policy(), false).unwrap();
        assert!(!tmp.path().join("old.txt").exists());
    }

    #[test]
    fn apply_renames_with_edit() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("one.txt"), "alpha\nbeta\n").unwrap();

        let diff = "--- a/one.txt\n+++ b/two.txt\n@@ -1,2 +1,2 @@\n-alpha\n+ALPHA\n beta\n";
        let changed = apply_patch(diff, tmp.path(), &open_policy(), false).unwrap();
        assert_eq!(changed, vec!["two.txt".to_string()]);
        assert!(!tmp.path().join("one.txt").exists());
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("two.txt")).unwrap(),
            "ALPHA\nbeta\n"
        );
    }

    #[test]
    fn apply_rejects_denied_path_and_leaves_tree_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("secrets")).unwrap();
        std::fs::write(tmp.path().join("secrets/key"), "s3cret\n").unwrap();

        let diff = "--- a/secrets/key\n+++ b/secrets/key\n@@ -1,1 +1,1 @@\n-s3cret\n+evil\n";
        let policy = restricted_policy(&["**"], &["secrets/**"]);
        let err = apply_patch(diff, tmp.path(), &policy, false).unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::PathNotAllowed));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("secrets/key")).unwrap(),
            "s3cret\n"
        );
    }

    #[test]
    fn apply_rejects_oversized_patch() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "x\n").unwrap();
        let mut policy = open_policy();
        policy.limits.max_patch_bytes = 10;
        let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1,1 +1,1 @@\n-x\n+y\n";
        let err = apply_patch(diff, tmp.path(), &policy, false).unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::PatchTooLarge));
    }

    #[test]
    fn failed_apply_reverts_earlier_writes() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("good.txt"), "one\n").unwrap();
        std::fs::write(tmp.path().join("bad.txt"), "actual\n").unwrap();

        // Second file's context does not match, so the whole patch must
        // revert including the already-planned first file.
        let diff = concat!(
            "--- a/good.txt\n+++ b/good.txt\n@@ -1,1 +1,1 @@\n-one\n+ONE\n",
            "--- a/bad.txt\n+++ b/bad.txt\n@@ -1,1 +1,1 @@\n-expected\n+EXPECTED\n",
        );
        let err = apply_patch(diff, tmp.path(), &open_policy(), false).unwrap_err();
        assert!(matches!(err, PatchError::Apply(_)));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("good.txt")).unwrap(),
            "one\n"
        );
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("bad.txt")).unwrap(),
            "actual\n"
        );
    }

    #[test]
    fn context_mismatch_is_apply_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), "different\n").unwrap();
        let diff = "--- a/x.txt\n+++ b/x.txt\n@@ -1,1 +1,1 @@\n-expected\n+changed\n";
        let err = apply_patch(diff, tmp.path(), &open_policy(), false).unwrap_err();
        assert!(err.to_string().contains("patch_apply_failed"));
    }

    #[test]
    fn rewrite_fallback_respects_policy() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("app.py"), "broken\n").unwrap();

        let rewrite = FileRewrite {
            path: "app.py".to_string(),
            content: "fixed\n".to_string(),
        };
        apply_rewrite(&rewrite, tmp.path(), &open_policy()).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("app.py")).unwrap(),
            "fixed\n"
        );

        let denied = FileRewrite {
            path: "secrets/key".to_string(),
            content: "evil\n".to_string(),
        };
        let policy = restricted_policy(&["app.py"], &[]);
        let err = apply_rewrite(&denied, tmp.path(), &policy).unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::PathNotAllowed));
    }

    #[test]
    fn stats_count_files_and_bytes() {
        let (files, bytes) = patch_stats(SIMPLE_DIFF).unwrap();
        assert_eq!(files, 1);
        assert_eq!(bytes, SIMPLE_DIFF.len());
    }

    #[test]
    fn effective_edit_detection() {
        assert!(diff_has_effective_edits(SIMPLE_DIFF));
        assert!(!diff_has_effective_edits(""));
        let noop = "--- a/x\n+++ b/x\n@@ -1,1 +1,1 @@\n-same\n+same\n";
        assert!(!diff_has_effective_edits(noop));
    }
}
