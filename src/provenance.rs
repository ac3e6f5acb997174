//! Source provenance: git metadata for the workspace under repair.

use crate::sandbox::{is_git_repo, run_git};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize)]
pub struct GitMetadata {
    pub is_git_repo: bool,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub remote_url: Option<String>,
    pub dirty: Option<bool>,
    /// Uncommitted diff, captured only when the tree is dirty.
    #[serde(skip_serializing)]
    pub dirty_diff: Option<String>,
}

fn non_empty(out: String) -> Option<String> {
    let trimmed = out.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Collect git metadata for a workspace. Non-repos produce the default
/// record; individual lookup failures degrade to `None`.
pub fn collect_git_metadata(root: &Path) -> GitMetadata {
    if !is_git_repo(root) {
        return GitMetadata::default();
    }

    let mut meta = GitMetadata {
        is_git_repo: true,
        ..GitMetadata::default()
    };

    meta.commit = run_git(root, &["rev-parse", "HEAD"]).ok().and_then(non_empty);
    meta.branch = run_git(root, &["rev-parse", "--abbrev-ref", "HEAD"])
        .ok()
        .and_then(non_empty);
    meta.remote_url = run_git(root, &["config", "--get", "remote.origin.url"])
        .ok()
        .and_then(non_empty);

    if let Ok(status) = run_git(root, &["status", "--porcelain"]) {
        let dirty = !status.trim().is_empty();
        meta.dirty = Some(dirty);
        if dirty {
            meta.dirty_diff = run_git(root, &["diff", "--no-color"]).ok();
        }
    }

    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::run_git as git;

    #[test]
    fn non_repo_reports_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = collect_git_metadata(tmp.path());
        assert!(!meta.is_git_repo);
        assert!(meta.commit.is_none());
        assert!(meta.dirty.is_none());
    }

    #[test]
    fn repo_reports_commit_and_dirty_diff() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init"]).unwrap();
        git(&repo, &["config", "user.name", "Patchprove Test"]).unwrap();
        git(&repo, &["config", "user.email", "test@patchprove.local"]).unwrap();
        std::fs::write(repo.join("a.txt"), "one\n").unwrap();
        git(&repo, &["add", "."]).unwrap();
        git(&repo, &["commit", "-m", "init"]).unwrap();

        let clean = collect_git_metadata(&repo);
        assert!(clean.is_git_repo);
        assert!(clean.commit.is_some());
        assert_eq!(clean.dirty, Some(false));
        assert!(clean.dirty_diff.is_none());

        std::fs::write(repo.join("a.txt"), "two\n").unwrap();
        let dirty = collect_git_metadata(&repo);
        assert_eq!(dirty.dirty, Some(true));
        assert!(dirty.dirty_diff.unwrap().contains("-one"));
    }
}
