//! Workspace manifests and directory diffing.
//!
//! The manifest records every file in the user's workspace (path, sha256,
//! size) before the run, excluding the artifact directory and `.git/`. Its
//! `root_sha256` pins the whole tree so replay can prove it is working
//! against the same sources. `diff_between_dirs` produces the cumulative
//! `final.patch` between the pristine workspace and the sandbox.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::hashing;

/// Directory names never copied into sandboxes nor recorded in manifests.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".patchprove",
    "__pycache__",
    ".pytest_cache",
];

const TEXT_PROBE_BYTES: usize = 8192;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub files: Vec<ManifestEntry>,
    pub root_sha256: String,
}

pub fn is_ignored_component(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

fn should_skip(rel: &str) -> bool {
    rel.split('/').any(is_ignored_component)
}

/// Walk a directory and return sorted relative paths of regular files,
/// skipping the ignore set.
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk '{}'", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if should_skip(&rel) {
            continue;
        }
        paths.push(rel);
    }
    paths.sort();
    Ok(paths)
}

/// Build the pre-run manifest of the workspace.
pub fn build_workspace_manifest(root: &Path) -> Result<WorkspaceManifest> {
    let mut files = Vec::new();
    for rel in list_files(root)? {
        let (sha256, size) = hashing::sha256_file(&root.join(&rel))?;
        files.push(ManifestEntry {
            path: rel,
            sha256,
            size,
        });
    }

    let mut rollup = String::new();
    for entry in &files {
        rollup.push_str(&entry.path);
        rollup.push('\t');
        rollup.push_str(&entry.sha256);
        rollup.push('\n');
    }
    let root_sha256 = hashing::sha256_hex(rollup.as_bytes());

    Ok(WorkspaceManifest { files, root_sha256 })
}

/// Heuristic text check: no NUL byte in the first 8 KiB.
pub fn is_probably_text(bytes: &[u8]) -> bool {
    !bytes
        .iter()
        .take(TEXT_PROBE_BYTES)
        .any(|&b| b == 0)
}

fn read_text_file(path: &Path) -> Result<Option<String>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    if !is_probably_text(&bytes) {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&bytes).to_string()))
}

fn unified_file_diff(rel: &str, old: Option<&str>, new: Option<&str>) -> String {
    let old_text = old.unwrap_or("");
    let new_text = new.unwrap_or("");
    if old_text == new_text {
        return String::new();
    }
    let old_header = if old.is_some() {
        format!("a/{}", rel)
    } else {
        "/dev/null".to_string()
    };
    let new_header = if new.is_some() {
        format!("b/{}", rel)
    } else {
        "/dev/null".to_string()
    };
    let diff = TextDiff::from_lines(old_text, new_text);
    diff.unified_diff()
        .context_radius(3)
        .header(&old_header, &new_header)
        .to_string()
}

/// Cumulative unified diff between two directory trees, restricted to text
/// files and the manifest ignore rules. Empty string when the trees match.
pub fn diff_between_dirs(base_dir: &Path, new_dir: &Path) -> Result<String> {
    let base_files: BTreeMap<String, ()> =
        list_files(base_dir)?.into_iter().map(|p| (p, ())).collect();
    let new_files: BTreeMap<String, ()> =
        list_files(new_dir)?.into_iter().map(|p| (p, ())).collect();

    let mut all_paths: Vec<&String> = base_files.keys().chain(new_files.keys()).collect();
    all_paths.sort();
    all_paths.dedup();

    let mut chunks: Vec<String> = Vec::new();
    for rel in all_paths {
        let base_text = if base_files.contains_key(rel) {
            read_text_file(&base_dir.join(rel))?
        } else {
            None
        };
        let new_text = if new_files.contains_key(rel) {
            read_text_file(&new_dir.join(rel))?
        } else {
            None
        };

        // A binary file on either side is excluded from the patch.
        if base_files.contains_key(rel) && base_text.is_none() {
            continue;
        }
        if new_files.contains_key(rel) && new_text.is_none() {
            continue;
        }

        let chunk = unified_file_diff(rel, base_text.as_deref(), new_text.as_deref());
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
    }

    Ok(chunks.concat())
}

/// Generate a unified diff replacing a file's entire content, used when the
/// proposer answers with a full-file rewrite block.
pub fn full_file_diff(rel: &str, before: &str, after: &str) -> String {
    unified_file_diff(rel, Some(before), Some(after))
}
