//! Sandbox materialization.
//!
//! Every session works inside a writable, self-contained copy of the
//! workspace rooted inside the session's artifact tree. Backends: `copy`
//! (recursive copy minus the artifact directory), `git_worktree` (detached
//! worktree at HEAD via the host git), `container` (a copy mounted into the
//! configured runtime), and `auto` (worktree for a clean git repo, copy
//! otherwise). The sandbox directory is retained on disk; it is the replay
//! material.

use crate::manifest;
use crate::policy::{NetworkPolicy, Policy, SandboxBackend};
use crate::util::run_command_with_timeout;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use walkdir::WalkDir;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGE_INSPECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Container execution settings carried by a container-backed sandbox.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub runtime: String,
    pub image: String,
    pub workdir: String,
    pub network: NetworkPolicy,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub image_id: Option<String>,
}

/// A materialized sandbox.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub root: PathBuf,
    /// Backend that was actually materialized (`auto` is resolved away).
    pub backend: SandboxBackend,
    /// How the files got there: "copy" or "git_worktree".
    pub workspace_backend: &'static str,
    /// Repository that owns the worktree, for `git worktree` bookkeeping.
    pub control_root: PathBuf,
    pub container: Option<ContainerSpec>,
}

impl Sandbox {
    pub fn is_git_worktree(&self) -> bool {
        self.workspace_backend == "git_worktree"
    }
}

pub fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .args(args);
    let output = run_command_with_timeout(&mut cmd, GIT_TIMEOUT, None)
        .map_err(|e| anyhow!("Failed to run git: {}", e))?;

    if output.timed_out {
        return Err(anyhow!(
            "git command timed out after {}s: git {}",
            GIT_TIMEOUT.as_secs(),
            args.join(" ")
        ));
    }
    if output.status.map(|s| s.success()).unwrap_or(false) {
        return Ok(output.stdout);
    }
    Err(anyhow!(
        "git {} failed:\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        output.stdout,
        output.stderr
    ))
}

pub fn is_git_repo(path: &Path) -> bool {
    run_git(path, &["rev-parse", "--is-inside-work-tree"])
        .map(|out| out.trim() == "true")
        .unwrap_or(false)
}

pub fn is_git_clean(path: &Path) -> bool {
    run_git(path, &["status", "--porcelain"])
        .map(|out| out.trim().is_empty())
        .unwrap_or(false)
}

/// Recursive copy of `src` into `dst`, skipping the artifact directory and
/// the usual cache litter.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create sandbox directory '{}'", dst.display()))?;
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk '{}'", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        if rel
            .components()
            .any(|c| manifest::is_ignored_component(&c.as_os_str().to_string_lossy()))
        {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create '{}'", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

fn copy_sandbox(workspace_root: &Path, sandbox_path: &Path) -> Result<Sandbox> {
    copy_tree(workspace_root, sandbox_path)?;
    Ok(Sandbox {
        root: sandbox_path.to_path_buf(),
        backend: SandboxBackend::Copy,
        workspace_backend: "copy",
        control_root: workspace_root.to_path_buf(),
        container: None,
    })
}

fn worktree_sandbox(workspace_root: &Path, sandbox_path: &Path) -> Result<Sandbox> {
    if let Some(parent) = sandbox_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    run_git(
        workspace_root,
        &[
            "worktree",
            "add",
            "--detach",
            &sandbox_path.to_string_lossy(),
            "HEAD",
        ],
    )
    .with_context(|| {
        format!(
            "Failed to create detached worktree '{}' from '{}'",
            sandbox_path.display(),
            workspace_root.display()
        )
    })?;

    let control_root = run_git(workspace_root, &["rev-parse", "--show-toplevel"])
        .map(|out| PathBuf::from(out.trim()))
        .unwrap_or_else(|_| workspace_root.to_path_buf());

    Ok(Sandbox {
        root: sandbox_path.to_path_buf(),
        backend: SandboxBackend::GitWorktree,
        workspace_backend: "git_worktree",
        control_root,
        container: None,
    })
}

/// First line of `<runtime> --version`, for `repro.json`.
pub fn runtime_version(runtime: &str) -> Option<String> {
    let mut cmd = Command::new(runtime);
    cmd.arg("--version");
    let output = run_command_with_timeout(&mut cmd, IMAGE_INSPECT_TIMEOUT, None).ok()?;
    if !output.status.map(|s| s.success()).unwrap_or(false) {
        return None;
    }
    output
        .stdout
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}

fn container_image_id(runtime: &str, image: &str) -> Option<String> {
    let mut cmd = Command::new(runtime);
    cmd.args(["image", "inspect", image, "--format", "{{.Id}}"]);
    let output = run_command_with_timeout(&mut cmd, IMAGE_INSPECT_TIMEOUT, None).ok()?;
    if output.status.map(|s| s.success()).unwrap_or(false) {
        let id = output.stdout.trim().to_string();
        if !id.is_empty() {
            return Some(id);
        }
    }
    None
}

/// Materialize a sandbox for the session at `sandbox_path`.
pub fn create_sandbox(
    workspace_root: &Path,
    policy: &Policy,
    sandbox_path: &Path,
) -> Result<Sandbox> {
    match policy.sandbox.backend {
        SandboxBackend::Container => {
            let runtime = policy.sandbox.container_runtime.clone();
            which::which(&runtime).map_err(|_| {
                anyhow!(
                    "Container backend requested but runtime '{}' is not available in PATH",
                    runtime
                )
            })?;
            let mut sandbox = copy_sandbox(workspace_root, sandbox_path)?;
            sandbox.backend = SandboxBackend::Container;
            sandbox.container = Some(ContainerSpec {
                image_id: container_image_id(&runtime, &policy.sandbox.container_image),
                runtime,
                image: policy.sandbox.container_image.clone(),
                workdir: policy.sandbox.container_workdir.clone(),
                network: policy.network,
                cpu_limit: policy.sandbox.cpu_limit.clone(),
                memory_limit: policy.sandbox.memory_limit.clone(),
            });
            Ok(sandbox)
        }
        SandboxBackend::Copy => copy_sandbox(workspace_root, sandbox_path),
        SandboxBackend::GitWorktree => {
            if !is_git_repo(workspace_root) {
                return Err(anyhow!(
                    "policy.sandbox.backend=git_worktree requires a git repository"
                ));
            }
            worktree_sandbox(workspace_root, sandbox_path)
        }
        SandboxBackend::Auto => {
            if is_git_repo(workspace_root) && is_git_clean(workspace_root) {
                worktree_sandbox(workspace_root, sandbox_path)
            } else {
                copy_sandbox(workspace_root, sandbox_path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    fn setup_git_repo() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        run_git(&repo, &["init"]).unwrap();
        run_git(&repo, &["config", "user.name", "Patchprove Test"]).unwrap();
        run_git(&repo, &["config", "user.email", "test@patchprove.local"]).unwrap();
        std::fs::write(repo.join("README.md"), "hello\n").unwrap();
        run_git(&repo, &["add", "."]).unwrap();
        run_git(&repo, &["commit", "-m", "init"]).unwrap();
        (root, repo)
    }

    #[test]
    fn copy_backend_excludes_artifacts_and_git() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path().join("ws");
        std::fs::create_dir_all(workspace.join(".patchprove/old")).unwrap();
        std::fs::create_dir_all(workspace.join("src")).unwrap();
        std::fs::write(workspace.join("src/app.py"), "x = 1\n").unwrap();
        std::fs::write(workspace.join(".patchprove/old/junk"), "junk").unwrap();

        let mut policy = Policy::default();
        policy.sandbox.backend = crate::policy::SandboxBackend::Copy;
        let sandbox_path = tmp.path().join("sandbox");
        let sandbox = create_sandbox(&workspace, &policy, &sandbox_path).unwrap();

        assert_eq!(sandbox.workspace_backend, "copy");
        assert!(sandbox.root.join("src/app.py").exists());
        assert!(!sandbox.root.join(".patchprove").exists());

        // Writes in the sandbox never touch the workspace.
        std::fs::write(sandbox.root.join("sandbox-only.txt"), "tmp").unwrap();
        assert!(!workspace.join("sandbox-only.txt").exists());
    }

    #[test]
    fn auto_backend_prefers_worktree_for_clean_repo() {
        let (_tmp, repo) = setup_git_repo();
        let sandbox_parent = tempfile::tempdir().unwrap();
        let sandbox_path = sandbox_parent.path().join("sandbox");

        let policy = Policy::default();
        let sandbox = create_sandbox(&repo, &policy, &sandbox_path).unwrap();
        assert_eq!(sandbox.workspace_backend, "git_worktree");
        assert!(sandbox.root.join("README.md").exists());
        assert!(sandbox.is_git_worktree());

        run_git(
            &repo,
            &["worktree", "remove", "--force", &sandbox_path.to_string_lossy()],
        )
        .unwrap();
    }

    #[test]
    fn auto_backend_falls_back_to_copy_for_dirty_repo() {
        let (_tmp, repo) = setup_git_repo();
        std::fs::write(repo.join("dirty.txt"), "uncommitted\n").unwrap();

        let sandbox_parent = tempfile::tempdir().unwrap();
        let sandbox_path = sandbox_parent.path().join("sandbox");
        let policy = Policy::default();
        let sandbox = create_sandbox(&repo, &policy, &sandbox_path).unwrap();
        assert_eq!(sandbox.workspace_backend, "copy");
        assert!(sandbox.root.join("dirty.txt").exists());
    }

    #[test]
    fn worktree_backend_requires_git_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let mut policy = Policy::default();
        policy.sandbox.backend = crate::policy::SandboxBackend::GitWorktree;
        let err = create_sandbox(tmp.path(), &policy, &tmp.path().join("sb")).unwrap_err();
        assert!(err.to_string().contains("requires a git repository"));
    }
}
