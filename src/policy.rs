//! Policy records and the policy evaluator.
//!
//! A policy is frozen for the lifetime of a session; its canonical JSON
//! digest is recorded in the proof bundle as `policy_hash`. The evaluator is
//! pure: command allowlisting, glob-based write-path checks (deny wins), and
//! the quantitative patch limits all live here.

use crate::hashing;
use anyhow::Result;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Allow,
    Deny,
}

impl NetworkPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkPolicy::Allow => "allow",
            NetworkPolicy::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    Auto,
    Copy,
    GitWorktree,
    Container,
}

impl SandboxBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxBackend::Auto => "auto",
            SandboxBackend::Copy => "copy",
            SandboxBackend::GitWorktree => "git_worktree",
            SandboxBackend::Container => "container",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttestationMode {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
}

impl AttestationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttestationMode::None => "none",
            AttestationMode::HmacSha256 => "hmac-sha256",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Limits {
    pub max_attempts: u32,
    pub max_files_changed: usize,
    pub max_patch_bytes: usize,
    pub per_command_timeout_sec: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_files_changed: 8,
            max_patch_bytes: 200_000,
            per_command_timeout_sec: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SandboxPolicy {
    pub backend: SandboxBackend,
    pub container_runtime: String,
    pub container_image: String,
    pub container_workdir: String,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Auto,
            container_runtime: "docker".to_string(),
            container_image: "python:3.11-slim".to_string(),
            container_workdir: "/workspace".to_string(),
            cpu_limit: None,
            memory_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AttestationPolicy {
    pub enabled: bool,
    pub mode: AttestationMode,
    pub key_env: String,
}

impl Default for AttestationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AttestationMode::None,
            key_env: "PP_ATTEST_HMAC_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Policy {
    pub network: NetworkPolicy,
    pub allowed_commands: Vec<String>,
    pub allowed_argv: Vec<Vec<String>>,
    pub write_allowlist: Vec<String>,
    pub deny_write: Vec<String>,
    pub limits: Limits,
    pub minimize: bool,
    pub sandbox: SandboxPolicy,
    pub attestation: AttestationPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            network: NetworkPolicy::Deny,
            allowed_commands: Vec::new(),
            allowed_argv: Vec::new(),
            write_allowlist: vec!["**".to_string()],
            deny_write: Vec::new(),
            limits: Limits::default(),
            minimize: true,
            sandbox: SandboxPolicy::default(),
            attestation: AttestationPolicy::default(),
        }
    }
}

/// Stable, machine-readable rejection reasons surfaced per attempt and in
/// exit-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("command_not_allowed")]
    CommandNotAllowed,
    #[error("path_not_allowed")]
    PathNotAllowed,
    #[error("too_many_files")]
    TooManyFiles,
    #[error("patch_too_large")]
    PatchTooLarge,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::CommandNotAllowed => "command_not_allowed",
            RejectReason::PathNotAllowed => "path_not_allowed",
            RejectReason::TooManyFiles => "too_many_files",
            RejectReason::PatchTooLarge => "patch_too_large",
        }
    }
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    pub detail: Option<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            detail: None,
        }
    }

    fn reject(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }
}

fn matches_any(patterns: &[String], rel_path: &str) -> bool {
    patterns.iter().any(|raw| {
        Pattern::new(raw)
            .map(|pattern| pattern.matches_with(rel_path, GLOB_OPTIONS))
            .unwrap_or(false)
    })
}

impl Policy {
    /// Validate the frozen record. `max_attempts = 0` is a config error, not
    /// a runtime condition.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_attempts == 0 {
            anyhow::bail!("invalid_config: limits.max_attempts must be >= 1");
        }
        if self.limits.per_command_timeout_sec == 0 {
            anyhow::bail!("invalid_config: limits.per_command_timeout_sec must be >= 1");
        }
        Ok(())
    }

    /// Exact-match membership in `allowed_commands`, or whitespace-split argv
    /// membership in `allowed_argv`. Either list granting permission is
    /// sufficient (union semantics). No prefix matching, no shell expansion,
    /// no globs.
    pub fn is_command_allowed(&self, cmd: &str) -> bool {
        let normalized = cmd.trim();
        if self
            .allowed_commands
            .iter()
            .any(|allowed| allowed.trim() == normalized)
        {
            return true;
        }
        self.matched_argv(normalized).is_some()
    }

    /// The argv vector to execute without a shell, when the command matches
    /// one of `allowed_argv` by vector equality.
    pub fn matched_argv(&self, cmd: &str) -> Option<Vec<String>> {
        let candidate: Vec<&str> = cmd.split_whitespace().collect();
        if candidate.is_empty() {
            return None;
        }
        self.allowed_argv
            .iter()
            .find(|argv| argv.len() == candidate.len() && argv.iter().zip(&candidate).all(|(a, b)| a == b))
            .cloned()
    }

    /// Whether a normalized sandbox-relative path may be written. Deny wins
    /// on overlap; `..` segments and absolute paths are never permitted.
    pub fn is_path_allowed(&self, rel_path: &str) -> bool {
        let rel = rel_path.replace('\\', "/");
        if rel.is_empty() || rel.starts_with('/') || rel.split('/').any(|seg| seg == "..") {
            return false;
        }
        matches_any(&self.write_allowlist, &rel) && !matches_any(&self.deny_write, &rel)
    }

    /// Quantitative + path screening for a parsed patch. `paths` are the
    /// sandbox-relative targets of every file change; `patch_bytes` is the
    /// serialized diff size.
    pub fn evaluate_patch(&self, paths: &[String], patch_bytes: usize) -> PolicyDecision {
        if paths.len() > self.limits.max_files_changed {
            return PolicyDecision::reject(
                RejectReason::TooManyFiles,
                format!(
                    "patch changes {} files, above limit {}",
                    paths.len(),
                    self.limits.max_files_changed
                ),
            );
        }
        if patch_bytes > self.limits.max_patch_bytes {
            return PolicyDecision::reject(
                RejectReason::PatchTooLarge,
                format!(
                    "patch is {} bytes, above limit {}",
                    patch_bytes, self.limits.max_patch_bytes
                ),
            );
        }
        for path in paths {
            if !self.is_path_allowed(path) {
                return PolicyDecision::reject(
                    RejectReason::PathNotAllowed,
                    format!("path is not allowed by policy: {}", path),
                );
            }
        }
        PolicyDecision::allow()
    }

    /// Digest of the canonical JSON serialization of this policy.
    pub fn policy_hash(&self) -> Result<String> {
        hashing::canonical_json_hash(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with_paths(allow: &[&str], deny: &[&str]) -> Policy {
        Policy {
            write_allowlist: allow.iter().map(|s| s.to_string()).collect(),
            deny_write: deny.iter().map(|s| s.to_string()).collect(),
            ..Policy::default()
        }
    }

    #[test]
    fn command_allowlist_is_exact_match() {
        let policy = Policy {
            allowed_commands: vec!["pytest -q".to_string()],
            ..Policy::default()
        };
        assert!(policy.is_command_allowed("pytest -q"));
        assert!(policy.is_command_allowed("  pytest -q  "));
        assert!(!policy.is_command_allowed("pytest"));
        assert!(!policy.is_command_allowed("pytest -q tests/"));
    }

    #[test]
    fn argv_allowlist_grants_by_vector_equality() {
        let policy = Policy {
            allowed_argv: vec![vec!["cargo".to_string(), "test".to_string()]],
            ..Policy::default()
        };
        assert!(policy.is_command_allowed("cargo test"));
        assert_eq!(
            policy.matched_argv("cargo test"),
            Some(vec!["cargo".to_string(), "test".to_string()])
        );
        assert!(policy.matched_argv("cargo test --all").is_none());
    }

    #[test]
    fn union_semantics_either_list_grants() {
        let policy = Policy {
            allowed_commands: vec!["make check".to_string()],
            allowed_argv: vec![vec!["cargo".to_string(), "test".to_string()]],
            ..Policy::default()
        };
        assert!(policy.is_command_allowed("make check"));
        assert!(policy.is_command_allowed("cargo test"));
        assert!(!policy.is_command_allowed("rm -rf /"));
    }

    #[test]
    fn deny_wins_on_overlap() {
        let policy = policy_with_paths(&["**"], &["secrets/**"]);
        assert!(policy.is_path_allowed("src/app.py"));
        assert!(!policy.is_path_allowed("secrets/key"));
    }

    #[test]
    fn star_does_not_cross_segments() {
        let policy = policy_with_paths(&["src/*.py"], &[]);
        assert!(policy.is_path_allowed("src/app.py"));
        assert!(!policy.is_path_allowed("src/nested/app.py"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let policy = policy_with_paths(&["src/**"], &[]);
        assert!(policy.is_path_allowed("src/app.py"));
        assert!(policy.is_path_allowed("src/nested/deep/app.py"));
        assert!(!policy.is_path_allowed("tests/app.py"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let policy = policy_with_paths(&["file?.txt"], &[]);
        assert!(policy.is_path_allowed("file1.txt"));
        assert!(!policy.is_path_allowed("file12.txt"));
    }

    #[test]
    fn traversal_and_absolute_paths_rejected() {
        let policy = policy_with_paths(&["**"], &[]);
        assert!(!policy.is_path_allowed("../outside"));
        assert!(!policy.is_path_allowed("a/../../outside"));
        assert!(!policy.is_path_allowed("/etc/passwd"));
        assert!(!policy.is_path_allowed(""));
    }

    #[test]
    fn empty_allowlist_rejects_every_path() {
        let policy = policy_with_paths(&[], &[]);
        assert!(!policy.is_path_allowed("anything.txt"));
    }

    #[test]
    fn evaluate_patch_enforces_limits() {
        let mut policy = policy_with_paths(&["**"], &["secrets/**"]);
        policy.limits.max_files_changed = 2;
        policy.limits.max_patch_bytes = 100;

        let ok = policy.evaluate_patch(&["a.py".to_string()], 50);
        assert!(ok.allowed);

        let too_many = policy.evaluate_patch(
            &["a".to_string(), "b".to_string(), "c".to_string()],
            50,
        );
        assert_eq!(too_many.reason, Some(RejectReason::TooManyFiles));

        let too_large = policy.evaluate_patch(&["a.py".to_string()], 2048);
        assert_eq!(too_large.reason, Some(RejectReason::PatchTooLarge));

        let denied = policy.evaluate_patch(&["secrets/key".to_string()], 50);
        assert_eq!(denied.reason, Some(RejectReason::PathNotAllowed));
        assert_eq!(denied.reason.unwrap().as_str(), "path_not_allowed");
    }

    #[test]
    fn policy_hash_is_stable_and_sensitive() {
        let a = Policy::default();
        let b = Policy::default();
        assert_eq!(a.policy_hash().unwrap(), b.policy_hash().unwrap());

        let mut c = Policy::default();
        c.limits.max_attempts = 5;
        assert_ne!(a.policy_hash().unwrap(), c.policy_hash().unwrap());
    }

    #[test]
    fn zero_max_attempts_is_invalid_config() {
        let mut policy = Policy::default();
        policy.limits.max_attempts = 0;
        assert!(policy.validate().is_err());
    }
}
