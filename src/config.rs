//! Policy file loading and the frozen environment snapshot.
//!
//! Policy documents are YAML or JSON with the schema in `policy.rs`; unknown
//! fields are rejected with `invalid_config`. Environment variables are read
//! exactly once per session into an `EnvSnapshot` and passed around
//! explicitly from there.

use crate::policy::Policy;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const POLICY_FILE_CANDIDATES: &[&str] = &["patchprove.yaml", "patchprove.yml", "patchprove.json"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProofTarget {
    pub name: String,
    pub cmd: String,
}

/// A loaded session configuration: proof targets plus the frozen policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub proof_targets: Vec<ProofTarget>,
    pub policy: Policy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct PolicyDocument {
    proof_targets: Vec<ProofTargetSpec>,
    policy: Option<Policy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProofTargetSpec {
    name: Option<String>,
    cmd: String,
}

fn parse_document(path: &Path, text: &str) -> Result<PolicyDocument> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(text)
            .map_err(|e| anyhow!("invalid_config: failed to parse '{}': {}", path.display(), e))
    } else {
        serde_yaml::from_str(text)
            .map_err(|e| anyhow!("invalid_config: failed to parse '{}': {}", path.display(), e))
    }
}

fn build_config(document: PolicyDocument, fallback_cmd: &str) -> Result<Config> {
    let had_explicit_commands = document
        .policy
        .as_ref()
        .map(|p| !p.allowed_commands.is_empty() || !p.allowed_argv.is_empty())
        .unwrap_or(false);
    let mut policy = document.policy.unwrap_or_default();

    let mut targets: Vec<ProofTarget> = document
        .proof_targets
        .into_iter()
        .enumerate()
        .filter(|(_, spec)| !spec.cmd.trim().is_empty())
        .map(|(idx, spec)| ProofTarget {
            name: spec
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("target-{}", idx + 1)),
            cmd: spec.cmd.trim().to_string(),
        })
        .collect();

    if targets.is_empty() {
        targets.push(ProofTarget {
            name: "default".to_string(),
            cmd: fallback_cmd.trim().to_string(),
        });
    }

    // Only synthesize an allowlist when the document did not pin one. An
    // explicit allowlist is authoritative: ad-hoc commands outside it must
    // fail with command_not_allowed.
    if !had_explicit_commands {
        policy.allowed_commands = targets.iter().map(|t| t.cmd.clone()).collect();
        if !fallback_cmd.trim().is_empty()
            && !policy
                .allowed_commands
                .iter()
                .any(|c| c == fallback_cmd.trim())
        {
            policy.allowed_commands.push(fallback_cmd.trim().to_string());
        }
    }

    policy.validate()?;
    Ok(Config {
        proof_targets: targets,
        policy,
    })
}

/// Load the session configuration. Explicit `--policy` paths win; otherwise
/// the workspace root is probed for `patchprove.{yaml,yml,json}`; otherwise a
/// default policy permitting only the fallback command is synthesized.
pub fn load_config(
    policy_path: Option<&Path>,
    fallback_cmd: &str,
    workspace_root: &Path,
) -> Result<(Config, Option<PathBuf>)> {
    let resolved = match policy_path {
        Some(path) => Some(path.to_path_buf()),
        None => POLICY_FILE_CANDIDATES
            .iter()
            .map(|name| workspace_root.join(name))
            .find(|candidate| candidate.exists()),
    };

    let Some(path) = resolved else {
        let config = build_config(PolicyDocument::default(), fallback_cmd)?;
        return Ok((config, None));
    };

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read policy file '{}'", path.display()))?;
    let document = parse_document(&path, &text)?;
    let config = build_config(document, fallback_cmd)?;
    Ok((config, Some(path)))
}

/// Frozen snapshot of the process environment, captured once at session
/// start. All `PP_*` variables are recorded; attestation keys are looked up
/// through `get` and never logged.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self::capture_with_extra(&[])
    }

    /// Capture `PP_*` variables plus any extra names (e.g. a policy's
    /// `key_env` that does not follow the prefix convention).
    pub fn capture_with_extra(extra: &[&str]) -> Self {
        let mut vars: BTreeMap<String, String> = std::env::vars()
            .filter(|(name, _)| name.starts_with("PP_") || name == "OPENAI_API_KEY")
            .collect();
        for name in extra {
            if !vars.contains_key(*name) {
                if let Ok(value) = std::env::var(name) {
                    vars.insert((*name).to_string(), value);
                }
            }
        }
        Self { vars }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RejectReason;

    #[test]
    fn default_config_allows_fallback_command() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = load_config(None, "pytest -q", tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.proof_targets.len(), 1);
        assert_eq!(config.proof_targets[0].cmd, "pytest -q");
        assert!(config.policy.is_command_allowed("pytest -q"));
    }

    #[test]
    fn explicit_allowlist_is_authoritative() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patchprove.yaml");
        std::fs::write(
            &path,
            "policy:\n  allowed_commands:\n    - \"make check\"\n",
        )
        .unwrap();
        let (config, resolved) = load_config(None, "rm -rf /", tmp.path()).unwrap();
        assert_eq!(resolved.as_deref(), Some(path.as_path()));
        assert!(config.policy.is_command_allowed("make check"));
        assert!(!config.policy.is_command_allowed("rm -rf /"));
    }

    #[test]
    fn json_policy_files_parse() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patchprove.json");
        std::fs::write(
            &path,
            r#"{
  "proof_targets": [{"name": "unit", "cmd": "cargo test"}],
  "policy": {
    "write_allowlist": ["src/**"],
    "limits": {"max_attempts": 2}
  }
}"#,
        )
        .unwrap();
        let (config, _) = load_config(Some(&path), "cargo test", tmp.path()).unwrap();
        assert_eq!(config.proof_targets[0].name, "unit");
        assert_eq!(config.policy.limits.max_attempts, 2);
        assert_eq!(config.policy.limits.max_files_changed, 8);
        assert!(config.policy.is_command_allowed("cargo test"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patchprove.yaml");
        std::fs::write(&path, "policy:\n  not_a_real_field: true\n").unwrap();
        let err = load_config(Some(&path), "true", tmp.path()).unwrap_err();
        assert!(err.to_string().contains("invalid_config"));
    }

    #[test]
    fn zero_attempts_rejected_at_load_time() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patchprove.yaml");
        std::fs::write(&path, "policy:\n  limits:\n    max_attempts: 0\n").unwrap();
        assert!(load_config(Some(&path), "true", tmp.path()).is_err());
    }

    #[test]
    fn denied_patch_paths_flow_from_loaded_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patchprove.yaml");
        std::fs::write(
            &path,
            "policy:\n  write_allowlist:\n    - \"**\"\n  deny_write:\n    - \"secrets/**\"\n",
        )
        .unwrap();
        let (config, _) = load_config(Some(&path), "true", tmp.path()).unwrap();
        let decision = config
            .policy
            .evaluate_patch(&["secrets/key".to_string()], 10);
        assert_eq!(decision.reason, Some(RejectReason::PathNotAllowed));
    }

    #[test]
    fn env_snapshot_reads_once() {
        let snapshot = EnvSnapshot::from_pairs(&[("PP_PROVIDER", "stub")]);
        assert_eq!(snapshot.get("PP_PROVIDER"), Some("stub"));
        assert_eq!(snapshot.get_or("PP_OPENAI_MODEL", "gpt-4.1-mini"), "gpt-4.1-mini");
    }
}
