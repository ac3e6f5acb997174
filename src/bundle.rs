//! Proof-bundle writing.
//!
//! One session owns one artifact directory:
//! `<workspace>/.patchprove/<session_id>/` with the proof bundle under
//! `proof_bundle/` and the retained sandbox beside it under `sandbox/`.
//! Bundle files are written in canonical order with deterministic content;
//! `repro.json` goes last because it references digests of earlier files.
//! Artifact files are write-once.

use crate::config::Config;
use crate::hashing;
use crate::manifest::WorkspaceManifest;
use crate::policy::Policy;
use crate::proposer::Proposal;
use crate::runner::VerifyResult;
use crate::sandbox::Sandbox;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};

pub const ARTIFACT_DIR_NAME: &str = ".patchprove";

pub struct BundleWriter {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub bundle_dir: PathBuf,
}

impl BundleWriter {
    pub fn new(workspace_root: &Path, session_id: &str) -> Result<Self> {
        let session_dir = workspace_root.join(ARTIFACT_DIR_NAME).join(session_id);
        let bundle_dir = session_dir.join("proof_bundle");
        std::fs::create_dir_all(bundle_dir.join("attempts")).with_context(|| {
            format!(
                "Failed to create proof bundle directory '{}'",
                bundle_dir.display()
            )
        })?;
        Ok(Self {
            session_id: session_id.to_string(),
            session_dir,
            bundle_dir,
        })
    }

    /// Where this session's sandbox lives (sibling of the bundle, so the
    /// attestation manifest covers artifacts only).
    pub fn sandbox_dir(&self) -> PathBuf {
        self.session_dir.join("sandbox")
    }

    pub fn write_text(&self, rel_path: &str, text: &str) -> Result<PathBuf> {
        let target = self.bundle_dir.join(rel_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, text)
            .with_context(|| format!("Failed to write '{}'", target.display()))?;
        Ok(target)
    }

    /// Write a value as canonical JSON (sorted keys, two-space indent, LF,
    /// no trailing newline).
    pub fn write_json<T: Serialize>(&self, rel_path: &str, value: &T) -> Result<PathBuf> {
        let text = hashing::canonical_json(value)?;
        self.write_text(rel_path, &text)
    }

    pub fn write_policy(&self, config: &Config) -> Result<PathBuf> {
        self.write_json("policy.json", config)
    }

    pub fn write_environment(&self, sandbox: &Sandbox, policy: &Policy) -> Result<PathBuf> {
        let container = sandbox.container.as_ref();
        let mut env_whitelist = serde_json::Map::new();
        for name in ["CI", "LANG", "TZ"] {
            if let Ok(value) = std::env::var(name) {
                env_whitelist.insert(name.to_string(), json!(value));
            }
        }
        let payload = json!({
            "engine": "patchprove",
            "engine_version": env!("CARGO_PKG_VERSION"),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "sandbox_backend": sandbox.backend.as_str(),
            "workspace_backend": sandbox.workspace_backend,
            "network_policy": policy.network.as_str(),
            "container_runtime": container.map(|c| c.runtime.clone()),
            "container_image": container.map(|c| c.image.clone()),
            "container_image_id": container.and_then(|c| c.image_id.clone()),
            "container_workdir": container.map(|c| c.workdir.clone()),
            "cpu_limit": container.and_then(|c| c.cpu_limit.clone()),
            "memory_limit": container.and_then(|c| c.memory_limit.clone()),
            "env": env_whitelist,
        });
        self.write_json("environment.json", &payload)
    }

    pub fn write_workspace_manifest(&self, manifest: &WorkspaceManifest) -> Result<PathBuf> {
        self.write_json("workspace_manifest.json", manifest)
    }

    pub fn write_source_git_diff(&self, diff: &str) -> Result<PathBuf> {
        self.write_text("source_git.diff", diff)
    }

    /// Attempt verification record: tails in `verify.json`, full captures in
    /// `stdout.log` / `stderr.log` beside it.
    pub fn write_verify(&self, attempt_dir: &str, result: &VerifyResult) -> Result<PathBuf> {
        let payload = json!({
            "cmd": result.cmd,
            "exit_code": result.exit_code,
            "duration_ms": result.duration_ms,
            "stdout_tail": result.stdout_tail(),
            "stderr_tail": result.stderr_tail(),
            "timed_out": result.timed_out,
        });
        self.write_text(&format!("{}/stdout.log", attempt_dir), &result.stdout)?;
        self.write_text(&format!("{}/stderr.log", attempt_dir), &result.stderr)?;
        self.write_json(&format!("{}/verify.json", attempt_dir), &payload)
    }

    pub fn write_proposal(
        &self,
        attempt_no: u32,
        proposal: &Proposal,
        provider: &str,
    ) -> Result<PathBuf> {
        let payload = json!({
            "provider": provider,
            "diff": proposal.diff,
            "raw_response": proposal.raw_response,
            "rewrite_path": proposal.rewrite.as_ref().map(|r| r.path.clone()),
        });
        self.write_json(&format!("attempts/{}/proposed.json", attempt_no), &payload)
    }

    pub fn write_applied_patch(&self, attempt_no: u32, diff: &str) -> Result<PathBuf> {
        self.write_text(&format!("attempts/{}/applied.patch", attempt_no), diff)
    }

    pub fn write_attempt_error(&self, attempt_no: u32, message: &str) -> Result<PathBuf> {
        self.write_text(&format!("attempts/{}/error.txt", attempt_no), message)
    }

    pub fn write_final_patch(&self, diff: &str) -> Result<PathBuf> {
        self.write_text("final.patch", diff)
    }

    pub fn write_summary(&self, text: &str) -> Result<PathBuf> {
        self.write_text("final_summary.md", text)
    }

    pub fn write_repro(&self, payload: &serde_json::Value) -> Result<PathBuf> {
        self.write_json("repro.json", payload)
    }
}
