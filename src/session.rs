//! Session orchestration: baseline, attempt loop, finalization, and replay.
//!
//! One `SessionController::run` drives a single session from baseline to a
//! terminal outcome. The loop is strictly serial with one child process at a
//! time; every attempt's artifacts are flushed before the next attempt
//! starts, so a crash or cancellation leaves a valid partial bundle.

use crate::attest;
use crate::bundle::BundleWriter;
use crate::config::{load_config, Config, EnvSnapshot, ProofTarget};
use crate::context::{extract_context, ContextSlice};
use crate::hashing;
use crate::manifest;
use crate::minimize::minimize_patch_hunks;
use crate::patch::{self, PatchError};
use crate::policy::{Policy, SandboxBackend};
use crate::proposer::{create_proposer, Proposal, ProposalInput, Proposer};
use crate::provenance;
use crate::redact::redact_text;
use crate::runner::{run_verify, VerifyResult};
use crate::sandbox::{self, ContainerSpec, Sandbox};
use anyhow::Context as AnyhowContext;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

const EDITABLE_FILES_MAX: usize = 6;
const EDITABLE_FILE_MAX_CHARS: usize = 16_000;
const SUMMARY_OUTPUT_MAX_CHARS: usize = 4_000;

/// Cooperative cancellation handle. Set from a signal handler; checked at
/// every suspension point and inside the child-process wait loop.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn as_atomic(&self) -> &AtomicBool {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResult {
    Pass,
    Fail,
    Error,
}

impl SessionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionResult::Pass => "pass",
            SessionResult::Fail => "fail",
            SessionResult::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pass,
    Fail,
    Rejected,
    Error,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Pass => "pass",
            AttemptOutcome::Fail => "fail",
            AttemptOutcome::Rejected => "rejected",
            AttemptOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub index: u32,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub policy_path: Option<PathBuf>,
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub session_id: String,
    pub result: SessionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub command: String,
    pub attempts_used: u32,
    pub final_exit_code: i32,
    pub bundle_dir: PathBuf,
    pub final_patch_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_path: Option<PathBuf>,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Serialize)]
pub struct ReplayTargetResult {
    pub name: String,
    pub cmd: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub passed: bool,
}

#[derive(Debug, Serialize)]
pub struct ReplaySummary {
    pub ok: bool,
    pub attestation_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<attest::VerifyOutcome>,
    pub targets: Vec<ReplayTargetResult>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("command_not_allowed: command is not allowed by policy: {0}")]
    CommandNotAllowed(String),
    #[error("{0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn classify_config_error(err: anyhow::Error) -> SessionError {
    let message = err.to_string();
    if message.contains("invalid_config") {
        SessionError::InvalidConfig(message)
    } else {
        SessionError::Internal(err)
    }
}

/// Current content of policy-writable text files in the sandbox, bounded for
/// the proposer prompt.
fn collect_editable_files(sandbox_root: &Path, policy: &Policy) -> BTreeMap<String, String> {
    let mut editable = BTreeMap::new();
    let Ok(files) = manifest::list_files(sandbox_root) else {
        return editable;
    };
    for rel in files {
        if editable.len() >= EDITABLE_FILES_MAX {
            break;
        }
        if !policy.is_path_allowed(&rel) {
            continue;
        }
        let Ok(bytes) = std::fs::read(sandbox_root.join(&rel)) else {
            continue;
        };
        if !manifest::is_probably_text(&bytes) {
            continue;
        }
        let content = String::from_utf8_lossy(&bytes).to_string();
        editable.insert(rel, crate::util::truncate(&content, EDITABLE_FILE_MAX_CHARS));
    }
    editable
}

fn redacted_context(context: ContextSlice) -> ContextSlice {
    ContextSlice {
        locations: context.locations,
        snippets: context
            .snippets
            .into_iter()
            .map(|(key, snippet)| (key, redact_text(&snippet)))
            .collect(),
        failing_assertions: context
            .failing_assertions
            .iter()
            .map(|a| redact_text(a))
            .collect(),
    }
}

/// Apply a proposal to the sandbox: git apply / in-process applier first,
/// then the single-file rewrite fallback. Returns the diff that was actually
/// applied. Policy rejections never fall through to the rewrite.
fn apply_proposal(
    proposal: &Proposal,
    sandbox: &Sandbox,
    policy: &Policy,
) -> Result<String, PatchError> {
    let patch_result = patch::apply_patch(
        &proposal.diff,
        &sandbox.root,
        policy,
        sandbox.is_git_worktree(),
    );
    match patch_result {
        Ok(_) => Ok(proposal.diff.clone()),
        Err(err) => {
            if err.reject_reason().is_some() {
                return Err(err);
            }
            let Some(rewrite) = &proposal.rewrite else {
                return Err(err);
            };
            let before = std::fs::read_to_string(sandbox.root.join(&rewrite.path))
                .unwrap_or_default();
            patch::apply_rewrite(rewrite, &sandbox.root, policy)?;
            Ok(manifest::full_file_diff(&rewrite.path, &before, &rewrite.content))
        }
    }
}

pub struct SessionController {
    workspace_root: PathBuf,
    cancel: CancelFlag,
}

impl SessionController {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run one session for an ad-hoc target command.
    pub fn run(&self, command: &str, options: &RunOptions) -> Result<RunSummary, SessionError> {
        let (config, _policy_path) =
            load_config(options.policy_path.as_deref(), command, &self.workspace_root)
                .map_err(classify_config_error)?;
        let env = EnvSnapshot::capture_with_extra(&[config.policy.attestation.key_env.as_str()]);
        let proposer = create_proposer(options.provider.as_deref(), &env)
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        self.run_with_proposer(command, &config, &env, proposer.as_ref())
    }

    /// Run every configured proof target in order.
    pub fn prove(
        &self,
        options: &RunOptions,
    ) -> Result<Vec<(ProofTarget, RunSummary)>, SessionError> {
        let (config, _) = load_config(options.policy_path.as_deref(), "", &self.workspace_root)
            .map_err(classify_config_error)?;
        let env = EnvSnapshot::capture_with_extra(&[config.policy.attestation.key_env.as_str()]);
        let proposer = create_proposer(options.provider.as_deref(), &env)
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

        let mut results = Vec::new();
        for target in &config.proof_targets {
            if target.cmd.trim().is_empty() {
                continue;
            }
            let summary = self.run_with_proposer(&target.cmd, &config, &env, proposer.as_ref())?;
            results.push((target.clone(), summary));
        }
        if results.is_empty() {
            return Err(SessionError::InvalidConfig(
                "invalid_config: no proof targets configured".to_string(),
            ));
        }
        Ok(results)
    }

    /// The session engine proper, with the proposer injected (the test seam).
    pub fn run_with_proposer(
        &self,
        command: &str,
        config: &Config,
        env: &EnvSnapshot,
        proposer: &dyn Proposer,
    ) -> Result<RunSummary, SessionError> {
        let started_at = Utc::now();
        let start_instant = Instant::now();
        let policy = &config.policy;

        if !policy.is_command_allowed(command) {
            return Err(SessionError::CommandNotAllowed(command.to_string()));
        }

        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let writer = BundleWriter::new(&self.workspace_root, &session_id)?;
        info!(session_id = %session_id, command = %command, "session started");

        let workspace_manifest = manifest::build_workspace_manifest(&self.workspace_root)?;
        let git_meta = provenance::collect_git_metadata(&self.workspace_root);
        let sandbox = sandbox::create_sandbox(&self.workspace_root, policy, &writer.sandbox_dir())?;

        writer.write_policy(config)?;
        writer.write_environment(&sandbox, policy)?;
        writer.write_workspace_manifest(&workspace_manifest)?;
        if let Some(diff) = &git_meta.dirty_diff {
            writer.write_source_git_diff(diff)?;
        }

        let timeout = Duration::from_secs(policy.limits.per_command_timeout_sec);
        let argv = policy.matched_argv(command);

        let baseline = run_verify(
            command,
            &sandbox.root,
            timeout,
            Some(&sandbox),
            argv.as_deref(),
            Some(self.cancel.as_atomic()),
        );
        writer.write_verify("attempts/0_baseline", &baseline)?;

        let mut final_result = baseline.clone();
        let mut success = baseline.passed();
        let mut canceled = baseline.canceled;
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut previous_errors: Vec<String> = Vec::new();

        // The baseline consumes one attempt; the proposer gets the rest.
        let proposer_budget = policy.limits.max_attempts.saturating_sub(1);

        if !success && !canceled {
            for attempt_no in 1..=proposer_budget {
                if self.cancel.is_canceled() {
                    canceled = true;
                    break;
                }

                let context = redacted_context(extract_context(
                    &final_result.combined_output(),
                    &sandbox.root,
                ));
                let sanitized_output = redact_text(&final_result.combined_output());
                let editable_files = collect_editable_files(&sandbox.root, policy);
                let input = ProposalInput {
                    command,
                    failure_output: sanitized_output,
                    context: &context,
                    previous_attempts: &previous_errors,
                    write_allowlist: &policy.write_allowlist,
                    deny_write: &policy.deny_write,
                    editable_files: &editable_files,
                };

                let proposal = match proposer.propose(&input) {
                    Ok(proposal) => proposal,
                    Err(err) => {
                        let message = format!("proposer_error: {}", err);
                        warn!(attempt = attempt_no, "{}", message);
                        writer.write_attempt_error(attempt_no, &message)?;
                        attempts.push(AttemptRecord {
                            index: attempt_no,
                            outcome: AttemptOutcome::Error,
                            reject_reason: None,
                            error: Some(message.clone()),
                            exit_code: None,
                            timed_out: false,
                        });
                        previous_errors.push(message);
                        continue;
                    }
                };
                writer.write_proposal(attempt_no, &proposal, proposer.name())?;

                let is_noop = !patch::diff_has_effective_edits(&proposal.diff)
                    && proposal.rewrite.is_none();
                if is_noop {
                    // A strict no-op is counted once; further attempts would
                    // only replay it, so the loop terminates.
                    let message = "proposer returned an empty or no-op diff".to_string();
                    warn!(attempt = attempt_no, "{}", message);
                    writer.write_attempt_error(attempt_no, &message)?;
                    attempts.push(AttemptRecord {
                        index: attempt_no,
                        outcome: AttemptOutcome::Rejected,
                        reject_reason: Some("noop".to_string()),
                        error: Some(message.clone()),
                        exit_code: None,
                        timed_out: false,
                    });
                    previous_errors.push(message);
                    break;
                }

                let applied_diff = match apply_proposal(&proposal, &sandbox, policy) {
                    Ok(applied) => applied,
                    Err(err) => {
                        let reject_reason = err.reject_reason().map(|r| r.as_str().to_string());
                        let message = err.to_string();
                        warn!(attempt = attempt_no, "{}", message);
                        writer.write_attempt_error(attempt_no, &message)?;
                        attempts.push(AttemptRecord {
                            index: attempt_no,
                            outcome: AttemptOutcome::Rejected,
                            reject_reason,
                            error: Some(message.clone()),
                            exit_code: None,
                            timed_out: false,
                        });
                        previous_errors.push(message);
                        continue;
                    }
                };
                writer.write_applied_patch(attempt_no, &applied_diff)?;

                let verify = run_verify(
                    command,
                    &sandbox.root,
                    timeout,
                    Some(&sandbox),
                    argv.as_deref(),
                    Some(self.cancel.as_atomic()),
                );
                writer.write_verify(&format!("attempts/{}", attempt_no), &verify)?;
                canceled |= verify.canceled;

                attempts.push(AttemptRecord {
                    index: attempt_no,
                    outcome: if verify.passed() {
                        AttemptOutcome::Pass
                    } else {
                        AttemptOutcome::Fail
                    },
                    reject_reason: None,
                    error: None,
                    exit_code: Some(verify.exit_code),
                    timed_out: verify.timed_out,
                });

                let exit_code = verify.exit_code;
                final_result = verify;
                if final_result.passed() {
                    success = true;
                    break;
                }
                if canceled {
                    break;
                }
                previous_errors.push(format!(
                    "attempt {} verify failed with exit code {}",
                    attempt_no, exit_code
                ));
            }
        }

        // The cumulative patch exists only for passing sessions; failed
        // attempts are already recorded under attempts/.
        let mut final_patch = if success {
            manifest::diff_between_dirs(&self.workspace_root, &sandbox.root)?
        } else {
            String::new()
        };
        if success && policy.minimize && !canceled && !final_patch.trim().is_empty() {
            let minimized = minimize_patch_hunks(
                &final_patch,
                &self.workspace_root,
                command,
                timeout,
                policy,
                Some(&sandbox),
            )?;
            if !minimized.trim().is_empty() {
                final_patch = minimized;
            }
        }
        let final_patch_path = writer.write_final_patch(&final_patch)?;

        let result = if canceled {
            SessionResult::Error
        } else if success {
            SessionResult::Pass
        } else {
            SessionResult::Fail
        };
        let reason = canceled.then(|| "canceled".to_string());

        let policy_hash = policy.policy_hash()?;
        let summary_text = render_summary(
            result,
            command,
            attempts.len() as u32,
            &final_result,
            &policy_hash,
            policy,
        );
        writer.write_summary(&summary_text)?;

        let ended_at = Utc::now();
        let container = sandbox.container.as_ref();
        let repro = json!({
            "session_id": session_id,
            "command": command,
            "argv": argv,
            "policy_hash": policy_hash,
            "workspace_root": &self.workspace_root,
            "workspace_manifest_sha256": hashing::canonical_json_hash(&workspace_manifest)?,
            "provider": proposer.name(),
            "sandbox_backend": sandbox.backend.as_str(),
            "workspace_backend": sandbox.workspace_backend,
            "container_runtime_version": container.and_then(|c| sandbox::runtime_version(&c.runtime)),
            "git_commit": git_meta.commit,
            "git_branch": git_meta.branch,
            "git_remote_url": git_meta.remote_url,
            "git_dirty": git_meta.dirty.unwrap_or(false),
            "started_at": started_at.to_rfc3339(),
            "ended_at": ended_at.to_rfc3339(),
            "duration_ms": start_instant.elapsed().as_millis() as u64,
            "attempts_used": attempts.len() as u32,
            "result": result.as_str(),
            "reason": &reason,
            "proof_targets": &config.proof_targets,
        });
        writer.write_repro(&repro)?;

        let attestation_path = if policy.attestation.enabled {
            Some(attest::create_attestation(
                &writer.bundle_dir,
                policy.attestation.mode,
                &policy.attestation.key_env,
                env,
            )?)
        } else {
            None
        };

        info!(
            session_id = %session_id,
            result = result.as_str(),
            attempts_used = attempts.len(),
            "session finished"
        );

        Ok(RunSummary {
            session_id,
            result,
            reason,
            command: command.to_string(),
            attempts_used: attempts.len() as u32,
            final_exit_code: final_result.exit_code,
            bundle_dir: writer.bundle_dir,
            final_patch_path,
            attestation_path,
            attempts,
        })
    }

    /// Replay a proof bundle: rebuild a sandbox from the recorded manifest,
    /// apply `final.patch`, and rerun every recorded proof target under the
    /// recorded policy.
    pub fn replay(
        &self,
        bundle_dir: &Path,
        cwd_override: Option<&Path>,
        verify_bundle_attestation: bool,
    ) -> Result<ReplaySummary, SessionError> {
        let env = EnvSnapshot::capture();

        let mut attestation = None;
        if verify_bundle_attestation {
            let outcome = attest::verify_attestation(bundle_dir, &env)?;
            let ok = outcome.ok;
            attestation = Some(outcome);
            if !ok {
                return Ok(ReplaySummary {
                    ok: false,
                    attestation_failed: true,
                    attestation,
                    targets: Vec::new(),
                });
            }
        }

        let repro: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(bundle_dir.join("repro.json"))
                .with_context(|| format!("Missing repro.json in '{}'", bundle_dir.display()))?,
        )
        .context("Failed to parse repro.json")?;
        let config: Config = serde_json::from_str(
            &std::fs::read_to_string(bundle_dir.join("policy.json"))
                .with_context(|| format!("Missing policy.json in '{}'", bundle_dir.display()))?,
        )
        .context("Failed to parse policy.json")?;
        let recorded_manifest: manifest::WorkspaceManifest = serde_json::from_str(
            &std::fs::read_to_string(bundle_dir.join("workspace_manifest.json")).with_context(
                || format!("Missing workspace_manifest.json in '{}'", bundle_dir.display()),
            )?,
        )
        .context("Failed to parse workspace_manifest.json")?;

        let source_root = match cwd_override {
            Some(path) => path.to_path_buf(),
            None => repro
                .get("workspace_root")
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
                .unwrap_or_else(|| self.workspace_root.clone()),
        };

        // Fresh scratch sandbox built strictly from manifested files.
        let scratch = tempfile::tempdir().context("Failed to create replay sandbox")?;
        let replay_root = scratch.path().join("workspace");
        for entry in &recorded_manifest.files {
            let source = source_root.join(&entry.path);
            if !source.is_file() {
                return Err(SessionError::Internal(anyhow::anyhow!(
                    "io_error: manifested file missing from source tree: {}",
                    entry.path
                )));
            }
            let target = replay_root.join(&entry.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create '{}'", parent.display()))?;
            }
            std::fs::copy(&source, &target)
                .with_context(|| format!("Failed to copy '{}'", source.display()))?;
        }

        let final_patch = std::fs::read_to_string(bundle_dir.join("final.patch")).unwrap_or_default();
        if !final_patch.trim().is_empty() {
            patch::apply_patch(&final_patch, &replay_root, &config.policy, false)
                .map_err(|e| SessionError::Internal(anyhow::anyhow!("io_error: {}", e)))?;
        }

        let replay_sandbox = if config.policy.sandbox.backend == SandboxBackend::Container {
            Some(Sandbox {
                root: replay_root.clone(),
                backend: SandboxBackend::Container,
                workspace_backend: "copy",
                control_root: replay_root.clone(),
                container: Some(ContainerSpec {
                    runtime: config.policy.sandbox.container_runtime.clone(),
                    image: config.policy.sandbox.container_image.clone(),
                    workdir: config.policy.sandbox.container_workdir.clone(),
                    network: config.policy.network,
                    cpu_limit: config.policy.sandbox.cpu_limit.clone(),
                    memory_limit: config.policy.sandbox.memory_limit.clone(),
                    image_id: None,
                }),
            })
        } else {
            None
        };

        let timeout = Duration::from_secs(config.policy.limits.per_command_timeout_sec);
        let mut targets = Vec::new();
        let mut all_passed = true;
        for target in &config.proof_targets {
            let argv = config.policy.matched_argv(&target.cmd);
            let result: VerifyResult = run_verify(
                &target.cmd,
                &replay_root,
                timeout,
                replay_sandbox.as_ref(),
                argv.as_deref(),
                Some(self.cancel.as_atomic()),
            );
            all_passed &= result.passed();
            info!(target = %target.name, exit_code = result.exit_code, "replayed proof target");
            targets.push(ReplayTargetResult {
                name: target.name.clone(),
                cmd: target.cmd.clone(),
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
                passed: result.passed(),
            });
        }

        Ok(ReplaySummary {
            ok: all_passed,
            attestation_failed: false,
            attestation,
            targets,
        })
    }
}

fn render_summary(
    result: SessionResult,
    command: &str,
    attempts_used: u32,
    final_result: &VerifyResult,
    policy_hash: &str,
    policy: &Policy,
) -> String {
    let mut lines = vec![
        "# Patchprove Summary".to_string(),
        String::new(),
        format!("- result: {}", result.as_str()),
        format!("- command: `{}`", command),
        format!("- attempts_used: {}", attempts_used),
        format!("- final_exit_code: {}", final_result.exit_code),
        format!("- policy_hash: `{}`", policy_hash),
    ];
    if policy.attestation.enabled {
        lines.push(format!(
            "- attestation_mode: `{}`",
            policy.attestation.mode.as_str()
        ));
    }
    lines.extend([
        String::new(),
        "## Final result".to_string(),
        String::new(),
        "```text".to_string(),
        crate::util::truncate(&final_result.stdout, SUMMARY_OUTPUT_MAX_CHARS),
        crate::util::truncate(&final_result.stderr, SUMMARY_OUTPUT_MAX_CHARS),
        "```".to_string(),
    ]);
    lines.join("\n")
}
