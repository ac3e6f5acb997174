//! Verification command execution.
//!
//! One verification at a time, with a sanitized environment, a hard
//! per-command timeout, and full stream capture. Container-backed sandboxes
//! route the command through the configured runtime with the sandbox mounted
//! at the policy workdir.

use crate::sandbox::Sandbox;
use crate::util::{run_command_with_timeout, tail_chars};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

/// Stored tails are capped at the last 64 KiB; full captures go to the
/// attempt directory.
pub const OUTPUT_TAIL_MAX_CHARS: usize = 64 * 1024;

/// Exit code recorded when the child was killed on timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code recorded when the child could not be spawned or waited on.
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Environment variable names that never reach a verification child.
fn is_secret_env(name: &str) -> bool {
    name.starts_with("PP_OPENAI_") || name.starts_with("PP_ATTEST_") || name == "PP_LOCAL_API_KEY"
}

/// Result of one verification run. Pass means exit 0 and no timeout.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub cmd: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub canceled: bool,
}

impl VerifyResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout_tail(&self) -> String {
        tail_chars(&self.stdout, OUTPUT_TAIL_MAX_CHARS)
    }

    pub fn stderr_tail(&self) -> String {
        tail_chars(&self.stderr, OUTPUT_TAIL_MAX_CHARS)
    }

    pub fn combined_output(&self) -> String {
        if !self.stdout.is_empty() && !self.stderr.is_empty() {
            format!("{}\n{}", self.stdout, self.stderr)
        } else if !self.stdout.is_empty() {
            self.stdout.clone()
        } else {
            self.stderr.clone()
        }
    }
}

fn sanitized_env() -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(name, _)| !is_secret_env(name))
        .collect();
    if !env.iter().any(|(name, _)| name == "CI") {
        env.push(("CI".to_string(), "1".to_string()));
    }
    env
}

fn container_argv(cmd: &str, cwd: &Path, sandbox: &Sandbox, argv: Option<&[String]>) -> Vec<String> {
    let spec = sandbox
        .container
        .as_ref()
        .expect("container argv requires a container spec");
    let mut args: Vec<String> = vec![
        spec.runtime.clone(),
        "run".to_string(),
        "--rm".to_string(),
        "--workdir".to_string(),
        spec.workdir.clone(),
        "--volume".to_string(),
        format!("{}:{}", cwd.display(), spec.workdir),
        "-e".to_string(),
        "CI=1".to_string(),
    ];

    // Run as the host user so files written into the mounted sandbox are not
    // root-owned.
    #[cfg(unix)]
    {
        args.push("--user".to_string());
        args.push(format!("{}:{}", unsafe { libc::getuid() }, unsafe {
            libc::getgid()
        }));
    }

    if spec.network == crate::policy::NetworkPolicy::Deny {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    if let Some(cpu) = &spec.cpu_limit {
        args.push("--cpus".to_string());
        args.push(cpu.clone());
    }
    if let Some(memory) = &spec.memory_limit {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }

    args.push(spec.image.clone());
    match argv {
        Some(vector) => args.extend(vector.iter().cloned()),
        None => {
            args.push("sh".to_string());
            args.push("-lc".to_string());
            args.push(cmd.to_string());
        }
    }
    args
}

/// Run one verification command in `cwd`.
///
/// When `argv` is present (the command matched `allowed_argv`) it is executed
/// without a shell; otherwise the exact command string goes through
/// `sh -lc`. A non-zero exit or a timeout is a failure.
pub fn run_verify(
    cmd: &str,
    cwd: &Path,
    timeout: Duration,
    sandbox: Option<&Sandbox>,
    argv: Option<&[String]>,
    cancel: Option<&AtomicBool>,
) -> VerifyResult {
    let start = Instant::now();

    let mut command = if let Some(containerized) = sandbox.filter(|s| s.container.is_some()) {
        let container = container_argv(cmd, cwd, containerized, argv);
        let mut c = Command::new(&container[0]);
        c.args(&container[1..]);
        c.current_dir(cwd);
        c
    } else {
        let mut c = match argv {
            Some(vector) if !vector.is_empty() => {
                let mut c = Command::new(&vector[0]);
                c.args(&vector[1..]);
                c
            }
            _ => {
                let mut c = Command::new("sh");
                c.args(["-lc", cmd]);
                c
            }
        };
        c.current_dir(cwd);
        c.env_clear();
        c.envs(sanitized_env());
        c
    };

    match run_command_with_timeout(&mut command, timeout, cancel) {
        Ok(result) => {
            let exit_code = if result.timed_out {
                TIMEOUT_EXIT_CODE
            } else {
                result
                    .status
                    .and_then(|s| s.code())
                    .unwrap_or(SPAWN_FAILURE_EXIT_CODE)
            };
            let mut stderr = result.stderr;
            if result.timed_out {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "[patchprove] command timed out after {}s",
                    timeout.as_secs()
                ));
            }
            VerifyResult {
                cmd: cmd.to_string(),
                exit_code,
                duration_ms: start.elapsed().as_millis() as u64,
                stdout: result.stdout,
                stderr,
                timed_out: result.timed_out,
                canceled: result.canceled,
            }
        }
        Err(error) => VerifyResult {
            cmd: cmd.to_string(),
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            duration_ms: start.elapsed().as_millis() as u64,
            stdout: String::new(),
            stderr: error,
            timed_out: false,
            canceled: false,
        },
    }
}
