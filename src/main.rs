//! Patchprove - a policy-governed proving engine.
//!
//! Attempts to repair a workspace until a verification command passes,
//! recording every attempt in a replayable, optionally attested proof
//! bundle.

use clap::{Args, Parser, Subcommand, ValueEnum};
use patchprove::attest;
use patchprove::config::{load_config, EnvSnapshot};
use patchprove::policy::AttestationMode;
use patchprove::session::{RunOptions, SessionController, SessionError, SessionResult};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const EXIT_PASS: i32 = 0;
const EXIT_FAIL: i32 = 1;
const EXIT_POLICY: i32 = 2;
const EXIT_ATTESTATION: i32 = 3;
const EXIT_INTERNAL: i32 = 4;

#[derive(Parser, Debug)]
#[command(
    name = "patchprove",
    about = "Policy-governed patch-and-prove engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run patch-and-prove on one ad-hoc target command
    Run(RunArgs),
    /// Run every proof target from the policy file
    Prove(ProveArgs),
    /// Replay a proof bundle against a source tree
    Replay(ReplayArgs),
    /// Create or overwrite a proof-bundle attestation
    Attest(AttestArgs),
    /// Verify a proof-bundle attestation
    VerifyAttestation(VerifyAttestationArgs),
    /// Print the resolved policy and runtime settings
    Doctor(DoctorArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Proof target command, e.g. 'pytest -q'
    command: String,
    /// Path to patchprove.yaml/patchprove.json
    #[arg(long)]
    policy: Option<PathBuf>,
    /// Provider name: stub|openai|local
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ProveArgs {
    #[arg(long)]
    policy: Option<PathBuf>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Path to the proof_bundle directory
    bundle: PathBuf,
    /// Override the replay source tree
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Verify the bundle attestation before replaying
    #[arg(long)]
    verify_attestation: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum AttestModeArg {
    None,
    #[value(name = "hmac-sha256")]
    HmacSha256,
}

impl From<AttestModeArg> for AttestationMode {
    fn from(mode: AttestModeArg) -> Self {
        match mode {
            AttestModeArg::None => AttestationMode::None,
            AttestModeArg::HmacSha256 => AttestationMode::HmacSha256,
        }
    }
}

#[derive(Args, Debug)]
struct AttestArgs {
    /// Path to the proof_bundle directory
    bundle: PathBuf,
    #[arg(long, value_enum, default_value_t = AttestModeArg::None)]
    mode: AttestModeArg,
    /// Environment variable holding the hmac-sha256 key
    #[arg(long, default_value = "PP_ATTEST_HMAC_KEY")]
    key_env: String,
}

#[derive(Args, Debug)]
struct VerifyAttestationArgs {
    bundle: PathBuf,
}

#[derive(Args, Debug)]
struct DoctorArgs {
    #[arg(long)]
    policy: Option<PathBuf>,
    /// Command to check against allowed_commands
    #[arg(long)]
    command: Option<String>,
}

fn session_error_exit(err: &SessionError) -> i32 {
    match err {
        SessionError::CommandNotAllowed(_) | SessionError::InvalidConfig(_) => EXIT_POLICY,
        SessionError::Internal(_) => EXIT_INTERNAL,
    }
}

fn result_exit(result: SessionResult) -> i32 {
    match result {
        SessionResult::Pass => EXIT_PASS,
        SessionResult::Fail => EXIT_FAIL,
        SessionResult::Error => EXIT_INTERNAL,
    }
}

fn cmd_run(args: &RunArgs) -> i32 {
    let controller = SessionController::new(std::env::current_dir().unwrap_or_default());
    install_cancel_handler(&controller);

    let options = RunOptions {
        policy_path: args.policy.clone(),
        provider: args.provider.clone(),
    };
    match controller.run(&args.command, &options) {
        Ok(summary) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).unwrap_or_default()
                );
            } else {
                println!("result={}", summary.result.as_str());
                println!("attempts_used={}", summary.attempts_used);
                println!("final_exit_code={}", summary.final_exit_code);
                println!("final_patch={}", summary.final_patch_path.display());
                println!("proof_bundle={}", summary.bundle_dir.display());
                if let Some(attestation) = &summary.attestation_path {
                    println!("attestation={}", attestation.display());
                }
            }
            result_exit(summary.result)
        }
        Err(err) => {
            eprintln!("error: {}", err);
            session_error_exit(&err)
        }
    }
}

fn cmd_prove(args: &ProveArgs) -> i32 {
    let controller = SessionController::new(std::env::current_dir().unwrap_or_default());
    install_cancel_handler(&controller);

    let options = RunOptions {
        policy_path: args.policy.clone(),
        provider: args.provider.clone(),
    };
    match controller.prove(&options) {
        Ok(results) => {
            if args.json {
                let payload: Vec<serde_json::Value> = results
                    .iter()
                    .map(|(target, summary)| {
                        serde_json::json!({
                            "name": target.name,
                            "cmd": target.cmd,
                            "summary": summary,
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload).unwrap_or_default()
                );
            } else {
                for (target, summary) in &results {
                    println!(
                        "{}: result={} attempts_used={} bundle={}",
                        target.name,
                        summary.result.as_str(),
                        summary.attempts_used,
                        summary.bundle_dir.display()
                    );
                }
            }
            if results
                .iter()
                .any(|(_, s)| s.result == SessionResult::Error)
            {
                EXIT_INTERNAL
            } else if results.iter().all(|(_, s)| s.result == SessionResult::Pass) {
                EXIT_PASS
            } else {
                EXIT_FAIL
            }
        }
        Err(err) => {
            eprintln!("error: {}", err);
            session_error_exit(&err)
        }
    }
}

fn cmd_replay(args: &ReplayArgs) -> i32 {
    let controller = SessionController::new(std::env::current_dir().unwrap_or_default());
    install_cancel_handler(&controller);

    match controller.replay(&args.bundle, args.cwd.as_deref(), args.verify_attestation) {
        Ok(summary) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).unwrap_or_default()
                );
            } else {
                for target in &summary.targets {
                    println!(
                        "{}: exit_code={} passed={}",
                        target.name, target.exit_code, target.passed
                    );
                }
                if let Some(attestation) = &summary.attestation {
                    println!(
                        "attestation: ok={} first_mismatch={}",
                        attestation.ok,
                        attestation.first_mismatch.as_deref().unwrap_or("-")
                    );
                }
                println!("ok={}", summary.ok);
            }
            if summary.attestation_failed {
                EXIT_ATTESTATION
            } else if summary.ok {
                EXIT_PASS
            } else {
                EXIT_FAIL
            }
        }
        Err(err) => {
            eprintln!("error: {}", err);
            session_error_exit(&err)
        }
    }
}

fn cmd_attest(args: &AttestArgs) -> i32 {
    let env = EnvSnapshot::capture_with_extra(&[args.key_env.as_str()]);
    match attest::create_attestation(&args.bundle, args.mode.into(), &args.key_env, &env) {
        Ok(path) => {
            println!("attestation={}", path.display());
            EXIT_PASS
        }
        Err(err) => {
            eprintln!("error: {}", err);
            EXIT_POLICY
        }
    }
}

fn cmd_verify_attestation(args: &VerifyAttestationArgs) -> i32 {
    let env = EnvSnapshot::capture();
    match attest::verify_attestation(&args.bundle, &env) {
        Ok(outcome) => {
            println!(
                "ok={} mode={} first_mismatch={}",
                outcome.ok,
                outcome.mode,
                outcome.first_mismatch.as_deref().unwrap_or("-")
            );
            if let Some(error) = &outcome.error {
                eprintln!("error: {}", error);
            }
            if outcome.ok {
                EXIT_PASS
            } else {
                EXIT_ATTESTATION
            }
        }
        Err(err) => {
            eprintln!("error: {}", err);
            EXIT_INTERNAL
        }
    }
}

fn cmd_doctor(args: &DoctorArgs) -> i32 {
    let workspace = std::env::current_dir().unwrap_or_default();
    let fallback = args.command.as_deref().unwrap_or("true");
    match load_config(args.policy.as_deref(), fallback, &workspace) {
        Ok((config, resolved)) => {
            println!("Patchprove doctor");
            println!(
                "policy_path={}",
                resolved
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(default)".to_string())
            );
            println!("allowed_commands={:?}", config.policy.allowed_commands);
            println!("allowed_argv={:?}", config.policy.allowed_argv);
            println!("write_allowlist={:?}", config.policy.write_allowlist);
            println!("deny_write={:?}", config.policy.deny_write);
            println!("max_attempts={}", config.policy.limits.max_attempts);
            println!(
                "per_command_timeout_sec={}",
                config.policy.limits.per_command_timeout_sec
            );
            println!("sandbox_backend={}", config.policy.sandbox.backend.as_str());
            println!(
                "container_runtime={}",
                config.policy.sandbox.container_runtime
            );
            println!("container_image={}", config.policy.sandbox.container_image);
            println!("attestation_enabled={}", config.policy.attestation.enabled);
            println!(
                "attestation_mode={}",
                config.policy.attestation.mode.as_str()
            );
            if let Some(command) = &args.command {
                println!(
                    "command_allowed={}",
                    config.policy.is_command_allowed(command)
                );
            }
            EXIT_PASS
        }
        Err(err) => {
            eprintln!("error: {}", err);
            EXIT_POLICY
        }
    }
}

fn install_cancel_handler(controller: &SessionController) {
    let flag = controller.cancel_flag();
    let _ = ctrlc::set_handler(move || {
        eprintln!("interrupt received, finalizing partial bundle");
        flag.cancel();
    });
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Prove(args) => cmd_prove(args),
        Commands::Replay(args) => cmd_replay(args),
        Commands::Attest(args) => cmd_attest(args),
        Commands::VerifyAttestation(args) => cmd_verify_attestation(args),
        Commands::Doctor(args) => cmd_doctor(args),
    };
    std::process::exit(exit);
}
