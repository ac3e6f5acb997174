//! Bundle attestation: manifest digests and HMAC-SHA256 signatures.
//!
//! The attestation walks every file in the proof bundle (excluding itself),
//! records `path -> sha256`, and digests the canonical serialization of that
//! map: sorted `path\tsha256` lines joined by LF with no trailing newline.
//! In `hmac-sha256` mode the digest is signed with a key taken from the
//! environment variable named by the policy; the key is read once and never
//! logged.

use crate::config::EnvSnapshot;
use crate::hashing;
use crate::policy::AttestationMode;
use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

type HmacSha256 = Hmac<Sha256>;

pub const ATTESTATION_FILENAME: &str = "attestation.json";
const ATTESTATION_VERSION: &str = "patchprove-attestation/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub version: String,
    pub created_at: String,
    pub mode: String,
    /// Sorted map of bundle-relative path to sha256. Never contains the
    /// attestation file itself.
    pub bundle_manifest: BTreeMap<String, String>,
    pub manifest_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Result of verifying a bundle attestation.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub mode: String,
    pub content_valid: bool,
    pub signature_valid: bool,
    /// First bundle path whose recorded hash does not match (lexicographic).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_mismatch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn bundle_manifest(bundle_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut manifest = BTreeMap::new();
    for entry in WalkDir::new(bundle_dir).follow_links(false) {
        let entry =
            entry.with_context(|| format!("Failed to walk bundle '{}'", bundle_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(bundle_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if rel == ATTESTATION_FILENAME {
            continue;
        }
        let (digest, _) = hashing::sha256_file(entry.path())?;
        manifest.insert(rel, digest);
    }
    Ok(manifest)
}

/// Canonical serialization of a bundle manifest: sorted `path\tsha256`
/// lines, LF-joined, no trailing newline.
fn manifest_canonical_bytes(manifest: &BTreeMap<String, String>) -> Vec<u8> {
    manifest
        .iter()
        .map(|(path, digest)| format!("{}\t{}", path, digest))
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes()
}

fn manifest_digest(manifest: &BTreeMap<String, String>) -> String {
    hashing::sha256_hex(&manifest_canonical_bytes(manifest))
}

fn hmac_sign(key: &str, digest: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(digest.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn hmac_matches(key: &str, digest: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(digest.as_bytes());
    // verify_slice is the constant-time comparison.
    mac.verify_slice(&signature).is_ok()
}

/// Create (or overwrite) `attestation.json` for a bundle.
pub fn create_attestation(
    bundle_dir: &Path,
    mode: AttestationMode,
    key_env: &str,
    env: &EnvSnapshot,
) -> Result<PathBuf> {
    let manifest = bundle_manifest(bundle_dir)?;
    let digest = manifest_digest(&manifest);

    let mut attestation = Attestation {
        version: ATTESTATION_VERSION.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        mode: mode.as_str().to_string(),
        bundle_manifest: manifest,
        manifest_digest: digest.clone(),
        key_env: None,
        key_id: None,
        signature: None,
    };

    if mode == AttestationMode::HmacSha256 {
        let key = env.get(key_env).ok_or_else(|| {
            anyhow!(
                "attestation mode hmac-sha256 requires environment variable {}",
                key_env
            )
        })?;
        attestation.key_env = Some(key_env.to_string());
        attestation.key_id = Some(hashing::sha256_hex(key.as_bytes())[..16].to_string());
        attestation.signature = Some(hmac_sign(key, &digest));
    }

    let target = bundle_dir.join(ATTESTATION_FILENAME);
    let text = hashing::canonical_json(&attestation)?;
    std::fs::write(&target, text)
        .with_context(|| format!("Failed to write '{}'", target.display()))?;
    Ok(target)
}

/// Recompute the bundle manifest and check it, plus the HMAC signature when
/// present, against `attestation.json`.
pub fn verify_attestation(bundle_dir: &Path, env: &EnvSnapshot) -> Result<VerifyOutcome> {
    let path = bundle_dir.join(ATTESTATION_FILENAME);
    if !path.exists() {
        return Ok(VerifyOutcome {
            ok: false,
            mode: "none".to_string(),
            content_valid: false,
            signature_valid: false,
            first_mismatch: None,
            error: Some(format!("missing {}", path.display())),
        });
    }

    let recorded: Attestation = serde_json::from_str(
        &std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?,
    )
    .with_context(|| format!("Failed to parse '{}'", path.display()))?;

    let current = bundle_manifest(bundle_dir)?;

    // First offending path in lexicographic order: changed, missing, or
    // unexpected extra file.
    let mut first_mismatch: Option<String> = None;
    let mut all_paths: Vec<&String> = recorded.bundle_manifest.keys().chain(current.keys()).collect();
    all_paths.sort();
    all_paths.dedup();
    for rel in all_paths {
        match (recorded.bundle_manifest.get(rel), current.get(rel)) {
            (Some(a), Some(b)) if a == b => {}
            _ => {
                first_mismatch = Some(rel.clone());
                break;
            }
        }
    }

    let digest_now = manifest_digest(&current);
    let content_valid = first_mismatch.is_none() && digest_now == recorded.manifest_digest;

    let mut error = None;
    let signature_valid = match recorded.mode.as_str() {
        "none" => true,
        "hmac-sha256" => {
            let key_env = recorded.key_env.as_deref().unwrap_or("PP_ATTEST_HMAC_KEY");
            match env.get(key_env) {
                None => {
                    error = Some(format!(
                        "missing environment variable for verification: {}",
                        key_env
                    ));
                    false
                }
                Some(key) => {
                    let signature = recorded.signature.as_deref().unwrap_or("");
                    let valid = hmac_matches(key, &recorded.manifest_digest, signature);
                    if !valid {
                        error = Some("signature mismatch".to_string());
                    }
                    valid
                }
            }
        }
        other => {
            error = Some(format!("unsupported signing mode: {}", other));
            false
        }
    };

    Ok(VerifyOutcome {
        ok: content_valid && signature_valid,
        mode: recorded.mode,
        content_valid,
        signature_valid,
        first_mismatch,
        error,
    })
}
