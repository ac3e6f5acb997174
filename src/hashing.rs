//! Canonical JSON serialization and content hashing.
//!
//! Every artifact the engine hashes goes through the same canonical form:
//! keys sorted lexicographically, UTF-8, LF line endings, two-space
//! indentation, no trailing newline. This is what makes `policy_hash` and
//! the bundle manifest digests stable across runs and platforms.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of a file, streamed in 1 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open '{}' for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Canonical JSON text for any serializable value.
///
/// Routing through `serde_json::Value` sorts object keys (the default
/// `serde_json::Map` is a BTreeMap). Pretty printing gives two-space
/// indentation, LF separators, and no trailing newline.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).context("Failed to canonicalize value")?;
    serde_json::to_string_pretty(&value).context("Failed to serialize canonical JSON")
}

/// SHA-256 of the canonical JSON form of a value.
pub fn canonical_json_hash<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"zebra": 1, "alpha": {"nested_z": true, "nested_a": false}});
        let text = canonical_json(&value).unwrap();
        let alpha = text.find("\"alpha\"").unwrap();
        let zebra = text.find("\"zebra\"").unwrap();
        assert!(alpha < zebra);
        let nested_a = text.find("\"nested_a\"").unwrap();
        let nested_z = text.find("\"nested_z\"").unwrap();
        assert!(nested_a < nested_z);
        assert!(!text.ends_with('\n'));
    }

    #[test]
    fn canonical_json_is_idempotent() {
        let value = json!({"b": [1, 2, 3], "a": "x"});
        let once = canonical_json(&value).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&once).unwrap();
        let twice = canonical_json(&reparsed).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let (digest, size) = sha256_file(&path).unwrap();
        assert_eq!(digest, sha256_hex(b"hello world"));
        assert_eq!(size, 11);
    }
}
