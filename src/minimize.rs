//! Hunk minimization.
//!
//! After the first pass, greedily drop one hunk at a time in reverse order
//! and keep each removal that still verifies in a fresh scratch sandbox.
//! Terminates when no single-hunk removal preserves the pass, which makes
//! minimization a fixed point: re-minimizing a minimized patch returns it
//! unchanged.

use crate::patch::{self, Patch};
use crate::policy::Policy;
use crate::runner::{run_verify, VerifyResult};
use crate::sandbox::{copy_tree, Sandbox};
use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Verification hook so tests can minimize without spawning processes.
pub trait VerifyFn {
    fn verify(&mut self, root: &Path) -> bool;
}

struct CommandVerify<'a> {
    cmd: &'a str,
    timeout: Duration,
    sandbox: Option<&'a Sandbox>,
}

impl VerifyFn for CommandVerify<'_> {
    fn verify(&mut self, root: &Path) -> bool {
        let result: VerifyResult =
            run_verify(self.cmd, root, self.timeout, self.sandbox, None, None);
        result.passed()
    }
}

fn drop_hunk(patch: &Patch, file_idx: usize, hunk_idx: usize) -> Patch {
    let mut candidate = patch.clone();
    candidate.files[file_idx].hunks.remove(hunk_idx);
    candidate.files.retain(|f| !f.hunks.is_empty());
    candidate
}

fn candidate_passes(
    candidate_text: &str,
    baseline_root: &Path,
    policy: &Policy,
    verify: &mut dyn VerifyFn,
) -> Result<bool> {
    let scratch = tempfile::tempdir()?;
    let scratch_root = scratch.path().join("workspace");
    copy_tree(baseline_root, &scratch_root)?;

    if !candidate_text.is_empty()
        && patch::apply_patch(candidate_text, &scratch_root, policy, false).is_err()
    {
        return Ok(false);
    }
    Ok(verify.verify(&scratch_root))
}

fn minimize_with(
    patch_text: &str,
    baseline_root: &Path,
    policy: &Policy,
    verify: &mut dyn VerifyFn,
) -> Result<String> {
    if patch_text.trim().is_empty() {
        return Ok(patch_text.to_string());
    }
    let Ok(parsed) = patch::parse_unified_diff(patch_text) else {
        return Ok(patch_text.to_string());
    };

    let mut current = parsed;
    let mut made_progress = true;
    while made_progress {
        made_progress = false;
        // Reverse order: failures cluster near end-of-file edits, so later
        // hunks are the most likely to be droppable.
        'outer: for file_idx in (0..current.files.len()).rev() {
            for hunk_idx in (0..current.files[file_idx].hunks.len()).rev() {
                let candidate = drop_hunk(&current, file_idx, hunk_idx);
                let candidate_text = patch::render_patch(&candidate);
                if candidate_passes(&candidate_text, baseline_root, policy, verify)? {
                    debug!(file_idx, hunk_idx, "dropped redundant hunk");
                    current = candidate;
                    made_progress = true;
                    break 'outer;
                }
            }
        }
    }

    Ok(patch::render_patch(&current))
}

/// Minimize a passing patch against a pristine baseline tree by re-running
/// the verification command for each candidate.
pub fn minimize_patch_hunks(
    patch_text: &str,
    baseline_root: &Path,
    verify_cmd: &str,
    timeout: Duration,
    policy: &Policy,
    execution_sandbox: Option<&Sandbox>,
) -> Result<String> {
    let mut verify = CommandVerify {
        cmd: verify_cmd,
        timeout,
        sandbox: execution_sandbox,
    };
    minimize_with(patch_text, baseline_root, policy, &mut verify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    /// Verifies by checking file content rather than spawning processes.
    struct ContentVerify {
        required: &'static str,
        file: &'static str,
    }

    impl VerifyFn for ContentVerify {
        fn verify(&mut self, root: &Path) -> bool {
            std::fs::read_to_string(root.join(self.file))
                .map(|content| content.contains(self.required))
                .unwrap_or(false)
        }
    }

    const TWO_HUNK_PATCH: &str = concat!(
        "--- a/app.py\n+++ b/app.py\n",
        "@@ -1,1 +1,1 @@\n-broken = True\n+broken = False\n",
        "@@ -3,1 +3,1 @@\n-cosmetic = 1\n+cosmetic = 2\n",
    );

    fn baseline() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("app.py"),
            "broken = True\nmiddle = 0\ncosmetic = 1\n",
        )
        .unwrap();
        tmp
    }

    #[test]
    fn drops_hunks_not_needed_for_pass() {
        let base = baseline();
        let mut verify = ContentVerify {
            required: "broken = False",
            file: "app.py",
        };
        let minimized =
            minimize_with(TWO_HUNK_PATCH, base.path(), &Policy::default(), &mut verify).unwrap();
        assert!(minimized.contains("broken = False"));
        assert!(!minimized.contains("cosmetic"));
    }

    #[test]
    fn minimization_is_a_fixed_point() {
        let base = baseline();
        let policy = Policy::default();
        let mut verify = ContentVerify {
            required: "broken = False",
            file: "app.py",
        };
        let once = minimize_with(TWO_HUNK_PATCH, base.path(), &policy, &mut verify).unwrap();
        let mut verify_again = ContentVerify {
            required: "broken = False",
            file: "app.py",
        };
        let twice = minimize_with(&once, base.path(), &policy, &mut verify_again).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn keeps_patch_when_every_hunk_is_required() {
        let base = baseline();
        let mut verify = ContentVerify {
            required: "cosmetic = 2",
            file: "app.py",
        };
        let minimized =
            minimize_with(TWO_HUNK_PATCH, base.path(), &Policy::default(), &mut verify).unwrap();
        // The first hunk is droppable, the second is load-bearing.
        assert!(minimized.contains("cosmetic = 2"));
        assert!(!minimized.contains("broken = False"));
    }

    #[test]
    fn empty_patch_passes_through() {
        let base = baseline();
        let mut verify = ContentVerify {
            required: "anything",
            file: "app.py",
        };
        assert_eq!(
            minimize_with("", base.path(), &Policy::default(), &mut verify).unwrap(),
            ""
        );
    }
}
