//! Failure-context extraction.
//!
//! Pulls file/line locations out of tracebacks and compiler-style
//! diagnostics, grabs surrounding snippets from the sandbox, and collects
//! failing assertion lines. The resulting slice is what the proposer sees.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const MAX_LOCATIONS: usize = 20;
const MAX_ASSERTIONS: usize = 20;
const SNIPPET_RADIUS: usize = 25;

static TRACEBACK_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"File "(?P<file>.+?)", line (?P<line>\d+)"#).unwrap());
static DIAGNOSTIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<file>[\w./\\-]+):\s?(?P<line>\d+)(?::\d+)?").unwrap());
static ASSERT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(AssertionError:.*|E\s+assert\s+.*|FAILED\s+.*)").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextSlice {
    pub locations: Vec<Location>,
    pub snippets: BTreeMap<String, String>,
    pub failing_assertions: Vec<String>,
}

fn to_workspace_relative(raw: &str, workspace_root: &Path) -> Option<String> {
    let candidate = PathBuf::from(raw);
    let absolute = if candidate.is_absolute() {
        candidate
    } else {
        workspace_root.join(candidate)
    };
    let canonical = absolute.canonicalize().ok()?;
    let root = workspace_root.canonicalize().ok()?;
    let rel = canonical.strip_prefix(&root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}

fn extract_locations(text: &str, workspace_root: &Path) -> Vec<Location> {
    let mut locations = Vec::new();
    let mut seen: std::collections::HashSet<(String, usize)> = std::collections::HashSet::new();

    let mut push = |file: &str, line: usize, reason: &'static str, out: &mut Vec<Location>| {
        if let Some(rel) = to_workspace_relative(file, workspace_root) {
            let key = (rel.clone(), line);
            if seen.insert(key) {
                out.push(Location {
                    file: rel,
                    line,
                    reason,
                });
            }
        }
    };

    for captures in TRACEBACK_FILE_RE.captures_iter(text) {
        let line: usize = captures["line"].parse().unwrap_or(0);
        push(&captures["file"], line, "traceback", &mut locations);
    }
    for captures in DIAGNOSTIC_RE.captures_iter(text) {
        let line: usize = captures["line"].parse().unwrap_or(0);
        push(&captures["file"], line, "diagnostic", &mut locations);
    }

    locations.truncate(MAX_LOCATIONS);
    locations
}

fn snippet_for_location(workspace_root: &Path, rel_path: &str, line_no: usize) -> String {
    let path = workspace_root.join(rel_path);
    let Ok(content) = std::fs::read_to_string(&path) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let start = line_no.saturating_sub(SNIPPET_RADIUS).max(1);
    let end = (line_no + SNIPPET_RADIUS).min(lines.len());
    let mut out = Vec::with_capacity(end.saturating_sub(start) + 1);
    for i in start..=end {
        let marker = if i == line_no { ">>" } else { "  " };
        out.push(format!("{} {:5} | {}", marker, i, lines[i - 1]));
    }
    out.join("\n")
}

/// Extract a proposer-facing context slice from a failed verification's
/// combined output.
pub fn extract_context(result_text: &str, workspace_root: &Path) -> ContextSlice {
    let locations = extract_locations(result_text, workspace_root);
    let mut snippets = BTreeMap::new();
    for location in &locations {
        let key = format!("{}:{}", location.file, location.line);
        let snippet = snippet_for_location(workspace_root, &location.file, location.line);
        if !snippet.is_empty() {
            snippets.insert(key, snippet);
        }
    }

    let failing_assertions: Vec<String> = ASSERT_RE
        .find_iter(result_text)
        .map(|m| m.as_str().trim().to_string())
        .take(MAX_ASSERTIONS)
        .collect();

    ContextSlice {
        locations,
        snippets,
        failing_assertions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_traceback_locations_and_snippets() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("math_utils.py");
        std::fs::write(&file, "def add(a, b):\n    return resultx\n").unwrap();

        let output = format!(
            "Traceback (most recent call last):\n  File \"{}\", line 2, in add\nNameError: name 'resultx' is not defined\n",
            file.display()
        );
        let context = extract_context(&output, tmp.path());
        assert_eq!(context.locations.len(), 1);
        assert_eq!(context.locations[0].file, "math_utils.py");
        assert_eq!(context.locations[0].line, 2);
        let snippet = context.snippets.get("math_utils.py:2").unwrap();
        assert!(snippet.contains(">>"));
        assert!(snippet.contains("resultx"));
    }

    #[test]
    fn collects_failing_assertions() {
        let tmp = tempfile::tempdir().unwrap();
        let output = "FAILED tests/test_math.py::test_add\nAssertionError: 2 != 3\n";
        let context = extract_context(output, tmp.path());
        assert_eq!(context.failing_assertions.len(), 2);
        assert!(context.failing_assertions[0].starts_with("FAILED"));
    }

    #[test]
    fn ignores_paths_outside_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let output = "File \"/usr/lib/python3.11/unittest/case.py\", line 59, in run\n";
        let context = extract_context(output, tmp.path());
        assert!(context.locations.is_empty());
    }
}
