//! Patch proposers.
//!
//! A proposer turns failure evidence into unified-diff text. The engine
//! treats it as a black box behind `Proposer`; the built-in implementations
//! are an OpenAI-compatible HTTP provider, a variant of it pointed at local
//! inference servers, and an offline stub. HTTP calls are blocking with an
//! explicit timeout; there is no background reactor.

use crate::config::EnvSnapshot;
use crate::context::ContextSlice;
use crate::manifest;
use crate::patch::{diff_has_effective_edits, FileRewrite};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const FAILURE_OUTPUT_MAX_CHARS: usize = 12_000;
const SNIPPET_BLOCK_MAX_CHARS: usize = 20_000;
const EDITABLE_BLOCK_MAX_CHARS: usize = 24_000;
const PREVIOUS_ERRORS_SHOWN: usize = 3;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1-mini";
const DEFAULT_LOCAL_BASE_URL: &str = "http://127.0.0.1:8000/v1";
const DEFAULT_LOCAL_MODEL: &str = "Qwen/Qwen2.5-Coder-7B-Instruct";
const DEFAULT_MAX_TOKENS: u32 = 2000;
const DEFAULT_OPENAI_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_LOCAL_TIMEOUT_SECS: u64 = 240;

/// Evidence handed to a proposer. All free text is already redacted.
#[derive(Debug)]
pub struct ProposalInput<'a> {
    pub command: &'a str,
    pub failure_output: String,
    pub context: &'a ContextSlice,
    pub previous_attempts: &'a [String],
    pub write_allowlist: &'a [String],
    pub deny_write: &'a [String],
    /// Current content of policy-writable files, the canonical source for
    /// context lines and for rewrite synthesis.
    pub editable_files: &'a BTreeMap<String, String>,
}

/// What a proposer produced for one attempt.
#[derive(Debug, Clone, Default)]
pub struct Proposal {
    pub diff: String,
    pub raw_response: Option<String>,
    /// Present when the proposer answered with a single-file rewrite block
    /// instead of (or in addition to) a diff.
    pub rewrite: Option<FileRewrite>,
}

pub trait Proposer {
    fn name(&self) -> &str;
    fn propose(&self, input: &ProposalInput) -> Result<Proposal>;
}

/// Deterministic fallback provider: proposes nothing. Keeps the engine
/// runnable offline without model credentials.
pub struct StubProposer;

impl Proposer for StubProposer {
    fn name(&self) -> &str {
        "stub"
    }

    fn propose(&self, _input: &ProposalInput) -> Result<Proposal> {
        Ok(Proposal {
            diff: String::new(),
            raw_response: Some("stub".to_string()),
            rewrite: None,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions provider.
pub struct OpenAiCompatibleProposer {
    label: String,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAiCompatibleProposer {
    pub fn openai_from_env(env: &EnvSnapshot) -> Result<Self> {
        let api_key = env
            .get("PP_OPENAI_API_KEY")
            .or_else(|| env.get("OPENAI_API_KEY"))
            .map(str::to_string);
        if api_key.is_none() {
            return Err(anyhow!(
                "PP_OPENAI_API_KEY or OPENAI_API_KEY is required for the openai provider"
            ));
        }
        Ok(Self {
            label: "openai".to_string(),
            api_key,
            base_url: env
                .get_or("PP_OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: env.get_or("PP_OPENAI_MODEL", DEFAULT_OPENAI_MODEL).to_string(),
            max_tokens: env
                .get("PP_OPENAI_MAX_TOKENS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_TOKENS),
            timeout: DEFAULT_OPENAI_TIMEOUT,
        })
    }

    pub fn local_from_env(env: &EnvSnapshot) -> Self {
        Self {
            label: "local".to_string(),
            api_key: env
                .get("PP_LOCAL_API_KEY")
                .or_else(|| env.get("PP_OPENAI_API_KEY"))
                .map(str::to_string),
            base_url: env
                .get_or("PP_LOCAL_BASE_URL", DEFAULT_LOCAL_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: env.get_or("PP_LOCAL_MODEL", DEFAULT_LOCAL_MODEL).to_string(),
            max_tokens: env
                .get("PP_LOCAL_MAX_TOKENS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_TOKENS),
            timeout: Duration::from_secs(
                env.get("PP_LOCAL_TIMEOUT_SEC")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_LOCAL_TIMEOUT_SECS),
            ),
        }
    }

    fn request_completion(&self, system: &str, user: &str) -> Result<String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let mut builder = client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .json(&request)
            .send()
            .with_context(|| format!("{} proposer request failed", self.label))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!(
                "{} proposer returned {}: {}",
                self.label,
                status,
                crate::util::truncate(&body, 400)
            ));
        }

        let chat: ChatResponse = response
            .json()
            .with_context(|| format!("Failed to parse {} proposer response", self.label))?;
        chat.choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| anyhow!("{} proposer returned no choices", self.label))
    }
}

const SYSTEM_PROMPT: &str = "You repair codebases with minimal unified diff patches. \
Respond with ONLY a unified diff (optionally inside one fenced code block). \
If a usable diff is impossible, respond with a full-file rewrite instead: a \
first line of the form 'file: <relative-path>' followed by exactly one fenced \
code block containing the complete replacement file content.";

fn build_user_prompt(input: &ProposalInput) -> String {
    let mut snippet_block = String::new();
    for (key, snippet) in &input.context.snippets {
        if snippet.is_empty() {
            continue;
        }
        snippet_block.push_str(&format!("### {}\n{}\n\n", key, snippet));
    }
    let snippet_block = crate::util::truncate(&snippet_block, SNIPPET_BLOCK_MAX_CHARS);

    let mut editable_block = String::new();
    for (path, content) in input.editable_files {
        if content.is_empty() {
            continue;
        }
        editable_block.push_str(&format!("### {}\n```\n{}\n```\n\n", path, content));
    }
    let editable_block = crate::util::truncate(&editable_block, EDITABLE_BLOCK_MAX_CHARS);

    let list_or_none = |items: &[String]| {
        if items.is_empty() {
            "- (none)".to_string()
        } else {
            items
                .iter()
                .map(|item| format!("- {}", item))
                .collect::<Vec<_>>()
                .join("\n")
        }
    };

    let previous: Vec<String> = input
        .previous_attempts
        .iter()
        .rev()
        .take(PREVIOUS_ERRORS_SHOWN)
        .rev()
        .cloned()
        .collect();

    format!(
        "Rules:\n\
         1) change only files matching the allowlist and none matching the denylist.\n\
         2) minimize the change; no refactors, no dependency or lockfile edits.\n\
         3) every removed/context line must match the file snapshots exactly.\n\
         4) every hunk must contain at least one '+' or '-' line.\n\
         5) do not return an empty response while an allowlisted file can fix the failure.\n\n\
         Failing command: {command}\n\n\
         Allowlist:\n{allow}\n\
         Denylist:\n{deny}\n\
         Recent attempt errors:\n{previous}\n\
         Failing assertions:\n{assertions}\n\n\
         Failure output:\n{failure}\n\n\
         Editable file snapshots (canonical):\n{editable}\n\
         Context snippets:\n{snippets}\n",
        command = input.command,
        allow = list_or_none(input.write_allowlist),
        deny = list_or_none(input.deny_write),
        previous = list_or_none(&previous),
        assertions = list_or_none(&input.context.failing_assertions),
        failure = crate::util::truncate(&input.failure_output, FAILURE_OUTPUT_MAX_CHARS),
        editable = if editable_block.is_empty() {
            "(none)".to_string()
        } else {
            editable_block
        },
        snippets = if snippet_block.is_empty() {
            "(none)".to_string()
        } else {
            snippet_block
        },
    )
}

fn build_retry_prompt(input: &ProposalInput, previous_response: &str) -> String {
    format!(
        "Your previous response was empty or contained no effective change.\n\
         Return a NON-EMPTY unified diff now, or a single-file rewrite framed as\n\
         'file: <relative-path>' plus one fenced block with the full replacement\n\
         content. Do not repeat the rejected output.\n\n\
         Rejected response:\n{}\n\n{}",
        crate::util::truncate(previous_response, 4_000),
        build_user_prompt(input)
    )
}

/// Strip a single outer markdown fence, if present.
fn strip_markdown_fences(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return None;
    }
    let without_open = trimmed.strip_prefix("```")?;
    let after_header = match without_open.find('\n') {
        Some(newline_idx) => &without_open[newline_idx + 1..],
        None => without_open,
    };
    let end_idx = after_header.rfind("```")?;
    Some(after_header[..end_idx].trim_end().to_string())
}

/// Parse the `file: <path>` + fenced-block rewrite framing.
fn parse_rewrite_block(content: &str) -> Option<FileRewrite> {
    let trimmed = content.trim();
    let first_line = trimmed.lines().next()?;
    let path = first_line.strip_prefix("file:")?.trim();
    if path.is_empty() {
        return None;
    }
    let rest = &trimmed[first_line.len()..];
    let fence_start = rest.find("```")?;
    let after_fence = &rest[fence_start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let fence_end = body.rfind("```")?;
    let mut content = body[..fence_end].to_string();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    Some(FileRewrite {
        path: path.to_string(),
        content,
    })
}

/// Normalize raw model output into a proposal: strip fences, detect the
/// rewrite framing, and synthesize a diff from a rewrite when the current
/// file snapshot is available.
fn proposal_from_content(content: &str, editable_files: &BTreeMap<String, String>) -> Proposal {
    let stripped = strip_markdown_fences(content).unwrap_or_else(|| content.trim().to_string());

    if let Some(rewrite) = parse_rewrite_block(content) {
        let diff = editable_files
            .get(&rewrite.path)
            .map(|before| manifest::full_file_diff(&rewrite.path, before, &rewrite.content))
            .unwrap_or_default();
        return Proposal {
            diff,
            raw_response: Some(content.to_string()),
            rewrite: Some(rewrite),
        };
    }

    Proposal {
        diff: stripped,
        raw_response: Some(content.to_string()),
        rewrite: None,
    }
}

fn proposal_is_effective(proposal: &Proposal) -> bool {
    diff_has_effective_edits(&proposal.diff) || proposal.rewrite.is_some()
}

impl Proposer for OpenAiCompatibleProposer {
    fn name(&self) -> &str {
        &self.label
    }

    fn propose(&self, input: &ProposalInput) -> Result<Proposal> {
        let content = self.request_completion(SYSTEM_PROMPT, &build_user_prompt(input))?;
        let proposal = proposal_from_content(&content, input.editable_files);
        if proposal_is_effective(&proposal) {
            return Ok(proposal);
        }

        // One retry with an amended prompt, per protocol.
        let retry_content =
            self.request_completion(SYSTEM_PROMPT, &build_retry_prompt(input, &content))?;
        let retry = proposal_from_content(&retry_content, input.editable_files);
        if proposal_is_effective(&retry) {
            Ok(retry)
        } else {
            Ok(proposal)
        }
    }
}

/// Resolve a proposer by name or `PP_PROVIDER`, defaulting to the stub.
pub fn create_proposer(name: Option<&str>, env: &EnvSnapshot) -> Result<Box<dyn Proposer>> {
    let resolved = name
        .map(str::to_string)
        .or_else(|| env.get("PP_PROVIDER").map(str::to_string))
        .unwrap_or_else(|| "stub".to_string())
        .trim()
        .to_lowercase();

    match resolved.as_str() {
        "stub" => Ok(Box::new(StubProposer)),
        "openai" => Ok(Box::new(OpenAiCompatibleProposer::openai_from_env(env)?)),
        "local" | "local-openai" | "vllm" | "lmstudio" => {
            Ok(Box::new(OpenAiCompatibleProposer::local_from_env(env)))
        }
        other => Err(anyhow!("Unknown provider: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSlice;

    fn input_with_files(files: &BTreeMap<String, String>) -> ProposalInput<'_> {
        static EMPTY_CONTEXT: once_cell::sync::Lazy<ContextSlice> =
            once_cell::sync::Lazy::new(ContextSlice::default);
        ProposalInput {
            command: "pytest -q",
            failure_output: "boom".to_string(),
            context: &*EMPTY_CONTEXT,
            previous_attempts: &[],
            write_allowlist: &[],
            deny_write: &[],
            editable_files: files,
        }
    }

    #[test]
    fn stub_returns_empty_diff() {
        let files = BTreeMap::new();
        let proposal = StubProposer.propose(&input_with_files(&files)).unwrap();
        assert!(proposal.diff.is_empty());
        assert!(proposal.rewrite.is_none());
    }

    #[test]
    fn fenced_diff_is_stripped() {
        let content = "```diff\n--- a/x\n+++ b/x\n@@ -1,1 +1,1 @@\n-a\n+b\n```";
        let proposal = proposal_from_content(content, &BTreeMap::new());
        assert!(proposal.diff.starts_with("--- a/x"));
        assert!(diff_has_effective_edits(&proposal.diff));
    }

    #[test]
    fn bare_diff_passes_through() {
        let content = "--- a/x\n+++ b/x\n@@ -1,1 +1,1 @@\n-a\n+b\n";
        let proposal = proposal_from_content(content, &BTreeMap::new());
        assert_eq!(proposal.diff.trim(), content.trim());
    }

    #[test]
    fn rewrite_framing_parses_and_synthesizes_diff() {
        let mut files = BTreeMap::new();
        files.insert("app.py".to_string(), "broken\n".to_string());
        let content = "file: app.py\n```python\nfixed\n```";
        let proposal = proposal_from_content(content, &files);
        let rewrite = proposal.rewrite.as_ref().unwrap();
        assert_eq!(rewrite.path, "app.py");
        assert_eq!(rewrite.content, "fixed\n");
        assert!(proposal.diff.contains("--- a/app.py"));
        assert!(proposal.diff.contains("-broken"));
        assert!(proposal.diff.contains("+fixed"));
    }

    #[test]
    fn rewrite_without_snapshot_keeps_block_only() {
        let content = "file: unknown.py\n```\nnew content\n```";
        let proposal = proposal_from_content(content, &BTreeMap::new());
        assert!(proposal.diff.is_empty());
        assert!(proposal.rewrite.is_some());
    }

    #[test]
    fn provider_selection_defaults_to_stub() {
        let env = EnvSnapshot::from_pairs(&[]);
        let proposer = create_proposer(None, &env).unwrap();
        assert_eq!(proposer.name(), "stub");

        let env = EnvSnapshot::from_pairs(&[("PP_PROVIDER", "local")]);
        let proposer = create_proposer(None, &env).unwrap();
        assert_eq!(proposer.name(), "local");

        assert!(create_proposer(Some("nope"), &env).is_err());
    }

    #[test]
    fn openai_provider_requires_api_key() {
        let env = EnvSnapshot::from_pairs(&[]);
        assert!(OpenAiCompatibleProposer::openai_from_env(&env).is_err());

        let env = EnvSnapshot::from_pairs(&[("PP_OPENAI_API_KEY", "sk-test")]);
        let proposer = OpenAiCompatibleProposer::openai_from_env(&env).unwrap();
        assert_eq!(proposer.base_url, DEFAULT_OPENAI_BASE_URL);
        assert_eq!(proposer.model, DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn local_provider_reads_env_overrides() {
        let env = EnvSnapshot::from_pairs(&[
            ("PP_LOCAL_BASE_URL", "http://localhost:1234/v1/"),
            ("PP_LOCAL_MODEL", "custom-model"),
            ("PP_LOCAL_TIMEOUT_SEC", "30"),
        ]);
        let proposer = OpenAiCompatibleProposer::local_from_env(&env);
        assert_eq!(proposer.base_url, "http://localhost:1234/v1");
        assert_eq!(proposer.model, "custom-model");
        assert_eq!(proposer.timeout, Duration::from_secs(30));
    }

    #[test]
    fn prompt_includes_policy_lists() {
        let files = BTreeMap::new();
        let allow = vec!["src/**".to_string()];
        let deny = vec!["secrets/**".to_string()];
        let context = ContextSlice::default();
        let input = ProposalInput {
            command: "pytest -q",
            failure_output: "boom".to_string(),
            context: &context,
            previous_attempts: &[],
            write_allowlist: &allow,
            deny_write: &deny,
            editable_files: &files,
        };
        let prompt = build_user_prompt(&input);
        assert!(prompt.contains("- src/**"));
        assert!(prompt.contains("- secrets/**"));
        assert!(prompt.contains("Failing command: pytest -q"));
    }
}
