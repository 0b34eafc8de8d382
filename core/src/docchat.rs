//! Doc-chat service (spec §4.I, doc-chat half).
//!
//! Grounded on `codex-core`'s exec-then-parse-final-message pattern for
//! single-turn tool invocations, composed here with (G) for the turn and
//! (H) for whitelist enforcement. Five independent per-kind locks give each
//! doc kind its own single-concurrent-holder slot (spec §4.I).

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conductor_agent_client::TurnInput;
use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::FeatureKey;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;
use tokio::sync::Mutex;

use crate::orchestrator;
use crate::orchestrator::StopSignal;
use crate::orchestrator::TurnRequest;
use crate::patch;
use crate::supervisor::WorkspaceSupervisor;

const PROMPT_MAX_CHARS: usize = 12_000;
const DOC_EXCERPT_MAX_CHARS: usize = 6_000;
const PREV_SUMMARY_MAX_CHARS: usize = 2_000;

fn doc_filename_for_kind(kind: &str) -> Result<&'static str> {
    match kind {
        "todo" => Ok("TODO.md"),
        "progress" => Ok("PROGRESS.md"),
        "opinions" => Ok("OPINIONS.md"),
        "spec" => Ok("SPEC.md"),
        "summary" => Ok("SUMMARY.md"),
        other => Err(ConductorError::validation(format!("unknown doc-chat kind: {other}"))),
    }
}

pub struct DocChatResponse {
    pub kind: String,
    pub agent_message: String,
    pub content: String,
    pub patch: String,
}

/// Per-workspace doc-chat orchestration: one lock slot per doc kind.
pub struct DocChatService {
    workspace_root: PathBuf,
    locks: HashMap<&'static str, Mutex<()>>,
}

impl DocChatService {
    pub fn new(workspace_root: PathBuf) -> Self {
        let mut locks = HashMap::new();
        for kind in ["todo", "progress", "opinions", "spec", "summary"] {
            locks.insert(kind, Mutex::new(()));
        }
        DocChatService { workspace_root, locks }
    }

    fn patch_path(&self) -> PathBuf {
        self.workspace_root.join(".conductor").join("doc-chat.patch")
    }

    /// Runs the prompt → turn → patch-extraction → store flow for one doc
    /// kind (spec §4.I steps 1-6). Returns *Busy* if that kind's lock is
    /// already held.
    pub async fn execute(
        &self,
        supervisor: &WorkspaceSupervisor,
        threads_path: &Path,
        kind: &str,
        message: &str,
    ) -> Result<DocChatResponse> {
        let feature_key = FeatureKey::doc_chat(kind).map_err(ConductorError::validation)?;
        let doc_name = doc_filename_for_kind(kind)?;
        let lock = self
            .locks
            .get(kind)
            .ok_or_else(|| ConductorError::validation(format!("unknown doc-chat kind: {kind}")))?;
        let _guard = lock
            .try_lock()
            .map_err(|_| ConductorError::busy(format!("doc-chat is already running for kind {kind}")))?;

        let doc_path = self.workspace_root.join(doc_name);
        let doc_excerpt = read_truncated(&doc_path, DOC_EXCERPT_MAX_CHARS).await;
        let prompt = build_prompt(kind, doc_name, &doc_excerpt, message);

        let request = TurnRequest {
            workspace_root: &self.workspace_root,
            feature_key,
            prompt: TurnInput::Text(prompt),
            model: None,
            effort: None,
            approval_policy: ApprovalPolicy::Never,
            sandbox_policy: SandboxPolicy::ReadOnly,
            timeout: Some(Duration::from_secs(10 * 60)),
            stop: StopSignal::new(),
        };
        let turn_result = orchestrator::run_turn(supervisor, threads_path, request).await?;
        let output = turn_result.output();
        let (agent_message, raw_patch) =
            extract_message_and_patch(&output).ok_or_else(|| ConductorError::agent_error("no patch found in agent output"))?;

        let (envelope, targets) = patch::normalize_patch_text(&raw_patch)?;
        let whitelist = vec![PathBuf::from(doc_name)];
        let normalized_targets = patch::ensure_patch_targets_allowed(&targets, &whitelist)?;
        let preview = patch::preview_patch(&self.workspace_root, &envelope, &normalized_targets)?;
        let content = preview
            .get(&PathBuf::from(doc_name))
            .cloned()
            .unwrap_or_default();

        tokio::fs::create_dir_all(self.workspace_root.join(".conductor"))
            .await
            .map_err(ConductorError::Io)?;
        tokio::fs::write(self.patch_path(), &envelope).await.map_err(ConductorError::Io)?;

        Ok(DocChatResponse {
            kind: kind.to_string(),
            agent_message,
            content,
            patch: envelope,
        })
    }

    /// Applies the stored pending patch and removes it.
    pub async fn apply(&self, kind: &str) -> Result<()> {
        let doc_name = doc_filename_for_kind(kind)?;
        let envelope = tokio::fs::read_to_string(self.patch_path())
            .await
            .map_err(|_| ConductorError::validation("no pending doc-chat patch"))?;
        let whitelist = vec![PathBuf::from(doc_name)];
        let (_, targets) = patch::normalize_patch_text(&envelope)?;
        let normalized = patch::ensure_patch_targets_allowed(&targets, &whitelist)?;
        patch::apply_patch_file(&self.workspace_root, &envelope, &normalized)?;
        let _ = tokio::fs::remove_file(self.patch_path()).await;
        Ok(())
    }

    /// Discards the stored pending patch without applying it.
    pub async fn discard(&self) -> Result<()> {
        let _ = tokio::fs::remove_file(self.patch_path()).await;
        Ok(())
    }
}

async fn read_truncated(path: &Path, max_chars: usize) -> String {
    let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
    truncate_tail(&contents, max_chars)
}

fn truncate_tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        s.chars().skip(count - max_chars).collect()
    }
}

/// Builds the doc-chat prompt, dropping sections by priority order when the
/// total exceeds [`PROMPT_MAX_CHARS`]: recent-run-summary first, then the
/// target-doc excerpt, never the user's message.
fn build_prompt(kind: &str, doc_name: &str, doc_excerpt: &str, message: &str) -> String {
    let mut recent_summary = String::new();
    let mut doc_excerpt = truncate_tail(doc_excerpt, DOC_EXCERPT_MAX_CHARS);
    let message_section = format!("User message:\n{message}\n");

    loop {
        let prompt = render_prompt(kind, doc_name, &recent_summary, &doc_excerpt, &message_section);
        if prompt.chars().count() <= PROMPT_MAX_CHARS || (recent_summary.is_empty() && doc_excerpt.is_empty()) {
            return prompt;
        }
        if !recent_summary.is_empty() {
            recent_summary.clear();
            continue;
        }
        let half = doc_excerpt.chars().count() / 2;
        doc_excerpt = truncate_tail(&doc_excerpt, half.max(PREV_SUMMARY_MAX_CHARS.min(doc_excerpt.chars().count())));
        if doc_excerpt.is_empty() {
            return render_prompt(kind, doc_name, &recent_summary, &doc_excerpt, &message_section);
        }
    }
}

fn render_prompt(kind: &str, doc_name: &str, recent_summary: &str, doc_excerpt: &str, message_section: &str) -> String {
    let mut out = format!("You are editing {doc_name} (doc-chat kind: {kind}).\n");
    if !recent_summary.is_empty() {
        out.push_str("Recent run summary:\n");
        out.push_str(recent_summary);
        out.push('\n');
    }
    out.push_str("Current document content:\n");
    out.push_str(doc_excerpt);
    out.push('\n');
    out.push_str(message_section);
    out.push_str(
        "\nReply with a short message describing the change, followed by a patch wrapped in <PATCH>...</PATCH> tags.\n",
    );
    out
}

/// Parses an agent's final message into `(message, patch)` per spec §4.I
/// step 3: `<PATCH>...</PATCH>`, a fenced code block, or a raw diff/envelope
/// starting at the first `--- ` or `*** Begin Patch` line.
pub fn extract_message_and_patch(output: &str) -> Option<(String, String)> {
    if let Some(start) = output.find("<PATCH>") {
        let after = start + "<PATCH>".len();
        let end = output[after..].find("</PATCH>")? + after;
        let message = output[..start].trim().to_string();
        let patch = output[after..end].trim().to_string();
        return Some((message, patch));
    }
    if let Some(fence_start) = output.find("```") {
        let body_start = output[fence_start + 3..]
            .find('\n')
            .map(|n| fence_start + 3 + n + 1)
            .unwrap_or(fence_start + 3);
        let fence_end = output[body_start..].find("```")? + body_start;
        let message = output[..fence_start].trim().to_string();
        let patch = output[body_start..fence_end].trim().to_string();
        return Some((message, patch));
    }
    for marker in ["--- ", "*** Begin Patch"] {
        if let Some(idx) = output.find(marker) {
            let message = output[..idx].trim().to_string();
            let patch = output[idx..].trim().to_string();
            return Some((message, patch));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_patch_tag_delimited_block() {
        let output = "Agent: added test task\n<PATCH>\n--- a/TODO.md\n+++ b/TODO.md\n@@\n-old\n+new\n</PATCH>";
        let (message, patch) = extract_message_and_patch(output).expect("parses");
        assert_eq!(message, "Agent: added test task");
        assert!(patch.starts_with("--- a/TODO.md"));
    }

    #[test]
    fn returns_none_without_any_delimiter() {
        assert!(extract_message_and_patch("just talking, no patch here").is_none());
    }

    #[test]
    fn doc_filename_mapping_covers_all_kinds() {
        for kind in ["todo", "progress", "opinions", "spec", "summary"] {
            assert!(doc_filename_for_kind(kind).is_ok());
        }
        assert!(doc_filename_for_kind("bogus").is_err());
    }
}
