//! Ticket-flow engine (spec §4.L).
//!
//! Grounded on `codex-core::rollout`'s durable-JSON-state pattern for the
//! flow's own bookkeeping (persisted by [`crate::flow`]), and on the
//! front-matter-plus-body Markdown convention the pack's doc-chat/specingest
//! flow already assumes for every other workspace artifact.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use conductor_agent_client::TurnInput;
use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::FeatureKey;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::orchestrator;
use crate::orchestrator::StopSignal;
use crate::orchestrator::TurnRequest;
use crate::supervisor::WorkspaceSupervisor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketFrontMatter {
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub requires: Vec<String>,
}

fn default_agent() -> String {
    "codex".to_string()
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub index: u32,
    pub path: PathBuf,
    pub front_matter: TicketFrontMatter,
    pub body: String,
}

/// Splits a ticket file's YAML front-matter (delimited by `---` lines) from
/// its Markdown body.
fn split_front_matter(raw: &str) -> Result<(&str, &str)> {
    let rest = raw
        .strip_prefix("---\n")
        .ok_or_else(|| ConductorError::validation("ticket file missing front-matter delimiter"))?;
    let end = rest
        .find("\n---")
        .ok_or_else(|| ConductorError::validation("ticket file missing closing front-matter delimiter"))?;
    let front = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n');
    Ok((front, body))
}

fn ticket_index(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let digits = stem.strip_prefix("TICKET-")?;
    digits.parse().ok()
}

pub async fn parse_ticket(path: &Path) -> Result<Ticket> {
    let raw = tokio::fs::read_to_string(path).await.map_err(ConductorError::Io)?;
    let (front, body) = split_front_matter(&raw)?;
    let front_matter: TicketFrontMatter =
        serde_yaml::from_str(front).map_err(|e| ConductorError::validation(format!("invalid ticket front-matter: {e}")))?;
    let index = ticket_index(path)
        .ok_or_else(|| ConductorError::validation(format!("ticket filename is not TICKET-<NNN>.md: {}", path.display())))?;
    Ok(Ticket {
        index,
        path: path.to_path_buf(),
        front_matter,
        body: body.to_string(),
    })
}

/// Scans `ticket_dir` for `TICKET-<NNN>.md` files, returning them sorted by
/// numeric index (spec §4.L step 1).
pub async fn scan_tickets(ticket_dir: &Path) -> Result<Vec<Ticket>> {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(ticket_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ConductorError::Io(e)),
    };
    while let Some(entry) = read_dir.next_entry().await.map_err(ConductorError::Io)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("md") && ticket_index(&path).is_some() {
            entries.push(parse_ticket(&path).await?);
        }
    }
    entries.sort_by_key(|t| t.index);
    Ok(entries)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LintState {
    pub errors: Vec<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketFlowState {
    pub current_ticket: Option<String>,
    pub ticket_turns: HashMap<String, u32>,
    pub total_turns: u32,
    pub dispatch_seq: u32,
    pub reply_seq: u32,
    pub reason: Option<String>,
    pub status: String,
    pub conversation_id_by_ticket: HashMap<String, String>,
    pub lint: Option<LintState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Paused(String),
    Failed(String),
    Completed(String),
}

pub struct TicketFlowPaths {
    pub ticket_dir: PathBuf,
    pub repo_root: PathBuf,
    pub run_dir: PathBuf,
    pub threads_path: PathBuf,
}

const MAX_LINT_RETRIES_DEFAULT: u32 = 3;

/// Resolves a `requires` entry: bare filenames resolve relative to
/// `ticket_dir` first, then `repo_root` (spec §4.L step 3).
fn resolve_requires(paths: &TicketFlowPaths, requirement: &str) -> PathBuf {
    let candidate = paths.ticket_dir.join(requirement);
    if candidate.exists() {
        return candidate;
    }
    paths.repo_root.join(requirement)
}

/// Advances the ticket-flow state machine by exactly one step (spec §4.L's
/// 9-step `step()` contract).
pub async fn step(
    supervisor: &WorkspaceSupervisor,
    paths: &TicketFlowPaths,
    state: &mut TicketFlowState,
    max_lint_retries: Option<u32>,
) -> Result<StepResult> {
    let max_lint_retries = max_lint_retries.unwrap_or(MAX_LINT_RETRIES_DEFAULT);

    // Step 1: scan tickets.
    let tickets = scan_tickets(&paths.ticket_dir).await?;
    if tickets.is_empty() {
        return Ok(StepResult::Paused("No tickets found".to_string()));
    }

    // Step 9 (checked early too): completion.
    if tickets.iter().all(|t| t.front_matter.done) {
        return Ok(StepResult::Completed("All tickets done".to_string()));
    }

    // Step 2: select the next unblocked ticket.
    let ticket = tickets
        .iter()
        .find(|t| !t.front_matter.done)
        .expect("at least one ticket is not done, checked above");
    let ticket_key = ticket
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| ticket.path.to_string_lossy().to_string());

    // Step 3: check requires.
    let mut missing = Vec::new();
    for requirement in &ticket.front_matter.requires {
        let resolved = resolve_requires(paths, requirement);
        if !resolved.exists() {
            missing.push(requirement.clone());
        }
    }
    if !missing.is_empty() {
        return Ok(StepResult::Paused(format!(
            "Missing required input files: {}",
            missing.join(", ")
        )));
    }

    state.current_ticket = Some(ticket_key.clone());

    // Step 4: gather pending replies.
    let reply_section = gather_pending_replies(&paths.run_dir, state).await?;

    // Step 5: run a turn on the ticket's declared agent.
    let agent = resolve_agent(&ticket.front_matter.agent);
    let lint_block = state
        .lint
        .as_ref()
        .map(|l| format!("\nLint errors from the previous attempt:\n{}\n", l.errors.join("\n")))
        .unwrap_or_default();
    let prompt = format!(
        "Ticket: {}\nGoal: {}\n\n{}\n{}{}",
        ticket.front_matter.title, ticket.front_matter.goal, ticket.body, reply_section, lint_block
    );

    let feature_key =
        FeatureKey::parse(&format!("autorunner.{agent}")).or_else(|_| FeatureKey::parse("autorunner")).map_err(ConductorError::validation)?;

    let request = TurnRequest {
        workspace_root: &paths.repo_root,
        feature_key,
        prompt: TurnInput::Text(prompt),
        model: None,
        effort: None,
        approval_policy: ApprovalPolicy::OnFailure,
        sandbox_policy: SandboxPolicy::WorkspaceWrite,
        timeout: Some(Duration::from_secs(60 * 60)),
        stop: StopSignal::new(),
    };
    let turn_result = orchestrator::run_turn(supervisor, &paths.threads_path, request).await?;
    state.total_turns += 1;
    state
        .conversation_id_by_ticket
        .entry(ticket_key.clone())
        .or_insert_with(|| turn_result.thread_id.0.clone());

    // Step 6: re-read the ticket; a parse failure is a lint failure.
    let reparsed = parse_ticket(&ticket.path).await;
    if let Err(e) = &reparsed {
        let lint = state.lint.get_or_insert_with(LintState::default);
        lint.errors = vec![e.to_string()];
        lint.consecutive_failures += 1;
        if lint.consecutive_failures > max_lint_retries {
            return Ok(StepResult::Failed(format!(
                "ticket {ticket_key} failed lint {max_lint_retries} times consecutively"
            )));
        }
        return Ok(StepResult::Continue);
    }
    state.lint = None;
    let reparsed = reparsed.expect("checked Err above");

    // Step 7: detect dispatch.
    let dispatch_path = paths.run_dir.join("DISPATCH.md");
    if tokio::fs::metadata(&dispatch_path).await.is_ok() {
        let dispatch_front = read_dispatch_front_matter(&dispatch_path).await.unwrap_or_default();
        archive_dispatch(paths, state).await?;
        if dispatch_front.mode == "pause" {
            return Ok(StepResult::Paused("dispatch".to_string()));
        }
        return Ok(StepResult::Continue);
    }

    // Step 8: advance or increment turn count.
    if reparsed.front_matter.done {
        state.current_ticket = None;
    } else {
        *state.ticket_turns.entry(ticket_key).or_insert(0) += 1;
    }

    Ok(StepResult::Continue)
}

fn resolve_agent(raw: &str) -> String {
    match raw {
        "codex" | "opencode" => raw.to_string(),
        other => {
            warn!(agent = other, "unknown ticket agent, defaulting to codex");
            "codex".to_string()
        }
    }
}

async fn gather_pending_replies(run_dir: &Path, state: &mut TicketFlowState) -> Result<String> {
    let reply_dir = run_dir.join("reply_history");
    let mut entries = match tokio::fs::read_dir(&reply_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(ConductorError::Io(e)),
    };
    let mut seqs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(ConductorError::Io)? {
        if let Some(seq) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
            if seq > state.reply_seq {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    let mut section = String::new();
    for seq in seqs {
        let reply_path = reply_dir.join(format!("{seq:04}")).join("USER_REPLY.md");
        if let Ok(content) = tokio::fs::read_to_string(&reply_path).await {
            section.push_str(&format!("[USER_REPLY {seq}]\n{content}\n"));
        }
        state.reply_seq = seq;
    }
    Ok(section)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DispatchFrontMatter {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    title: String,
}

async fn read_dispatch_front_matter(path: &Path) -> Result<DispatchFrontMatter> {
    let raw = tokio::fs::read_to_string(path).await.map_err(ConductorError::Io)?;
    let (front, _) = split_front_matter(&raw)?;
    serde_yaml::from_str(front).map_err(|e| ConductorError::validation(format!("invalid dispatch front-matter: {e}")))
}

/// Archives `DISPATCH.md` + its `dispatch/` sibling to
/// `dispatch_history/<seq:04d>/`, then archives a turn-summary entry at
/// `seq+1` (spec §4.L step 7, invariant: `dispatch_seq` strictly increases
/// and archives are never overwritten).
async fn archive_dispatch(paths: &TicketFlowPaths, state: &mut TicketFlowState) -> Result<()> {
    let seq = state.dispatch_seq;
    let dest = paths.run_dir.join("dispatch_history").join(format!("{seq:04}"));
    if tokio::fs::metadata(&dest).await.is_ok() {
        return Err(ConductorError::Fatal(format!(
            "dispatch archive collision at seq {seq}: {}",
            dest.display()
        )));
    }
    tokio::fs::create_dir_all(&dest).await.map_err(ConductorError::Io)?;

    let dispatch_src = paths.run_dir.join("DISPATCH.md");
    tokio::fs::rename(&dispatch_src, dest.join("DISPATCH.md")).await.map_err(ConductorError::Io)?;

    let sibling_src = paths.run_dir.join("dispatch");
    if tokio::fs::metadata(&sibling_src).await.is_ok() {
        tokio::fs::rename(&sibling_src, dest.join("dispatch")).await.map_err(ConductorError::Io)?;
    }

    let summary_seq = seq + 1;
    let summary_dest = paths.run_dir.join("dispatch_history").join(format!("{summary_seq:04}"));
    if tokio::fs::metadata(&summary_dest).await.is_ok() {
        return Err(ConductorError::Fatal(format!(
            "dispatch archive collision at seq {summary_seq}: {}",
            summary_dest.display()
        )));
    }
    tokio::fs::create_dir_all(&summary_dest).await.map_err(ConductorError::Io)?;
    tokio::fs::write(summary_dest.join("TURN_SUMMARY.md"), "Turn summary: dispatch archived.\n")
        .await
        .map_err(ConductorError::Io)?;

    state.dispatch_seq = summary_seq + 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn scan_tickets_sorts_by_numeric_index() {
        let dir = tempdir().expect("tempdir");
        tokio::fs::write(
            dir.path().join("TICKET-002.md"),
            "---\nagent: codex\ndone: false\ntitle: Second\ngoal: g\nrequires: []\n---\nbody\n",
        )
        .await
        .expect("write");
        tokio::fs::write(
            dir.path().join("TICKET-001.md"),
            "---\nagent: codex\ndone: false\ntitle: First\ngoal: g\nrequires: []\n---\nbody\n",
        )
        .await
        .expect("write");

        let tickets = scan_tickets(dir.path()).await.expect("scan");
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].front_matter.title, "First");
        assert_eq!(tickets[1].front_matter.title, "Second");
    }

    #[test]
    fn resolve_agent_defaults_unknown_to_codex() {
        assert_eq!(resolve_agent("opencode"), "opencode");
        assert_eq!(resolve_agent("some-unknown-agent"), "codex");
    }
}
